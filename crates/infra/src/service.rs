//! Service assembly: stores, case number sequence, event bus, orchestrators,
//! booking and the notification pipeline, built from a [`ConsularConfig`].
//!
//! | Setting | Effect |
//! |---|---|
//! | `database_url` | Postgres stores and sequence (in-memory otherwise) |
//! | `redis_url` | Redis pub/sub transport (in-process bus otherwise) |
//! | `scheduling_rules` | slot allocator rules |
//! | `delivery_timeout` | outbound channel timeout of the dispatcher |
//! | `notify_workers`, `queue_poll_interval` | notification worker threads |

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use consular_appointments::Appointment;
use consular_civil_registry::CivilRegistration;
use consular_events::{EventBus, InMemoryBusError, InMemoryEventBus, Subscription, TransitionEvent};
use consular_notarial::NotarialService;
use consular_processes::GenericProcess;
use consular_visa::VisaApplication;

#[cfg(feature = "redis")]
use crate::event_bus::{RedisBusError, RedisPubSubEventBus};

use crate::booking::AppointmentBooking;
use crate::case_store::{
    CaseNumberSequence, CaseStore, InMemoryCaseSequence, InMemoryCaseStore, PostgresCaseSequence,
    PostgresCaseStore, ensure_schema,
};
use crate::config::ConsularConfig;
use crate::external::{CertificateRenderer, ObjectStore, OutboundChannel};
use crate::notifications::{
    CaseLookup, CitizenDirectory, NotificationDispatcher, NotificationLog, NotificationWorker,
    NotificationWorkerConfig, NotificationWorkerHandle, PreferenceStore, TemplateCatalog,
};
use crate::orchestrator::{CertificateIssuer, TransitionOrchestrator};

/// Redis channel carrying transition events.
pub const EVENT_CHANNEL: &str = "consular.transitions";

pub type SharedStore<C> = Arc<dyn CaseStore<C>>;
pub type SharedBus = Arc<ServiceBus>;
pub type Orchestrator<C> = TransitionOrchestrator<C, SharedStore<C>, SharedBus>;

/// The event transport selected by configuration.
#[derive(Debug)]
pub enum ServiceBus {
    InProcess(InMemoryEventBus<TransitionEvent>),
    #[cfg(feature = "redis")]
    Redis(RedisPubSubEventBus),
}

#[derive(Debug, Error)]
pub enum ServiceBusError {
    #[error("in-process bus failed: {0:?}")]
    InProcess(InMemoryBusError),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] RedisBusError),
}

impl EventBus<TransitionEvent> for ServiceBus {
    type Error = ServiceBusError;

    fn publish(&self, message: TransitionEvent) -> Result<(), Self::Error> {
        match self {
            ServiceBus::InProcess(bus) => bus.publish(message).map_err(ServiceBusError::InProcess),
            #[cfg(feature = "redis")]
            ServiceBus::Redis(bus) => Ok(bus.publish(message)?),
        }
    }

    fn subscribe(&self) -> Subscription<TransitionEvent> {
        match self {
            ServiceBus::InProcess(bus) => bus.subscribe(),
            #[cfg(feature = "redis")]
            ServiceBus::Redis(bus) => bus.subscribe(),
        }
    }
}

/// External collaborators the services are built around.
#[derive(Clone)]
pub struct Collaborators {
    pub citizens: Arc<dyn CitizenDirectory>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub log: Arc<dyn NotificationLog>,
    pub channel: Arc<dyn OutboundChannel>,
    pub renderer: Arc<dyn CertificateRenderer>,
    pub objects: Arc<dyn ObjectStore>,
}

struct Stores {
    visas: SharedStore<VisaApplication>,
    registrations: SharedStore<CivilRegistration>,
    notarial: SharedStore<NotarialService>,
    processes: SharedStore<GenericProcess>,
    appointments: SharedStore<Appointment>,
    sequence: Arc<dyn CaseNumberSequence>,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            visas: Arc::new(InMemoryCaseStore::new()),
            registrations: Arc::new(InMemoryCaseStore::new()),
            notarial: Arc::new(InMemoryCaseStore::new()),
            processes: Arc::new(InMemoryCaseStore::new()),
            appointments: Arc::new(InMemoryCaseStore::new()),
            sequence: Arc::new(InMemoryCaseSequence::new()),
        }
    }

    fn postgres(pool: PgPool) -> Self {
        Self {
            visas: Arc::new(PostgresCaseStore::new(pool.clone())),
            registrations: Arc::new(PostgresCaseStore::new(pool.clone())),
            notarial: Arc::new(PostgresCaseStore::new(pool.clone())),
            processes: Arc::new(PostgresCaseStore::new(pool.clone())),
            appointments: Arc::new(PostgresCaseStore::new(pool.clone())),
            sequence: Arc::new(PostgresCaseSequence::new(pool)),
        }
    }
}

/// Everything a consulate deployment runs, wired together.
pub struct ConsularServices {
    pub visas: Orchestrator<VisaApplication>,
    pub registrations: Orchestrator<CivilRegistration>,
    pub notarial: Orchestrator<NotarialService>,
    pub processes: Orchestrator<GenericProcess>,
    pub appointments: AppointmentBooking<SharedStore<Appointment>, SharedBus>,
    pub dispatcher: Arc<NotificationDispatcher>,
    bus: SharedBus,
    worker_config: NotificationWorkerConfig,
}

impl ConsularServices {
    /// Build on in-memory stores, whatever `database_url` says.
    pub fn in_memory(config: &ConsularConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        Self::assemble(config, collaborators, Stores::in_memory())
    }

    /// Build from `config`: Postgres stores when `database_url` is set
    /// (schema installed on connect), in-memory stores otherwise.
    ///
    /// Postgres-backed services must be driven from a multi-thread tokio
    /// runtime.
    pub async fn connect(config: &ConsularConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        let Some(url) = config.database_url.as_deref() else {
            return Self::in_memory(config, collaborators);
        };
        let pool = PgPool::connect(url)
            .await
            .context("connecting to DATABASE_URL")?;
        ensure_schema(&pool)
            .await
            .context("installing the case store schema")?;
        Self::assemble(config, collaborators, Stores::postgres(pool))
    }

    fn assemble(
        config: &ConsularConfig,
        collaborators: Collaborators,
        stores: Stores,
    ) -> anyhow::Result<Self> {
        let bus: SharedBus = Arc::new(event_bus(config)?);
        let allocator = config.slot_allocator()?;
        let issuer = CertificateIssuer::new(collaborators.renderer, collaborators.objects);
        let sequence = stores.sequence;

        let cases = CaseLookup::new()
            .with_store::<VisaApplication, _>(stores.visas.clone())
            .with_store::<CivilRegistration, _>(stores.registrations.clone())
            .with_store::<NotarialService, _>(stores.notarial.clone())
            .with_store::<GenericProcess, _>(stores.processes.clone())
            .with_store::<Appointment, _>(stores.appointments.clone());
        let dispatcher = NotificationDispatcher::new(
            TemplateCatalog::standard(),
            cases,
            collaborators.citizens,
            collaborators.preferences,
            collaborators.log,
            collaborators.channel,
        )
        .with_delivery_timeout(config.delivery_timeout);

        info!(
            postgres = config.database_url.is_some(),
            redis = config.redis_url.is_some(),
            notify_workers = config.notify_workers,
            delivery_timeout_ms = config.delivery_timeout.as_millis() as u64,
            "consular services assembled"
        );

        Ok(Self {
            visas: TransitionOrchestrator::new(stores.visas, bus.clone(), sequence.clone()),
            registrations: TransitionOrchestrator::new(stores.registrations, bus.clone(), sequence.clone())
                .with_certificates(issuer.clone()),
            notarial: TransitionOrchestrator::new(stores.notarial, bus.clone(), sequence.clone())
                .with_certificates(issuer),
            processes: TransitionOrchestrator::new(stores.processes, bus.clone(), sequence.clone()),
            appointments: AppointmentBooking::new(
                TransitionOrchestrator::new(stores.appointments, bus.clone(), sequence),
                allocator,
            ),
            dispatcher: Arc::new(dispatcher),
            bus,
            worker_config: config.worker_config(),
        })
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    pub fn worker_config(&self) -> &NotificationWorkerConfig {
        &self.worker_config
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.dispatcher.delivery_timeout()
    }

    /// Start the configured notification workers on the service bus.
    pub fn spawn_workers(&self) -> io::Result<NotificationWorkerHandle> {
        NotificationWorker::spawn(&self.bus, self.dispatcher.clone(), self.worker_config.clone())
    }
}

fn event_bus(config: &ConsularConfig) -> anyhow::Result<ServiceBus> {
    match config.redis_url.as_deref() {
        None => Ok(ServiceBus::InProcess(InMemoryEventBus::new())),
        #[cfg(feature = "redis")]
        Some(url) => Ok(ServiceBus::Redis(
            RedisPubSubEventBus::new(url, EVENT_CHANNEL).context("opening REDIS_URL")?,
        )),
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("REDIS_URL is set but consular-infra was built without the `redis` feature"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;
    use std::time::Instant;

    use chrono::{NaiveDate, Utc};
    use consular_appointments::AppointmentType;
    use consular_core::{Case, CaseId, CitizenId, UserId};
    use consular_processes::ProcessState;

    use crate::external::{InMemoryObjectStore, JsonCertificateRenderer, RecordingChannel};
    use crate::notifications::{
        DispatchOutcome, InMemoryCitizenDirectory, InMemoryNotificationLog, InMemoryPreferenceStore,
    };

    struct Fixture {
        collaborators: Collaborators,
        citizens: Arc<InMemoryCitizenDirectory>,
        channel: Arc<RecordingChannel>,
    }

    fn fixture(channel: RecordingChannel) -> Fixture {
        let citizens = Arc::new(InMemoryCitizenDirectory::new());
        let channel = Arc::new(channel);
        let collaborators = Collaborators {
            citizens: citizens.clone(),
            preferences: Arc::new(InMemoryPreferenceStore::new()),
            log: Arc::new(InMemoryNotificationLog::new()),
            channel: channel.clone(),
            renderer: Arc::new(JsonCertificateRenderer),
            objects: Arc::new(InMemoryObjectStore::new()),
        };
        Fixture {
            collaborators,
            citizens,
            channel,
        }
    }

    fn config(vars: &[(&str, &str)]) -> ConsularConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConsularConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    fn new_process(citizen: CitizenId) -> GenericProcess {
        GenericProcess::new(CaseId::new(), citizen, "Attestation", "misc", Utc::now()).unwrap()
    }

    #[test]
    fn settings_reach_dispatcher_and_workers() {
        let f = fixture(RecordingChannel::new());
        let services = ConsularServices::in_memory(
            &config(&[
                ("CONSULAR_NOTIFY_WORKERS", "3"),
                ("CONSULAR_QUEUE_POLL_MS", "40"),
                ("CONSULAR_DELIVERY_TIMEOUT_MS", "1500"),
            ]),
            f.collaborators,
        )
        .unwrap();

        assert_eq!(services.delivery_timeout(), Duration::from_millis(1500));
        assert_eq!(services.worker_config().workers, 3);
        assert_eq!(services.worker_config().poll_interval, Duration::from_millis(40));
        assert!(matches!(**services.bus(), ServiceBus::InProcess(_)));
    }

    #[test]
    fn configured_delivery_timeout_applies_to_sends() {
        let f = fixture(RecordingChannel::new().with_latency(Duration::from_millis(200)));
        let services = ConsularServices::in_memory(
            &config(&[("CONSULAR_DELIVERY_TIMEOUT_MS", "20")]),
            f.collaborators,
        )
        .unwrap();
        let citizen = CitizenId::new();
        f.citizens.set(citizen, "ana@example.org");
        let events = services.bus().subscribe();

        let case = services.processes.create(new_process(citizen), UserId::new()).unwrap();
        let actor = UserId::new();
        for target in [ProcessState::Submitted, ProcessState::UnderReview, ProcessState::Approved] {
            services
                .processes
                .apply_transition(case.id(), target, actor, None)
                .unwrap();
        }

        let approved = std::iter::from_fn(|| events.try_recv().ok())
            .find(|e| e.new_state == "APPROVED")
            .unwrap();
        assert!(matches!(
            services.dispatcher.handle(&approved),
            DispatchOutcome::Failed { .. }
        ));
    }

    #[test]
    fn scheduling_rules_file_feeds_the_allocator() {
        let path = std::env::temp_dir().join(format!("consular-rules-{}.json", CaseId::new()));
        std::fs::write(
            &path,
            r#"{"consultation": {"weekdays": ["Wed"], "blocks": [{"start": "10:00", "end": "11:00"}], "slot_minutes": 20}}"#,
        )
        .unwrap();
        let f = fixture(RecordingChannel::new());
        let services = ConsularServices::in_memory(
            &config(&[("CONSULAR_SCHEDULING_RULES", path.to_str().unwrap())]),
            f.collaborators,
        )
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        // 2026-11-04 is a Wednesday.
        let wednesday = NaiveDate::from_ymd_opt(2026, 11, 4).unwrap();
        let slots = services
            .appointments
            .available_slots(wednesday, AppointmentType::Consultation)
            .unwrap();
        assert_eq!(slots.len(), 3);
        assert!(services
            .appointments
            .available_slots(wednesday, AppointmentType::VisaInterview)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn connect_without_database_url_runs_in_memory() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let f = fixture(RecordingChannel::new());
        let services = runtime
            .block_on(ConsularServices::connect(&config(&[]), f.collaborators))
            .unwrap();

        let year = Utc::now().format("%Y").to_string();
        let case = services
            .processes
            .create(new_process(CitizenId::new()), UserId::new())
            .unwrap();
        assert_eq!(
            case.header().case_number().unwrap().as_str(),
            format!("PRC-{year}-000001")
        );
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn redis_url_without_redis_support_is_an_error() {
        let f = fixture(RecordingChannel::new());
        let result = ConsularServices::in_memory(
            &config(&[("REDIS_URL", "redis://localhost:6379")]),
            f.collaborators,
        );
        assert!(result.is_err());
    }

    #[test]
    fn spawned_workers_deliver_booking_notifications() {
        let f = fixture(RecordingChannel::new());
        let services = ConsularServices::in_memory(
            &config(&[("CONSULAR_NOTIFY_WORKERS", "1"), ("CONSULAR_QUEUE_POLL_MS", "10")]),
            f.collaborators,
        )
        .unwrap();
        let citizen = CitizenId::new();
        f.citizens.set(citizen, "ana@example.org");
        let handle = services.spawn_workers().unwrap();

        // 2026-11-02 is a Monday.
        let slot = NaiveDate::from_ymd_opt(2026, 11, 2)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        services
            .appointments
            .book(citizen, AppointmentType::VisaInterview, slot, "Window 1", UserId::new())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.channel.sent().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_id, "appointment.booked");
    }
}
