//! Integration tests for the full case pipeline.
//!
//! Tests: Orchestrator → CaseStore → EventBus → NotificationWorker → Channel
//!
//! Verifies:
//! - Transitions follow each workflow graph and leave an exact audit trail
//! - Failed transitions leave no trace (state, history, events)
//! - Booking conflicts hold under concurrent requests
//! - Notifications are delivered off the transition path and never fail it

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::{NaiveDate, NaiveDateTime, Utc};

    use consular_appointments::{Appointment, AppointmentState, AppointmentType, SlotAllocator};
    use consular_core::{Case, CaseId, CitizenId, UserId};
    use consular_events::{EventBus, InMemoryEventBus, TransitionEvent};
    use consular_notarial::{NotarialKind, NotarialService, NotarialState};
    use consular_processes::{GenericProcess, ProcessState};
    use consular_visa::{VisaApplication, VisaCategory, VisaState};

    use crate::booking::AppointmentBooking;
    use crate::case_store::{InMemoryCaseSequence, InMemoryCaseStore};
    use crate::external::{
        DeliveryError, InMemoryObjectStore, JsonCertificateRenderer, RecordingChannel,
    };
    use crate::notifications::{
        CaseLookup, DeliveryStatus, DispatchOutcome, InMemoryCitizenDirectory, InMemoryNotificationLog,
        InMemoryPreferenceStore, NotificationDispatcher, NotificationLog, NotificationWorker,
        NotificationWorkerConfig, TemplateCatalog,
    };
    use crate::orchestrator::{
        CertificateIssuer, OrchestratorError, SYSTEM_CANCELLED, TransitionOrchestrator,
    };

    type Bus = Arc<InMemoryEventBus<TransitionEvent>>;
    type Store<C> = Arc<InMemoryCaseStore<C>>;
    type Orchestrator<C> = TransitionOrchestrator<C, Store<C>, Bus>;

    struct System {
        bus: Bus,
        visas: Orchestrator<VisaApplication>,
        processes: Orchestrator<GenericProcess>,
        notarial: Orchestrator<NotarialService>,
        booking: AppointmentBooking<Store<Appointment>, Bus>,
        objects: Arc<InMemoryObjectStore>,
        citizens: Arc<InMemoryCitizenDirectory>,
        prefs: Arc<InMemoryPreferenceStore>,
        log: Arc<InMemoryNotificationLog>,
        channel: Arc<RecordingChannel>,
        dispatcher: Arc<NotificationDispatcher>,
    }

    fn setup() -> System {
        consular_observability::init();

        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let sequence = Arc::new(InMemoryCaseSequence::new());
        let objects = Arc::new(InMemoryObjectStore::new());

        let visa_store: Store<VisaApplication> = Arc::new(InMemoryCaseStore::new());
        let process_store: Store<GenericProcess> = Arc::new(InMemoryCaseStore::new());
        let notarial_store: Store<NotarialService> = Arc::new(InMemoryCaseStore::new());
        let appointment_store: Store<Appointment> = Arc::new(InMemoryCaseStore::new());

        let visas = TransitionOrchestrator::new(visa_store.clone(), bus.clone(), sequence.clone());
        let processes =
            TransitionOrchestrator::new(process_store.clone(), bus.clone(), sequence.clone());
        let notarial = TransitionOrchestrator::new(notarial_store.clone(), bus.clone(), sequence.clone())
            .with_certificates(CertificateIssuer::new(
                Arc::new(JsonCertificateRenderer),
                objects.clone(),
            ));
        let booking = AppointmentBooking::new(
            TransitionOrchestrator::new(appointment_store.clone(), bus.clone(), sequence),
            SlotAllocator::with_default_rules(),
        );

        let citizens = Arc::new(InMemoryCitizenDirectory::new());
        let prefs = Arc::new(InMemoryPreferenceStore::new());
        let log = Arc::new(InMemoryNotificationLog::new());
        let channel = Arc::new(RecordingChannel::new());
        let cases = CaseLookup::new()
            .with_store::<VisaApplication, _>(visa_store)
            .with_store::<GenericProcess, _>(process_store)
            .with_store::<NotarialService, _>(notarial_store)
            .with_store::<Appointment, _>(appointment_store);
        let dispatcher = Arc::new(
            NotificationDispatcher::new(
                TemplateCatalog::standard(),
                cases,
                citizens.clone(),
                prefs.clone(),
                log.clone(),
                channel.clone(),
            )
            .with_delivery_timeout(Duration::from_millis(200)),
        );

        System {
            bus,
            visas,
            processes,
            notarial,
            booking,
            objects,
            citizens,
            prefs,
            log,
            channel,
            dispatcher,
        }
    }

    fn worker_config() -> NotificationWorkerConfig {
        NotificationWorkerConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(20))
            .with_name("test-notify")
    }

    /// Poll `cond` until it holds or a few seconds pass.
    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn new_visa(citizen: CitizenId) -> VisaApplication {
        VisaApplication::new(
            CaseId::new(),
            citizen,
            VisaCategory::Business,
            "X9876543",
            NaiveDate::from_ymd_opt(2027, 3, 1).unwrap(),
            30,
            Utc::now(),
        )
        .unwrap()
    }

    // 2026-11-05 is a Thursday.
    fn thursday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 11, 5)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn visa_case_end_to_end() {
        let sys = setup();
        let events = sys.bus.subscribe();
        let officer = UserId::new();

        let visa = sys.visas.create(new_visa(CitizenId::new()), officer).unwrap();
        assert_eq!(visa.state(), VisaState::Draft);
        assert_eq!(visa.header().history().len(), 1);

        let submitted = sys
            .visas
            .apply_transition(visa.id(), VisaState::Submitted, officer, None)
            .unwrap();
        assert_eq!(submitted.case.header().history().len(), 2);
        assert!(submitted.case.submitted_at().is_some());

        sys.visas
            .apply_transition(visa.id(), VisaState::UnderReview, officer, None)
            .unwrap();

        let err = sys
            .visas
            .apply_transition(visa.id(), VisaState::Issued, officer, None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(sys.visas.history(visa.id()).unwrap().len(), 3);

        sys.visas
            .apply_transition(visa.id(), VisaState::Approved, officer, Some("ok".into()))
            .unwrap();
        let issued = sys
            .visas
            .apply_transition(visa.id(), VisaState::Issued, officer, None)
            .unwrap();
        assert!(issued.case.is_terminal());
        assert_eq!(issued.case.header().history().len(), 5);
        assert_eq!(issued.case.header().version(), 5);

        // Terminal: nothing further is accepted.
        let err = sys
            .visas
            .apply_transition(visa.id(), VisaState::Cancelled, officer, None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

        let published: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        let states: Vec<_> = published.iter().map(|e| e.new_state.as_str()).collect();
        assert_eq!(states, ["DRAFT", "SUBMITTED", "UNDER_REVIEW", "APPROVED", "ISSUED"]);
        assert!(published.iter().all(|e| e.workflow == "visa"));

        let history = sys.visas.history(visa.id()).unwrap();
        for (event, record) in published.iter().rev().zip(history.iter()) {
            assert_eq!(event.new_state, record.new_state);
            assert_eq!(event.timestamp, record.timestamp);
        }
    }

    #[test]
    fn generic_process_can_be_reworked_after_rejection() {
        let sys = setup();
        let actor = UserId::new();
        let case = sys
            .processes
            .create(
                GenericProcess::new(CaseId::new(), CitizenId::new(), "Residence proof", "misc", Utc::now())
                    .unwrap(),
                actor,
            )
            .unwrap();

        for target in [
            ProcessState::Submitted,
            ProcessState::UnderReview,
            ProcessState::Rejected,
            ProcessState::Draft,
            ProcessState::Submitted,
        ] {
            sys.processes
                .apply_transition(case.id(), target, actor, None)
                .unwrap();
        }

        let case = sys.processes.get(case.id()).unwrap();
        assert_eq!(case.state(), ProcessState::Submitted);
        assert_eq!(case.rework_count(), 1);
        assert_eq!(case.header().history().len(), 6);
    }

    #[test]
    fn certificate_only_for_certificate_producing_acts() {
        let sys = setup();
        let actor = UserId::new();

        let mut refs = Vec::new();
        for kind in [NotarialKind::Apostille, NotarialKind::SignatureRecognition] {
            let case = sys
                .notarial
                .create(
                    NotarialService::new(CaseId::new(), CitizenId::new(), kind, "diploma", Utc::now())
                        .unwrap(),
                    actor,
                )
                .unwrap();
            for target in [
                NotarialState::Submitted,
                NotarialState::Processing,
                NotarialState::Concluded,
            ] {
                sys.notarial
                    .apply_transition(case.id(), target, actor, None)
                    .unwrap();
            }
            refs.push(sys.notarial.get(case.id()).unwrap().certificate().cloned());
        }

        assert!(refs[0].is_some());
        assert!(refs[1].is_none());
        assert_eq!(sys.objects.len(), 1);
    }

    #[test]
    fn concurrent_bookings_of_one_slot_yield_one_appointment() {
        let sys = setup();
        let slot = thursday(9, 0);

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        sys.booking.book(
                            CitizenId::new(),
                            AppointmentType::VisaInterview,
                            slot,
                            "Window 1",
                            UserId::new(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let booked = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(booked, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, OrchestratorError::ConflictingAppointment(_))));
    }

    #[test]
    fn concurrent_transitions_of_one_case_commit_once() {
        let sys = setup();
        let visa = sys.visas.create(new_visa(CitizenId::new()), UserId::new()).unwrap();

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        sys.visas
                            .apply_transition(visa.id(), VisaState::Submitted, UserId::new(), None)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(
                err,
                OrchestratorError::Concurrency(_) | OrchestratorError::InvalidTransition { .. }
            ));
        }
        assert_eq!(sys.visas.history(visa.id()).unwrap().len(), 2);
    }

    #[test]
    fn deleting_an_open_appointment_frees_its_slot() {
        let sys = setup();
        let appt = sys
            .booking
            .book(CitizenId::new(), AppointmentType::CivilRegistry, thursday(10, 0), "Desk 3", UserId::new())
            .unwrap();
        sys.booking.confirm(appt.id(), UserId::new()).unwrap();

        sys.booking.orchestrator().delete(appt.id()).unwrap();

        let history = sys.booking.orchestrator().archived_history(appt.id()).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].new_state, AppointmentState::Cancelled.to_string());
        assert_eq!(history[0].comment.as_deref(), Some(SYSTEM_CANCELLED));

        sys.booking
            .book(CitizenId::new(), AppointmentType::CivilRegistry, thursday(10, 0), "Desk 3", UserId::new())
            .unwrap();
    }

    #[test]
    fn deleted_appointment_still_notifies_its_citizen() {
        let sys = setup();
        let citizen = CitizenId::new();
        sys.citizens.set(citizen, "ana@example.org");
        let appt = sys
            .booking
            .book(citizen, AppointmentType::CivilRegistry, thursday(11, 0), "Desk 3", UserId::new())
            .unwrap();
        let events = sys.bus.subscribe();

        sys.booking.orchestrator().delete(appt.id()).unwrap();

        let cancelled = events.try_recv().unwrap();
        assert_eq!(cancelled.new_state, "CANCELLED");
        let outcome = sys.dispatcher.handle(&cancelled);
        assert!(matches!(outcome, DispatchOutcome::Sent(_)), "{outcome:?}");

        let sent = sys.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].template_id, "appointment.cancelled");
        assert_eq!(sent[0].address, "ana@example.org");
        assert_eq!(sent[0].variables["location"], "Desk 3");
        assert_eq!(sys.log.list_for_case(appt.id()).unwrap()[0].status, DeliveryStatus::Sent);
    }

    #[test]
    fn workers_deliver_notifications_respecting_opt_out() {
        let sys = setup();
        let handle =
            NotificationWorker::spawn(&sys.bus, sys.dispatcher.clone(), worker_config()).unwrap();

        let booker = CitizenId::new();
        sys.citizens.set(booker, "ana@example.org");
        let applicant = CitizenId::new();
        sys.citizens.set(applicant, "rui@example.org");
        sys.prefs.set(applicant, "visa", false);

        let appt = sys
            .booking
            .book(booker, AppointmentType::Consultation, thursday(14, 15), "Room 2", UserId::new())
            .unwrap();
        sys.booking.confirm(appt.id(), UserId::new()).unwrap();

        let visa = sys.visas.create(new_visa(applicant), UserId::new()).unwrap();
        sys.visas
            .apply_transition(visa.id(), VisaState::Submitted, UserId::new(), None)
            .unwrap();

        assert!(wait_until(|| handle.stats().processed() == 4));
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.received, 4);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.failed, 0);

        let mut templates: Vec<_> = sys.channel.sent().into_iter().map(|m| m.template_id).collect();
        templates.sort();
        assert_eq!(templates, ["appointment.booked", "appointment.confirmed"]);

        let entries = sys.log.list_for_case(appt.id()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.status == DeliveryStatus::Sent));
        assert!(entries.iter().all(|e| e.address == "ana@example.org"));
        assert!(sys.log.list_for_case(visa.id()).unwrap().is_empty());
    }

    #[test]
    fn delivery_failure_never_reaches_the_transition() {
        let sys = setup();
        sys.channel
            .set_failure(Some(DeliveryError::Rejected("mailbox full".into())));
        let handle =
            NotificationWorker::spawn(&sys.bus, sys.dispatcher.clone(), worker_config()).unwrap();

        let citizen = CitizenId::new();
        sys.citizens.set(citizen, "ana@example.org");
        let visa = sys.visas.create(new_visa(citizen), UserId::new()).unwrap();
        let outcome = sys
            .visas
            .apply_transition(visa.id(), VisaState::Submitted, UserId::new(), None)
            .unwrap();
        assert_eq!(outcome.case.state(), VisaState::Submitted);

        assert!(wait_until(|| handle.stats().processed() == 2));
        let stats = handle.stats();
        handle.shutdown();
        assert_eq!(stats.failed, 1);

        let entries = sys.log.list_for_case(visa.id()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, DeliveryStatus::Failed);
        assert_eq!(entries[0].template_id, "visa.submitted");
        assert!(entries[0].error.as_deref().unwrap().contains("mailbox full"));
        assert_eq!(sys.visas.get(visa.id()).unwrap().state(), VisaState::Submitted);
    }
}
