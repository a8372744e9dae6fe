//! Runtime configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `CONSULAR_NOTIFY_WORKERS` | `2` |
//! | `CONSULAR_DELIVERY_TIMEOUT_MS` | `5000` |
//! | `CONSULAR_QUEUE_POLL_MS` | `250` |
//! | `CONSULAR_SCHEDULING_RULES` | built-in rules |
//! | `DATABASE_URL` | in-memory stores |
//! | `REDIS_URL` | in-process event bus |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;

use consular_appointments::{AppointmentType, SchedulingRule, SchedulingRuleSpec, SlotAllocator};

use crate::notifications::NotificationWorkerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsularConfig {
    pub notify_workers: usize,
    pub delivery_timeout: Duration,
    pub queue_poll_interval: Duration,
    pub scheduling_rules: Option<PathBuf>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for ConsularConfig {
    fn default() -> Self {
        Self {
            notify_workers: 2,
            delivery_timeout: Duration::from_millis(5000),
            queue_poll_interval: Duration::from_millis(250),
            scheduling_rules: None,
            database_url: None,
            redis_url: None,
        }
    }
}

impl ConsularConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or blank variables take
    /// their defaults; malformed numbers are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let notify_workers = match get("CONSULAR_NOTIFY_WORKERS") {
            Some(v) => match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid("CONSULAR_NOTIFY_WORKERS", v, "a positive integer")),
            },
            None => defaults.notify_workers,
        };

        Ok(Self {
            notify_workers,
            delivery_timeout: millis(
                get("CONSULAR_DELIVERY_TIMEOUT_MS"),
                "CONSULAR_DELIVERY_TIMEOUT_MS",
                defaults.delivery_timeout,
            )?,
            queue_poll_interval: millis(
                get("CONSULAR_QUEUE_POLL_MS"),
                "CONSULAR_QUEUE_POLL_MS",
                defaults.queue_poll_interval,
            )?,
            scheduling_rules: get("CONSULAR_SCHEDULING_RULES").map(PathBuf::from),
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
        })
    }

    pub fn worker_config(&self) -> NotificationWorkerConfig {
        NotificationWorkerConfig::default()
            .with_workers(self.notify_workers)
            .with_poll_interval(self.queue_poll_interval)
    }

    /// Slot allocator from the configured rules file, or the built-in rules.
    pub fn slot_allocator(&self) -> anyhow::Result<SlotAllocator> {
        match &self.scheduling_rules {
            Some(path) => load_scheduling_rules(path),
            None => Ok(SlotAllocator::with_default_rules()),
        }
    }
}

fn invalid(name: &'static str, value: String, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value,
        expected,
    }
}

fn millis(value: Option<String>, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(v) => match v.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
            _ => Err(invalid(name, v, "a positive number of milliseconds")),
        },
        None => Ok(default),
    }
}

/// Parse scheduling rules from JSON text:
///
/// ```json
/// {
///   "visa_interview": {
///     "weekdays": ["Mon", "Tue"],
///     "blocks": [{"start": "09:00", "end": "12:00"}],
///     "slot_minutes": 30
///   }
/// }
/// ```
pub fn parse_scheduling_rules(json: &str) -> anyhow::Result<SlotAllocator> {
    let specs: HashMap<AppointmentType, SchedulingRuleSpec> =
        serde_json::from_str(json).context("scheduling rules are not valid JSON")?;

    let mut allocator = SlotAllocator::new();
    for (appointment_type, spec) in specs {
        let rule = SchedulingRule::try_from(spec)
            .with_context(|| format!("invalid scheduling rule for {appointment_type}"))?;
        allocator = allocator.with_rule(appointment_type, rule);
    }
    Ok(allocator)
}

pub fn load_scheduling_rules(path: &Path) -> anyhow::Result<SlotAllocator> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading scheduling rules from {}", path.display()))?;
    parse_scheduling_rules(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = ConsularConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, ConsularConfig::default());
        assert_eq!(cfg.worker_config().workers, 2);
    }

    #[test]
    fn values_are_read() {
        let cfg = ConsularConfig::from_lookup(lookup(&[
            ("CONSULAR_NOTIFY_WORKERS", "4"),
            ("CONSULAR_DELIVERY_TIMEOUT_MS", "1500"),
            ("CONSULAR_QUEUE_POLL_MS", "50"),
            ("DATABASE_URL", "postgres://localhost/consular"),
            ("CONSULAR_SCHEDULING_RULES", "  "),
        ]))
        .unwrap();
        assert_eq!(cfg.notify_workers, 4);
        assert_eq!(cfg.delivery_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.queue_poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/consular"));
        assert!(cfg.scheduling_rules.is_none());
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = ConsularConfig::from_lookup(lookup(&[("CONSULAR_NOTIFY_WORKERS", "two")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "CONSULAR_NOTIFY_WORKERS", .. }));

        let err = ConsularConfig::from_lookup(lookup(&[("CONSULAR_DELIVERY_TIMEOUT_MS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "CONSULAR_DELIVERY_TIMEOUT_MS", .. }));
    }

    #[test]
    fn rules_file_is_parsed() {
        let allocator = parse_scheduling_rules(
            r#"{
                "consultation": {
                    "weekdays": ["Wed"],
                    "blocks": [{"start": "10:00", "end": "11:00"}],
                    "slot_minutes": 20
                }
            }"#,
        )
        .unwrap();

        // 2026-11-04 is a Wednesday.
        let wednesday = NaiveDate::from_ymd_opt(2026, 11, 4).unwrap();
        let slots = allocator.available_slots(wednesday, AppointmentType::Consultation, &BTreeSet::new());
        assert_eq!(slots.len(), 3);
        assert!(allocator.rule(AppointmentType::VisaInterview).is_none());
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let overlapping = r#"{
            "consultation": {
                "weekdays": ["Mon"],
                "blocks": [{"start": "09:00", "end": "11:00"}, {"start": "10:30", "end": "12:00"}],
                "slot_minutes": 30
            }
        }"#;
        assert!(parse_scheduling_rules(overlapping).is_err());
        assert!(parse_scheduling_rules(r#"{"haircut": {"weekdays": [], "blocks": [], "slot_minutes": 10}}"#).is_err());
        assert!(load_scheduling_rules(Path::new("/nonexistent/rules.json")).is_err());
    }
}
