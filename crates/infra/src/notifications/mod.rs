//! Notification pipeline: transition events in, best-effort messages out.

pub mod directory;
pub mod dispatcher;
pub mod log;
pub mod preferences;
pub mod templates;
pub mod worker;

pub use directory::{
    CaseLookup, CaseSummary, CaseSummarySource, CitizenDirectory, InMemoryCitizenDirectory,
    StoreSummaries,
};
pub use dispatcher::{DEFAULT_DELIVERY_TIMEOUT, DispatchOutcome, NotificationDispatcher, SkipReason};
pub use log::{
    DeliveryStatus, InMemoryNotificationLog, NotificationLog, NotificationLogEntry,
    NotificationLogError,
};
pub use preferences::{InMemoryPreferenceStore, PreferenceStore};
pub use templates::{NotificationTemplate, TemplateCatalog};
pub use worker::{
    NotificationWorker, NotificationWorkerConfig, NotificationWorkerHandle, NotificationWorkerStats,
};
