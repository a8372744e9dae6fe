//! External collaborators consumed at their boundary: certificate rendering,
//! object storage and the outbound notification channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use consular_core::CertificateRef;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalError {
    #[error("certificate rendering failed: {0}")]
    Render(String),

    #[error("object storage failed: {0}")]
    Storage(String),
}

/// Renders a case snapshot into a certificate document.
pub trait CertificateRenderer: Send + Sync {
    fn render(&self, case_data: &JsonValue) -> Result<Vec<u8>, ExternalError>;
}

impl<F> CertificateRenderer for F
where
    F: Fn(&JsonValue) -> Result<Vec<u8>, ExternalError> + Send + Sync,
{
    fn render(&self, case_data: &JsonValue) -> Result<Vec<u8>, ExternalError> {
        self(case_data)
    }
}

/// Renders the case snapshot as pretty-printed JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCertificateRenderer;

impl CertificateRenderer for JsonCertificateRenderer {
    fn render(&self, case_data: &JsonValue) -> Result<Vec<u8>, ExternalError> {
        serde_json::to_vec_pretty(case_data).map_err(|e| ExternalError::Render(e.to_string()))
    }
}

/// Stores rendered artifacts and hands back an opaque reference.
pub trait ObjectStore: Send + Sync {
    fn store(&self, bytes: Vec<u8>) -> Result<CertificateRef, ExternalError>;

    /// Remove an artifact no case points to. Unknown references are ignored.
    fn discard(&self, reference: &CertificateRef) -> Result<(), ExternalError>;
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reference: &CertificateRef) -> Option<Vec<u8>> {
        self.objects.read().ok()?.get(&reference.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn store(&self, bytes: Vec<u8>) -> Result<CertificateRef, ExternalError> {
        let key = format!("certificates/{}", Uuid::now_v7());
        self.objects
            .write()
            .map_err(|_| ExternalError::Storage("lock poisoned".to_string()))?
            .insert(key.clone(), bytes);
        Ok(CertificateRef(key))
    }

    fn discard(&self, reference: &CertificateRef) -> Result<(), ExternalError> {
        self.objects
            .write()
            .map_err(|_| ExternalError::Storage("lock poisoned".to_string()))?
            .remove(&reference.0);
        Ok(())
    }
}

/// One message handed to the outbound channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub address: String,
    pub subject: String,
    pub template_id: String,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Delivers notifications (mail, SMS gateway, ...).
///
/// Implementations must give up after `timeout` and report
/// [`DeliveryError::Timeout`]; there are no retries beyond what the channel
/// does internally.
pub trait OutboundChannel: Send + Sync {
    fn send(&self, message: &OutboundMessage, timeout: Duration) -> Result<(), DeliveryError>;
}

/// Channel that records what it was asked to send.
///
/// Can be switched into a failing mode, or given an artificial latency to
/// exercise timeouts.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<OutboundMessage>>,
    failure: Mutex<Option<DeliveryError>>,
    latency: Option<Duration>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every subsequent send with `error` (or succeed again with `None`).
    pub fn set_failure(&self, error: Option<DeliveryError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl OutboundChannel for RecordingChannel {
    fn send(&self, message: &OutboundMessage, timeout: Duration) -> Result<(), DeliveryError> {
        if let Some(latency) = self.latency {
            if latency > timeout {
                std::thread::sleep(timeout);
                return Err(DeliveryError::Timeout(timeout));
            }
            std::thread::sleep(latency);
        }
        let failure = self
            .failure
            .lock()
            .map_err(|_| DeliveryError::Transport("lock poisoned".to_string()))?
            .clone();
        if let Some(err) = failure {
            return Err(err);
        }
        self.sent
            .lock()
            .map_err(|_| DeliveryError::Transport("lock poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            address: "ana@example.org".to_string(),
            subject: "Your application".to_string(),
            template_id: "visa.submitted".to_string(),
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn object_store_round_trip() {
        let store = InMemoryObjectStore::new();
        let reference = store.store(b"pdf".to_vec()).unwrap();
        assert!(reference.0.starts_with("certificates/"));
        assert_eq!(store.get(&reference).unwrap(), b"pdf");
        assert_eq!(store.len(), 1);

        store.discard(&reference).unwrap();
        assert!(store.get(&reference).is_none());
        store.discard(&reference).unwrap();
    }

    #[test]
    fn closure_renderer() {
        let renderer = |data: &JsonValue| -> Result<Vec<u8>, ExternalError> {
            Ok(data["case_number"].as_str().unwrap_or_default().as_bytes().to_vec())
        };
        let bytes = renderer
            .render(&serde_json::json!({"case_number": "REG-2026-000001"}))
            .unwrap();
        assert_eq!(bytes, b"REG-2026-000001");
    }

    #[test]
    fn recording_channel_failure_mode() {
        let channel = RecordingChannel::new();
        channel.send(&message(), Duration::from_secs(1)).unwrap();

        channel.set_failure(Some(DeliveryError::Rejected("mailbox full".to_string())));
        let err = channel.send(&message(), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, DeliveryError::Rejected("mailbox full".to_string()));
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn slow_channel_times_out() {
        let channel = RecordingChannel::new().with_latency(Duration::from_millis(50));
        let err = channel
            .send(&message(), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout(_)));
        assert!(channel.sent().is_empty());
    }
}
