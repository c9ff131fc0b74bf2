//! The outbound push notification boundary. Delivery is somebody else's
//! problem (Firebase or whatever sits behind it); the engine only hands a
//! payload to a [`PushTransport`] and treats failure as recoverable.

use std::sync::Mutex;

use warden_proto::error::OperationError;

/// What gets delivered to the smartphone. The signature covers every field,
/// in the order `nonce|url|serial|question|title|sslverify`, so the app can
/// prove the challenge came from us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPayload {
    pub nonce: String,
    pub url: String,
    pub serial: String,
    pub question: String,
    pub title: String,
    pub sslverify: String,
    pub signature: String,
}

/// Fire and forget delivery. Implementations must not panic and should
/// return `Transport` errors rather than throwing anything past the
/// protocol layer.
pub trait PushTransport {
    fn send(&self, fb_token: &str, payload: &PushPayload) -> Result<(), OperationError>;
}

/// Delivery sink for deployments that rely on polling only.
#[derive(Debug, Default)]
pub struct NullTransport;

impl PushTransport for NullTransport {
    fn send(&self, _fb_token: &str, _payload: &PushPayload) -> Result<(), OperationError> {
        Ok(())
    }
}

/// Test double that records every payload it was asked to deliver.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, PushPayload)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|v| v.len()).unwrap_or(0)
    }
}

impl PushTransport for RecordingTransport {
    fn send(&self, fb_token: &str, payload: &PushPayload) -> Result<(), OperationError> {
        self.sent
            .lock()
            .map_err(|_| OperationError::QueueDisconnected)?
            .push((fb_token.to_string(), payload.clone()));
        Ok(())
    }
}

/// Test double standing in for an unreachable delivery service.
#[derive(Debug, Default)]
pub struct FailingTransport;

impl PushTransport for FailingTransport {
    fn send(&self, _fb_token: &str, _payload: &PushPayload) -> Result<(), OperationError> {
        Err(OperationError::Transport(
            "notification service unreachable".to_string(),
        ))
    }
}
