//! Push notification delivery.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("push to token '{token}' rejected: {reason}")]
    Rejected { token: String, reason: String },
    #[error("push channel unavailable: {0}")]
    Unavailable(String),
}

impl PushError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::NotificationFailed
    }
}

/// Delivers a titled message to one device token.
pub trait NotificationChannel: Send + Sync {
    /// # Errors
    ///
    /// Returns [`PushError`] when the message was not accepted.
    fn send(&self, token: &str, title: &str, body: &str) -> Result<(), PushError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
}

/// Records delivered messages; rejects tokens marked as failing.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<PushMessage>>,
    failing: Mutex<BTreeSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_token(&self, token: impl Into<String>) {
        lock(&self.failing).insert(token.into());
    }

    #[must_use]
    pub fn sent(&self) -> Vec<PushMessage> {
        lock(&self.sent).clone()
    }
}

impl NotificationChannel for RecordingChannel {
    fn send(&self, token: &str, title: &str, body: &str) -> Result<(), PushError> {
        if lock(&self.failing).contains(token) {
            return Err(PushError::Rejected {
                token: token.to_string(),
                reason: "unregistered device".to_string(),
            });
        }
        lock(&self.sent).push(PushMessage {
            token: token.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
