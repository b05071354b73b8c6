//! Events queued by collaborator callbacks for the session to apply.
//!
//! Callbacks run wherever the collaborator invokes them; they only ever
//! enqueue one of these. All state changes happen when the session drains
//! the queue on its owner thread.

use std::sync::mpsc;

use crate::identity::{AuthError, AuthIdentity};
use crate::store::{Collection, Document, StoreError};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Auth(Result<Option<AuthIdentity>, AuthError>),
    Profile {
        generation: u64,
        result: Result<Option<Document>, StoreError>,
    },
    Snapshot {
        generation: u64,
        collection: Collection,
        result: Result<Vec<Document>, StoreError>,
    },
}

pub type EventSender = mpsc::Sender<SessionEvent>;
pub type EventReceiver = mpsc::Receiver<SessionEvent>;

#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel()
}

/// Enqueue, ignoring a closed queue (the session is gone and nobody is
/// left to care).
pub fn emit(sender: &EventSender, event: SessionEvent) {
    let _ = sender.send(event);
}
