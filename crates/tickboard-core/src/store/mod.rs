//! Document store capability and its reference implementations.
//!
//! The tracker talks to a hosted realtime document store. This module
//! pins down the contract the rest of the crate relies on:
//!
//! - full-collection and single-document subscriptions that push whole
//!   snapshots (never deltas),
//! - "top N of a filtered, ordered query" plus a separate count,
//! - create / set / update / delete writes,
//! - a store-observed clock used to stamp `createdAt` / `updatedAt`.
//!
//! [`MemoryStore`] and [`SqliteStore`] implement the contract in-process.

pub mod blob;
pub mod memory;
pub mod push;
pub mod query;
mod registry;
pub mod sqlite;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::error::ErrorCode;

pub use memory::MemoryStore;
pub use query::{Direction, Filter, FilterOp, OrderBy, Query};
pub use sqlite::SqliteStore;

/// JSON object holding a document's fields (without its id).
pub type Fields = serde_json::Map<String, Value>;

/// Callback receiving full-collection snapshots.
///
/// Sinks run on the store's delivery path and must not write back into the
/// store synchronously.
pub type SnapshotSink = Box<dyn FnMut(Result<Vec<Document>, StoreError>) + Send>;

/// Callback receiving single-document snapshots (`None` when absent).
pub type DocumentSink = Box<dyn FnMut(Result<Option<Document>, StoreError>) + Send>;

/// Persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    Users,
    Boards,
    Tickets,
    ChatMessages,
    ChatTyping,
}

impl Collection {
    pub const ALL: [Self; 5] = [
        Self::Users,
        Self::Boards,
        Self::Tickets,
        Self::ChatMessages,
        Self::ChatTyping,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Boards => "boards",
            Self::Tickets => "tickets",
            Self::ChatMessages => "chat_messages",
            Self::ChatTyping => "chat_typing",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a document store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{collection}/{id} does not exist")]
    NotFound { collection: Collection, id: String },
    /// The store refused the query. The message is the store's own.
    #[error("{0}")]
    Rejected(String),
    /// The store refused a write.
    #[error("write denied: {0}")]
    Denied(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::DocumentNotFound,
            Self::Rejected(_) => ErrorCode::QueryRejected,
            Self::Denied(_) => ErrorCode::WriteRejected,
            Self::Unavailable(_) => ErrorCode::StoreUnavailable,
        }
    }
}

/// A stored document: opaque id plus JSON fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Look up a field, following dotted paths into nested objects.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Decode into a typed record. The document id overrides any `id`
    /// field stored in the body.
    ///
    /// # Errors
    ///
    /// Returns an error if the fields do not match the record's shape.
    pub fn decode<R: DeserializeOwned>(&self) -> Result<R, serde_json::Error> {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(object))
    }
}

/// A typed document living in a fixed collection.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn id(&self) -> &str;
}

/// Serialize a value into document fields, dropping its `id`.
///
/// # Errors
///
/// Returns an error if the value does not serialize to a JSON object.
pub fn encode<T: Serialize>(value: &T) -> Result<Fields, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(mut fields) => {
            fields.remove("id");
            Ok(fields)
        }
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Decode a snapshot, skipping (and logging) documents of the wrong shape.
#[must_use]
pub fn decode_snapshot<R: Record>(documents: &[Document]) -> Vec<R> {
    documents
        .iter()
        .filter_map(|doc| match doc.decode::<R>() {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(
                    collection = %R::COLLECTION,
                    id = %doc.id,
                    error = %err,
                    "skipping undecodable document"
                );
                None
            }
        })
        .collect()
}

/// RAII handle for a realtime subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Explicitly unsubscribe. Also happens automatically on drop.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// The realtime document store the tracker is built on.
pub trait DocumentStore: Send + Sync {
    /// Subscribe to full snapshots of a collection. The current snapshot is
    /// pushed first, then one per remote change.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be opened.
    fn subscribe(&self, collection: Collection, sink: SnapshotSink)
    -> Result<Subscription, StoreError>;

    /// Subscribe to a single document.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be opened.
    fn subscribe_one(
        &self,
        collection: Collection,
        id: &str,
        sink: DocumentSink,
    ) -> Result<Subscription, StoreError>;

    /// Read a single document.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    /// Top `query.limit` documents matching every filter, in query order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Rejected`] for queries the store cannot serve.
    fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Server-side count of documents matching every filter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Rejected`] for filters the store cannot serve.
    fn count(&self, collection: Collection, filters: &[Filter]) -> Result<u64, StoreError>;

    /// Create a document with a store-assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn create(&self, collection: Collection, fields: Fields) -> Result<String, StoreError>;

    /// Write a document at a known id, replacing it or (with `merge`)
    /// merging top-level fields into it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn set(
        &self,
        collection: Collection,
        id: &str,
        fields: Fields,
        merge: bool,
    ) -> Result<(), StoreError>;

    /// Merge top-level fields into an existing document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the document does not exist.
    fn update(&self, collection: Collection, id: &str, fields: Fields) -> Result<(), StoreError>;

    /// Delete a document. Deleting a missing document is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError>;

    /// The store's clock. Used for every `createdAt` / `updatedAt` stamp.
    fn now(&self) -> DateTime<Utc>;
}

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 20;

/// Random 20-character alphanumeric document id.
#[must_use]
pub fn new_document_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
        .collect()
}

/// Timestamp as stored in documents: integer milliseconds.
#[must_use]
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::from(at.timestamp_millis())
}
