//! In-process [`DocumentStore`] used by tests, benches and the simulator.
//!
//! Besides the store contract it offers knobs the hosted store does not:
//! a manual clock, sequential ids, deferred delivery of realtime pushes,
//! failure injection and a log of reads and writes.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::query::{self, Filter, Query};
use super::registry::Registry;
use super::{
    Collection, Document, DocumentSink, DocumentStore, Fields, Record, SnapshotSink, StoreError,
    Subscription, encode, new_document_id,
};

/// A read issued against the store, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadCall {
    Count {
        collection: Collection,
        filters: Vec<Filter>,
    },
    Query(Query),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Set,
    Merge,
    Update,
    Delete,
}

/// A successful write, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub collection: Collection,
    pub id: String,
    pub fields: Fields,
}

enum Clock {
    System,
    /// Advances by one millisecond per reading.
    Manual(DateTime<Utc>),
}

struct State {
    tables: BTreeMap<Collection, BTreeMap<String, Fields>>,
    clock: Clock,
    next_seq: Option<u64>,
    write_failure: Option<StoreError>,
    query_failure: Option<StoreError>,
    reads: Vec<ReadCall>,
    writes: Vec<WriteRecord>,
}

impl State {
    fn snapshot(&self, collection: Collection) -> Vec<Document> {
        self.tables
            .get(&collection)
            .map(|table| {
                table
                    .iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn document(&self, collection: Collection, id: &str) -> Option<Document> {
        self.tables
            .get(&collection)
            .and_then(|table| table.get(id))
            .map(|fields| Document::new(id, fields.clone()))
    }

    fn table(&mut self, collection: Collection) -> &mut BTreeMap<String, Fields> {
        self.tables.entry(collection).or_default()
    }

    fn next_id(&mut self, collection: Collection) -> String {
        match self.next_seq.as_mut() {
            Some(seq) => {
                *seq += 1;
                format!("{}-{:05}", collection.as_str(), *seq)
            }
            None => new_document_id(),
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        self.write_failure.clone().map_or(Ok(()), Err)
    }

    fn record_write(&mut self, kind: WriteKind, collection: Collection, id: &str, fields: Fields) {
        self.writes.push(WriteRecord {
            kind,
            collection,
            id: id.to_string(),
            fields,
        });
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    registry: Registry,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tables: BTreeMap::new(),
                clock: Clock::System,
                next_seq: None,
                write_failure: None,
                query_failure: None,
                reads: Vec::new(),
                writes: Vec::new(),
            }),
            registry: Registry::new(),
        }
    }

    /// Use a deterministic clock starting at `start`.
    #[must_use]
    pub fn with_manual_clock(self, start: DateTime<Utc>) -> Self {
        self.lock().clock = Clock::Manual(start);
        self
    }

    /// Assign ids `<collection>-00001`, `<collection>-00002`, ...
    #[must_use]
    pub fn with_sequential_ids(self) -> Self {
        self.lock().next_seq = Some(0);
        self
    }

    /// Queue realtime pushes until released with [`Self::deliver_next`].
    #[must_use]
    pub fn deferred(self) -> Self {
        self.registry.set_deferred(true);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.registry.set_deferred(deferred);
    }

    pub fn deliver_next(&self, collection: Collection) -> bool {
        self.registry.deliver_next(collection)
    }

    pub fn duplicate_next(&self, collection: Collection) -> bool {
        self.registry.duplicate_next(collection)
    }

    pub fn deliver_all(&self) -> usize {
        self.registry.deliver_all()
    }

    #[must_use]
    pub fn pending_collections(&self) -> Vec<Collection> {
        self.registry.pending_collections()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscriber_count()
    }

    /// Break every open stream on `collection` with `err`.
    pub fn fail_subscriptions(&self, collection: Collection, err: &StoreError) {
        let state = self.lock();
        let staged = self.registry.publish_error(collection, err);
        drop(state);
        staged.deliver();
    }

    /// Fail every write with `err` until cleared with `None`.
    pub fn inject_write_failure(&self, err: Option<StoreError>) {
        self.lock().write_failure = err;
    }

    /// Fail every query and count with `err` until cleared with `None`.
    pub fn inject_query_failure(&self, err: Option<StoreError>) {
        self.lock().query_failure = err;
    }

    /// Move a manual clock forward. No effect on the system clock.
    pub fn advance_clock(&self, by: Duration) {
        if let Clock::Manual(at) = &mut self.lock().clock {
            *at += by;
        }
    }

    #[must_use]
    pub fn reads(&self) -> Vec<ReadCall> {
        self.lock().reads.clone()
    }

    /// Return the read log and start a fresh one.
    pub fn take_reads(&self) -> Vec<ReadCall> {
        std::mem::take(&mut self.lock().reads)
    }

    pub fn clear_reads(&self) {
        self.lock().reads.clear();
    }

    #[must_use]
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.lock().tables.get(&collection).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }

    /// Seed a typed record at its own id. Seeds publish like writes but are
    /// not recorded in [`Self::writes`].
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not serialize to an object.
    pub fn seed<R: Record>(&self, record: &R) -> Result<(), serde_json::Error> {
        let fields = encode(record)?;
        let staged = {
            let mut state = self.lock();
            state
                .table(R::COLLECTION)
                .insert(record.id().to_string(), fields);
            self.registry
                .publish(R::COLLECTION, &state.snapshot(R::COLLECTION))
        };
        staged.deliver();
        Ok(())
    }

    fn commit(
        &self,
        collection: Collection,
        write: impl FnOnce(&mut State) -> Result<String, StoreError>,
    ) -> Result<String, StoreError> {
        let (id, staged) = {
            let mut state = self.lock();
            state.check_writable()?;
            let id = write(&mut state)?;
            let staged = self.registry.publish(collection, &state.snapshot(collection));
            (id, staged)
        };
        debug!(%collection, %id, "write committed");
        staged.deliver();
        Ok(id)
    }
}

fn merge_into(target: &mut Fields, fields: Fields) {
    for (key, value) in fields {
        target.insert(key, value);
    }
}

impl DocumentStore for MemoryStore {
    fn subscribe(
        &self,
        collection: Collection,
        sink: SnapshotSink,
    ) -> Result<Subscription, StoreError> {
        let (subscription, initial) = {
            let state = self.lock();
            self.registry
                .register_collection(collection, sink, state.snapshot(collection))
        };
        initial.deliver();
        Ok(subscription)
    }

    fn subscribe_one(
        &self,
        collection: Collection,
        id: &str,
        sink: DocumentSink,
    ) -> Result<Subscription, StoreError> {
        let (subscription, initial) = {
            let state = self.lock();
            let doc = state.document(collection, id);
            self.registry.register_document(collection, id, sink, doc)
        };
        initial.deliver();
        Ok(subscription)
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.lock().document(collection, id))
    }

    fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut state = self.lock();
        state.reads.push(ReadCall::Query(query.clone()));
        if let Some(err) = state.query_failure.clone() {
            return Err(err);
        }
        query::validate(query)?;
        Ok(query.apply(state.snapshot(query.collection)))
    }

    fn count(&self, collection: Collection, filters: &[Filter]) -> Result<u64, StoreError> {
        let mut state = self.lock();
        state.reads.push(ReadCall::Count {
            collection,
            filters: filters.to_vec(),
        });
        if let Some(err) = state.query_failure.clone() {
            return Err(err);
        }
        query::validate_filters(filters)?;
        let matching = state
            .snapshot(collection)
            .iter()
            .filter(|doc| filters.iter().all(|f| f.matches(doc)))
            .count();
        Ok(matching as u64)
    }

    fn create(&self, collection: Collection, fields: Fields) -> Result<String, StoreError> {
        self.commit(collection, |state| {
            let id = state.next_id(collection);
            state.table(collection).insert(id.clone(), fields.clone());
            state.record_write(WriteKind::Create, collection, &id, fields);
            Ok(id)
        })
    }

    fn set(
        &self,
        collection: Collection,
        id: &str,
        fields: Fields,
        merge: bool,
    ) -> Result<(), StoreError> {
        self.commit(collection, |state| {
            let table = state.table(collection);
            if merge {
                merge_into(table.entry(id.to_string()).or_default(), fields.clone());
            } else {
                table.insert(id.to_string(), fields.clone());
            }
            let kind = if merge { WriteKind::Merge } else { WriteKind::Set };
            state.record_write(kind, collection, id, fields);
            Ok(id.to_string())
        })
        .map(drop)
    }

    fn update(&self, collection: Collection, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.commit(collection, |state| {
            let existing = state
                .table(collection)
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound {
                    collection,
                    id: id.to_string(),
                })?;
            merge_into(existing, fields.clone());
            state.record_write(WriteKind::Update, collection, id, fields);
            Ok(id.to_string())
        })
        .map(drop)
    }

    fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        self.commit(collection, |state| {
            state.table(collection).remove(id);
            state.record_write(WriteKind::Delete, collection, id, Fields::new());
            Ok(id.to_string())
        })
        .map(drop)
    }

    fn now(&self) -> DateTime<Utc> {
        let mut state = self.lock();
        match &mut state.clock {
            Clock::System => Utc::now(),
            Clock::Manual(at) => {
                let now = *at;
                *at += Duration::milliseconds(1);
                now
            }
        }
    }
}
