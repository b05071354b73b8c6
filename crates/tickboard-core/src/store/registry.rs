//! Subscriber bookkeeping shared by the in-process stores.
//!
//! Every write publishes the full post-write state of the touched
//! collection. Collection subscribers receive all of it; document
//! subscribers receive their one document (or `None`).
//!
//! Stores stage pushes while still holding their own lock, so each push is
//! stamped with a sequence number in the order the writes happened, and
//! deliver the [`Staged`] batch after releasing it. A sink never receives a
//! push older than one it has already seen, so racing writers cannot leave
//! a subscriber on a stale snapshot.
//!
//! In deferred mode pushes queue up per subscriber instead of being
//! dispatched, and the owner releases them explicitly. Releasing the head of
//! one collection's queue before another's is how simulations reorder the
//! independent streams while keeping each stream in emission order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use super::{Collection, Document, DocumentSink, SnapshotSink, StoreError, Subscription};

enum Sink {
    Collection(SnapshotSink),
    Document(DocumentSink),
}

struct Slot {
    sink: Sink,
    /// Sequence number of the newest push handed to `sink`.
    delivered: u64,
}

#[derive(Clone)]
enum Payload {
    Collection(Result<Vec<Document>, StoreError>),
    Document(Result<Option<Document>, StoreError>),
}

struct Entry {
    collection: Collection,
    document: Option<String>,
    slot: Arc<Mutex<Slot>>,
}

impl Entry {
    fn payload_for(&self, docs: &[Document]) -> Payload {
        match &self.document {
            None => Payload::Collection(Ok(docs.to_vec())),
            Some(id) => Payload::Document(Ok(docs.iter().find(|d| &d.id == id).cloned())),
        }
    }

    fn error_payload(&self, err: &StoreError) -> Payload {
        match self.document {
            None => Payload::Collection(Err(err.clone())),
            Some(_) => Payload::Document(Err(err.clone())),
        }
    }
}

struct PendingPush {
    subscriber: u64,
    collection: Collection,
    seq: u64,
    payload: Payload,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    seq: u64,
    entries: BTreeMap<u64, Entry>,
    deferred: bool,
    pending: VecDeque<PendingPush>,
}

impl Inner {
    fn stamp(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pushes staged under a store lock, delivered once it is released.
#[must_use = "staged pushes reach nobody until delivered"]
#[derive(Default)]
pub(crate) struct Staged(Vec<(Arc<Mutex<Slot>>, u64, Payload)>);

impl Staged {
    /// Hand each push to its sink, skipping pushes older than what the
    /// sink already saw. Re-delivering the same push is allowed.
    pub(crate) fn deliver(self) {
        for (slot, seq, payload) in self.0 {
            let mut slot = lock(&slot);
            if seq < slot.delivered {
                debug!(seq, newest = slot.delivered, "stale push skipped");
                continue;
            }
            slot.delivered = seq;
            match (&mut slot.sink, payload) {
                (Sink::Collection(callback), Payload::Collection(result)) => callback(result),
                (Sink::Document(callback), Payload::Document(result)) => callback(result),
                _ => debug!("payload shape does not match sink, dropped"),
            }
        }
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Clone, Default)]
pub(crate) struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a collection subscriber. Call while holding the lock that
    /// produced `initial`; deliver the returned push after releasing it.
    pub(crate) fn register_collection(
        &self,
        collection: Collection,
        sink: SnapshotSink,
        initial: Vec<Document>,
    ) -> (Subscription, Staged) {
        self.register(
            collection,
            None,
            Sink::Collection(sink),
            Payload::Collection(Ok(initial)),
        )
    }

    pub(crate) fn register_document(
        &self,
        collection: Collection,
        id: &str,
        sink: DocumentSink,
        initial: Option<Document>,
    ) -> (Subscription, Staged) {
        self.register(
            collection,
            Some(id.to_string()),
            Sink::Document(sink),
            Payload::Document(Ok(initial)),
        )
    }

    fn register(
        &self,
        collection: Collection,
        document: Option<String>,
        sink: Sink,
        initial: Payload,
    ) -> (Subscription, Staged) {
        let slot = Arc::new(Mutex::new(Slot { sink, delivered: 0 }));
        let (id, staged) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            let seq = inner.stamp();
            inner.entries.insert(
                id,
                Entry {
                    collection,
                    document,
                    slot: Arc::clone(&slot),
                },
            );
            let staged = if inner.deferred {
                inner.pending.push_back(PendingPush {
                    subscriber: id,
                    collection,
                    seq,
                    payload: initial,
                });
                Staged::default()
            } else {
                Staged(vec![(slot, seq, initial)])
            };
            (id, staged)
        };
        debug!(%collection, subscriber = id, "subscription opened");

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let subscription = Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = lock(&inner);
                inner.entries.remove(&id);
                inner.pending.retain(|push| push.subscriber != id);
                debug!(%collection, subscriber = id, "subscription closed");
            }
        });
        (subscription, staged)
    }

    /// Stage the post-write state of `collection` for its subscribers.
    pub(crate) fn publish(&self, collection: Collection, docs: &[Document]) -> Staged {
        self.fan_out(collection, |entry| entry.payload_for(docs))
    }

    /// Stage breaking every stream on `collection` with `err`.
    pub(crate) fn publish_error(&self, collection: Collection, err: &StoreError) -> Staged {
        self.fan_out(collection, |entry| entry.error_payload(err))
    }

    fn fan_out(&self, collection: Collection, payload: impl Fn(&Entry) -> Payload) -> Staged {
        let mut inner = lock(&self.inner);
        let seq = inner.stamp();
        let targets: Vec<(u64, Arc<Mutex<Slot>>, Payload)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.collection == collection)
            .map(|(id, entry)| (*id, Arc::clone(&entry.slot), payload(entry)))
            .collect();
        if inner.deferred {
            for (subscriber, _, payload) in targets {
                inner.pending.push_back(PendingPush {
                    subscriber,
                    collection,
                    seq,
                    payload,
                });
            }
            Staged::default()
        } else {
            Staged(
                targets
                    .into_iter()
                    .map(|(_, slot, payload)| (slot, seq, payload))
                    .collect(),
            )
        }
    }

    pub(crate) fn set_deferred(&self, deferred: bool) {
        lock(&self.inner).deferred = deferred;
    }

    /// Deliver the oldest queued push for `collection`. Returns `false` when
    /// nothing was queued.
    pub(crate) fn deliver_next(&self, collection: Collection) -> bool {
        self.release(collection, true)
    }

    /// Deliver the oldest queued push for `collection` but keep it queued,
    /// so the subscriber sees it twice.
    pub(crate) fn duplicate_next(&self, collection: Collection) -> bool {
        self.release(collection, false)
    }

    fn release(&self, collection: Collection, consume: bool) -> bool {
        let staged = {
            let mut inner = lock(&self.inner);
            let Some(position) = inner
                .pending
                .iter()
                .position(|push| push.collection == collection)
            else {
                return false;
            };
            let push = if consume {
                inner.pending.remove(position)
            } else {
                inner.pending.get(position).map(|push| PendingPush {
                    subscriber: push.subscriber,
                    collection: push.collection,
                    seq: push.seq,
                    payload: push.payload.clone(),
                })
            };
            Staged(
                push.and_then(|push| {
                    inner
                        .entries
                        .get(&push.subscriber)
                        .map(|entry| (Arc::clone(&entry.slot), push.seq, push.payload))
                })
                .into_iter()
                .collect(),
            )
        };
        debug!(%collection, pushes = staged.len(), "queued push released");
        staged.deliver();
        true
    }

    /// Drain the whole queue in emission order.
    pub(crate) fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        while let Some(collection) = self.pending_collections().first().copied() {
            if !self.deliver_next(collection) {
                break;
            }
            delivered += 1;
        }
        delivered
    }

    /// Collections with queued pushes, ordered by their oldest push.
    pub(crate) fn pending_collections(&self) -> Vec<Collection> {
        let inner = lock(&self.inner);
        let mut seen = Vec::new();
        for push in &inner.pending {
            if !seen.contains(&push.collection) {
                seen.push(push.collection);
            }
        }
        seen
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (SnapshotSink, Arc<Mutex<Vec<usize>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: SnapshotSink = Box::new(move |result| {
            sink_seen.lock().unwrap().push(result.map_or(usize::MAX, |docs| docs.len()));
        });
        (sink, seen)
    }

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| Document::new(format!("d{i}"), super::super::Fields::new()))
            .collect()
    }

    #[test]
    fn immediate_mode_delivers_initial_and_updates() {
        let registry = Registry::new();
        let (sink, seen) = recorder();
        let (_sub, initial) = registry.register_collection(Collection::Boards, sink, docs(1));
        initial.deliver();
        registry.publish(Collection::Boards, &docs(2)).deliver();
        registry.publish(Collection::Tickets, &docs(5)).deliver();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn older_push_delivered_late_is_skipped() {
        let registry = Registry::new();
        let (sink, seen) = recorder();
        let (_sub, initial) = registry.register_collection(Collection::Tickets, sink, docs(0));
        let first = registry.publish(Collection::Tickets, &docs(1));
        let second = registry.publish(Collection::Tickets, &docs(2));
        second.deliver();
        first.deliver();
        initial.deliver();
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn deferred_mode_releases_per_collection() {
        let registry = Registry::new();
        registry.set_deferred(true);
        let (boards, board_seen) = recorder();
        let (tickets, ticket_seen) = recorder();
        let (_b, staged_b) = registry.register_collection(Collection::Boards, boards, docs(1));
        let (_t, staged_t) = registry.register_collection(Collection::Tickets, tickets, docs(3));
        assert_eq!(staged_b.len() + staged_t.len(), 0);
        assert_eq!(
            registry.pending_collections(),
            vec![Collection::Boards, Collection::Tickets]
        );

        assert!(registry.deliver_next(Collection::Tickets));
        assert!(board_seen.lock().unwrap().is_empty());
        assert_eq!(*ticket_seen.lock().unwrap(), vec![3]);

        assert!(registry.duplicate_next(Collection::Boards));
        assert_eq!(registry.deliver_all(), 1);
        assert_eq!(*board_seen.lock().unwrap(), vec![1, 1]);
        assert!(!registry.deliver_next(Collection::Boards));
    }

    #[test]
    fn dropping_subscription_discards_queued_pushes() {
        let registry = Registry::new();
        registry.set_deferred(true);
        let (sink, seen) = recorder();
        let (sub, _) = registry.register_collection(Collection::Users, sink, docs(1));
        registry
            .publish_error(Collection::Users, &StoreError::Unavailable("offline".into()))
            .deliver();
        drop(sub);
        assert_eq!(registry.subscriber_count(), 0);
        assert_eq!(registry.deliver_all(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }
}
