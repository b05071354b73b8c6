//! Realtime sync of the boards, tickets and users collections.
//!
//! The coordinator owns three independent full-snapshot subscriptions.
//! Their callbacks only enqueue [`SessionEvent::Snapshot`]s tagged with the
//! coordinator's generation; [`SyncCoordinator::apply`] later swaps in the
//! decoded snapshot on the owner thread. Stopping drops the subscriptions
//! and bumps the generation, so pushes already queued are discarded.
//!
//! There is no ordering between the three streams. A stream error keeps the
//! collection's last snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::ErrorCode;
use crate::events::{self, EventSender, SessionEvent};
use crate::model::{Board, Principal, Ticket, UserId, UserRecord};
use crate::store::{Collection, Document, DocumentStore, StoreError, Subscription, decode_snapshot};
use crate::visibility::Collections;

/// Collections kept warm for the visibility engine.
pub const SYNCED: [Collection; 3] = [Collection::Boards, Collection::Tickets, Collection::Users];

/// Immutable snapshots, replaced wholesale on every push.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    pub boards: Arc<[Board]>,
    pub tickets: Arc<[Ticket]>,
    pub users: Arc<[UserRecord]>,
}

impl Default for CollectionSnapshot {
    fn default() -> Self {
        Self {
            boards: Arc::from(Vec::new()),
            tickets: Arc::from(Vec::new()),
            users: Arc::from(Vec::new()),
        }
    }
}

impl CollectionSnapshot {
    #[must_use]
    pub fn collections(&self) -> Collections<'_> {
        Collections {
            boards: &self.boards,
            tickets: &self.tickets,
            users: &self.users,
        }
    }
}

pub struct SyncCoordinator {
    store: Arc<dyn DocumentStore>,
    generation: u64,
    subscriptions: Vec<Subscription>,
    snapshot: CollectionSnapshot,
    loaded: BTreeSet<Collection>,
    active_for: Option<UserId>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            generation: 0,
            subscriptions: Vec::new(),
            snapshot: CollectionSnapshot::default(),
            loaded: BTreeSet::new(),
            active_for: None,
        }
    }

    /// Open the three subscriptions for `principal`, replacing any running
    /// ones. A subscription that cannot be opened counts as loaded (empty).
    pub fn start(&mut self, principal: &Principal, queue: &EventSender) {
        self.stop();
        self.active_for = Some(principal.id.clone());
        let generation = self.generation;
        debug!(uid = %principal.id, generation, "starting realtime sync");

        for collection in SYNCED {
            let sender = queue.clone();
            let opened = self.store.subscribe(
                collection,
                Box::new(move |result| {
                    events::emit(
                        &sender,
                        SessionEvent::Snapshot {
                            generation,
                            collection,
                            result,
                        },
                    );
                }),
            );
            match opened {
                Ok(subscription) => self.subscriptions.push(subscription),
                Err(err) => {
                    error!(
                        %collection,
                        code = ErrorCode::SubscriptionFailed.code(),
                        error = %err,
                        "could not open realtime subscription"
                    );
                    self.loaded.insert(collection);
                }
            }
        }
    }

    /// Tear down every subscription and forget the snapshots. Pushes queued
    /// before this call are discarded by [`Self::apply`].
    pub fn stop(&mut self) {
        self.generation += 1;
        if self.active_for.take().is_some() {
            debug!(generation = self.generation, "stopping realtime sync");
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.snapshot = CollectionSnapshot::default();
        self.loaded.clear();
    }

    /// Apply one queued push. Returns whether anything observable changed.
    pub fn apply(
        &mut self,
        generation: u64,
        collection: Collection,
        result: Result<Vec<Document>, StoreError>,
    ) -> bool {
        if generation != self.generation {
            debug!(%collection, generation, current = self.generation, "discarding stale push");
            return false;
        }
        let newly_loaded = self.loaded.insert(collection);
        match result {
            Ok(docs) => {
                match collection {
                    Collection::Boards => self.snapshot.boards = decode_snapshot(&docs).into(),
                    Collection::Tickets => self.snapshot.tickets = decode_snapshot(&docs).into(),
                    Collection::Users => self.snapshot.users = decode_snapshot(&docs).into(),
                    Collection::ChatMessages | Collection::ChatTyping => {
                        debug!(%collection, "push for unsynced collection ignored");
                        return newly_loaded;
                    }
                }
                true
            }
            Err(err) => {
                error!(
                    %collection,
                    code = ErrorCode::SubscriptionFailed.code(),
                    error = %err,
                    "realtime stream failed, keeping last snapshot"
                );
                newly_loaded
            }
        }
    }

    #[must_use]
    pub const fn snapshot(&self) -> &CollectionSnapshot {
        &self.snapshot
    }

    /// Every synced collection has delivered at least one push.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        SYNCED.iter().all(|collection| self.loaded.contains(collection))
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active_for.is_some()
    }

    #[must_use]
    pub const fn active_for(&self) -> Option<&UserId> {
        self.active_for.as_ref()
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::model::BoardId;
    use crate::store::MemoryStore;

    fn principal() -> Principal {
        Principal {
            id: UserId::new("u1"),
            email: "u1@x.com".into(),
            name: None,
            role: None,
            group_assignments: crate::model::GroupAssignments::new(),
        }
    }

    fn drain(sync: &mut SyncCoordinator, rx: &EventReceiver) -> usize {
        let mut applied = 0;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Snapshot {
                generation,
                collection,
                result,
            } = event
            {
                if sync.apply(generation, collection, result) {
                    applied += 1;
                }
            }
        }
        applied
    }

    fn board(id: &str) -> Board {
        Board {
            id: BoardId::new(id),
            name: id.to_uppercase(),
            ..Board::default()
        }
    }

    #[test]
    fn loads_after_each_stream_delivers_once() {
        let store = Arc::new(MemoryStore::new().deferred());
        store.seed(&board("b1")).unwrap();
        let (tx, rx) = events::channel();
        let mut sync = SyncCoordinator::new(Arc::clone(&store) as Arc<dyn DocumentStore>);
        sync.start(&principal(), &tx);
        assert_eq!(sync.subscription_count(), 3);

        store.deliver_next(Collection::Boards);
        store.deliver_next(Collection::Tickets);
        drain(&mut sync, &rx);
        assert!(!sync.is_loaded());
        assert_eq!(sync.snapshot().boards.len(), 1);

        store.fail_subscriptions(Collection::Users, &StoreError::Unavailable("down".into()));
        store.deliver_next(Collection::Users);
        store.deliver_next(Collection::Users);
        drain(&mut sync, &rx);
        assert!(sync.is_loaded());
        assert!(sync.snapshot().users.is_empty());
    }

    #[test]
    fn errors_keep_last_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&board("b1")).unwrap();
        let (tx, rx) = events::channel();
        let mut sync = SyncCoordinator::new(Arc::clone(&store) as Arc<dyn DocumentStore>);
        sync.start(&principal(), &tx);
        drain(&mut sync, &rx);
        store.fail_subscriptions(Collection::Boards, &StoreError::Unavailable("down".into()));
        drain(&mut sync, &rx);
        assert_eq!(sync.snapshot().boards.len(), 1);
    }

    #[test]
    fn stop_discards_queued_pushes() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&board("b1")).unwrap();
        let (tx, rx) = events::channel();
        let mut sync = SyncCoordinator::new(Arc::clone(&store) as Arc<dyn DocumentStore>);
        sync.start(&principal(), &tx);
        sync.stop();
        assert_eq!(drain(&mut sync, &rx), 0);
        assert!(sync.snapshot().boards.is_empty());
        assert!(!sync.is_active());
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn undecodable_documents_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&board("b1")).unwrap();
        let mut bad = crate::store::Fields::new();
        bad.insert("name".into(), serde_json::json!(["not", "a", "name"]));
        store.set(Collection::Boards, "b2", bad, false).unwrap();
        let (tx, rx) = events::channel();
        let mut sync = SyncCoordinator::new(Arc::clone(&store) as Arc<dyn DocumentStore>);
        sync.start(&principal(), &tx);
        drain(&mut sync, &rx);
        assert_eq!(sync.snapshot().boards.len(), 1);
        assert_eq!(sync.snapshot().boards[0].id.as_str(), "b1");
    }
}
