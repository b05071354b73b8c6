//! Session state: the single owner of resolver, sync and derived view.
//!
//! Collaborator callbacks (auth listener, profile and collection
//! subscriptions) only enqueue [`SessionEvent`]s. [`Session::pump`] drains
//! the queue on the owner thread, applying one event at a time:
//!
//! 1. the event updates the resolver or the sync coordinator,
//! 2. sync is started, restarted or stopped when the principal's id
//!    changes,
//! 3. the visible view is recomputed.
//!
//! Every intermediate state is therefore reachable by a single-axis step,
//! and the visible view always matches the principal and snapshots it was
//! derived from.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::events::{self, EventReceiver, EventSender, SessionEvent};
use crate::identity::{AuthState, GroupPolicy, IdentityProvider, IdentityResolver};
use crate::model::Principal;
use crate::store::{DocumentStore, Subscription};
use crate::sync::{CollectionSnapshot, SyncCoordinator};
use crate::visibility::{VisibleView, derive_visible};

pub struct Session {
    resolver: IdentityResolver,
    sync: SyncCoordinator,
    sender: EventSender,
    receiver: EventReceiver,
    view: VisibleView,
    _auth: Subscription,
}

impl Session {
    /// Subscribe to auth state. The provider reports the current identity
    /// right away; call [`Self::pump`] to apply it.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: &dyn IdentityProvider,
        policy: Arc<dyn GroupPolicy>,
        config: &TrackerConfig,
    ) -> Self {
        let (sender, receiver) = events::channel();
        let auth_sender = sender.clone();
        let auth = identity.on_auth_state_changed(Box::new(move |change| {
            events::emit(&auth_sender, SessionEvent::Auth(change));
        }));
        Self {
            resolver: IdentityResolver::new(
                Arc::clone(&store),
                policy,
                config.auth.super_admin_email.clone(),
            ),
            sync: SyncCoordinator::new(store),
            sender,
            receiver,
            view: VisibleView::default(),
            _auth: auth,
        }
    }

    /// Apply every queued event. Returns how many were applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while self.pump_one() {
            applied += 1;
        }
        applied
    }

    /// Apply the next queued event, if any.
    pub fn pump_one(&mut self) -> bool {
        match self.receiver.try_recv() {
            Ok(event) => {
                self.apply(event);
                true
            }
            Err(_) => false,
        }
    }

    /// Wait up to `timeout` for one event and apply it.
    pub fn pump_timeout(&mut self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => {
                self.apply(event);
                true
            }
            Err(_) => false,
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        let changed = match event {
            SessionEvent::Auth(change) => self.resolver.on_auth_change(change, &self.sender),
            SessionEvent::Profile { generation, result } => {
                self.resolver.on_profile(generation, result)
            }
            SessionEvent::Snapshot {
                generation,
                collection,
                result,
            } => self.sync.apply(generation, collection, result),
        };
        let restarted = self.reconcile_sync();
        if changed || restarted {
            self.view = derive_visible(
                self.resolver.principal(),
                self.sync.snapshot().collections(),
                self.loading(),
            );
        }
    }

    /// Keep sync running for exactly the resolved principal.
    fn reconcile_sync(&mut self) -> bool {
        let wanted = self.resolver.principal().map(|principal| &principal.id);
        if wanted == self.sync.active_for() {
            return false;
        }
        match self.resolver.principal() {
            Some(principal) => {
                info!(uid = %principal.id, "principal resolved, starting sync");
                self.sync.start(principal, &self.sender);
            }
            None => {
                debug!("no principal, stopping sync");
                self.sync.stop();
            }
        }
        true
    }

    #[must_use]
    pub const fn view(&self) -> &VisibleView {
        &self.view
    }

    #[must_use]
    pub const fn state(&self) -> &AuthState {
        self.resolver.state()
    }

    #[must_use]
    pub const fn principal(&self) -> Option<&Principal> {
        self.resolver.principal()
    }

    /// # Errors
    ///
    /// Returns [`Error::NotSignedIn`] when no principal is resolved.
    pub fn require_principal(&self) -> Result<&Principal> {
        self.principal().ok_or(Error::NotSignedIn)
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.principal().is_some_and(Principal::is_admin)
    }

    /// Auth is resolving, or a signed-in principal's collections have not
    /// all delivered their first push.
    #[must_use]
    pub fn loading(&self) -> bool {
        self.state().loading || (self.principal().is_some() && !self.sync.is_loaded())
    }

    /// Raw (unfiltered) snapshots.
    #[must_use]
    pub const fn snapshot(&self) -> &CollectionSnapshot {
        self.sync.snapshot()
    }

    /// Open realtime subscriptions held by the sync coordinator.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.sync.subscription_count()
    }

    #[must_use]
    pub const fn sync_generation(&self) -> u64 {
        self.sync.generation()
    }
}
