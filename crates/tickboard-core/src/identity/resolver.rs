//! Identity resolution: auth identity + profile document → principal.
//!
//! The resolver is an explicit state machine driven by two inputs:
//!
//! - auth-state changes from the identity provider, and
//! - pushes of the signed-in user's `users/<uid>` document.
//!
//! Each identity gets its own profile subscription, tagged with a
//! generation so pushes for a previous identity are ignored. Provider
//! errors fail closed. Profile stream errors keep an already resolved
//! principal (stale but present) and fail closed only before the first
//! resolution.
//!
//! When the identity's email is the reserved super-admin address and the
//! stored role is not `admin`, the resolver merge-writes the role back
//! before finalizing the principal. The repair runs on every profile push
//! that needs it and never when the role is already `admin`.

use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::policy::{GroupPolicy, PolicySubject};
use super::{AuthError, AuthIdentity};
use crate::events::{self, EventSender, SessionEvent};
use crate::model::{GroupTag, Principal, Role, UserRecord};
use crate::store::{
    Collection, Document, DocumentStore, Fields, StoreError, Subscription, timestamp_value,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    Provider(AuthError),
    Profile(StoreError),
    /// The profile document has an unexpected shape.
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub loading: bool,
    pub principal: Option<Principal>,
    pub failure: Option<ResolveFailure>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            loading: true,
            principal: None,
            failure: None,
        }
    }
}

/// Whether `email` is the reserved super-admin address with a drifted role.
#[must_use]
pub fn needs_admin_repair(super_admin: Option<&str>, email: &str, role: Option<Role>) -> bool {
    super_admin.is_some_and(|reserved| reserved.trim().eq_ignore_ascii_case(email.trim()))
        && role != Some(Role::Admin)
}

/// Merge identity and profile. Profile fields win; the admin role implies
/// the `ALL` group.
#[must_use]
pub fn resolve_principal(
    identity: &AuthIdentity,
    profile: Option<&UserRecord>,
    policy: &dyn GroupPolicy,
) -> Principal {
    let email = profile
        .map(|p| p.email.as_str())
        .filter(|email| !email.is_empty())
        .unwrap_or(&identity.email)
        .to_string();
    let name = profile
        .map(|p| p.name.clone())
        .filter(|name| !name.is_empty())
        .or_else(|| identity.display_name.clone());
    let role = profile.and_then(|p| p.role);

    let mut group_assignments = policy.groups_for(&PolicySubject {
        id: &identity.uid,
        email: &email,
        role,
    });
    if role == Some(Role::Admin) {
        group_assignments.insert(GroupTag::all());
    }

    Principal {
        id: identity.uid.clone(),
        email,
        name,
        role,
        group_assignments,
    }
}

fn repair_fields(identity: &AuthIdentity, now: Value) -> Fields {
    let Value::Object(fields) = json!({
        "uid": identity.uid.as_str(),
        "email": identity.email,
        "role": Role::Admin.as_str(),
        "updatedAt": now,
    }) else {
        return Fields::new();
    };
    fields
}

pub struct IdentityResolver {
    store: Arc<dyn DocumentStore>,
    policy: Arc<dyn GroupPolicy>,
    super_admin_email: Option<String>,
    identity: Option<AuthIdentity>,
    generation: u64,
    profile_subscription: Option<Subscription>,
    state: AuthState,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        policy: Arc<dyn GroupPolicy>,
        super_admin_email: Option<String>,
    ) -> Self {
        Self {
            store,
            policy,
            super_admin_email,
            identity: None,
            generation: 0,
            profile_subscription: None,
            state: AuthState::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> &AuthState {
        &self.state
    }

    #[must_use]
    pub const fn principal(&self) -> Option<&Principal> {
        self.state.principal.as_ref()
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn identity(&self) -> Option<&AuthIdentity> {
        self.identity.as_ref()
    }

    fn close_profile(&mut self) {
        self.generation += 1;
        if let Some(subscription) = self.profile_subscription.take() {
            subscription.unsubscribe();
        }
    }

    /// Apply an auth-state change. Returns whether the state changed.
    pub fn on_auth_change(
        &mut self,
        change: Result<Option<AuthIdentity>, AuthError>,
        queue: &EventSender,
    ) -> bool {
        match change {
            Err(err) => {
                error!(error = %err, "identity provider failed, clearing principal");
                self.close_profile();
                self.identity = None;
                self.state = AuthState {
                    loading: false,
                    principal: None,
                    failure: Some(ResolveFailure::Provider(err)),
                };
                true
            }
            Ok(None) => {
                if self.identity.is_some() {
                    info!("signed out");
                }
                self.close_profile();
                self.identity = None;
                let next = AuthState {
                    loading: false,
                    principal: None,
                    failure: None,
                };
                let changed = self.state != next;
                self.state = next;
                changed
            }
            Ok(Some(identity)) => {
                let same_account = self
                    .identity
                    .as_ref()
                    .is_some_and(|current| current.uid == identity.uid);
                if same_account && self.profile_subscription.is_some() {
                    self.identity = Some(identity);
                    return false;
                }
                self.close_profile();
                debug!(uid = %identity.uid, "subscribing to profile");
                self.state = AuthState::default();
                self.open_profile(&identity, queue);
                self.identity = Some(identity);
                true
            }
        }
    }

    fn open_profile(&mut self, identity: &AuthIdentity, queue: &EventSender) {
        let generation = self.generation;
        let sender = queue.clone();
        let opened = self.store.subscribe_one(
            Collection::Users,
            identity.uid.as_str(),
            Box::new(move |result| {
                events::emit(&sender, SessionEvent::Profile { generation, result });
            }),
        );
        match opened {
            Ok(subscription) => self.profile_subscription = Some(subscription),
            Err(err) => {
                events::emit(
                    queue,
                    SessionEvent::Profile {
                        generation,
                        result: Err(err),
                    },
                );
            }
        }
    }

    /// Apply a profile push. Returns whether the state changed.
    pub fn on_profile(
        &mut self,
        generation: u64,
        result: Result<Option<Document>, StoreError>,
    ) -> bool {
        if generation != self.generation {
            debug!(generation, current = self.generation, "ignoring stale profile push");
            return false;
        }
        let Some(identity) = self.identity.clone() else {
            return false;
        };

        let profile = match result {
            Err(err) => return self.profile_failed(ResolveFailure::Profile(err)),
            Ok(None) => None,
            Ok(Some(doc)) => match doc.decode::<UserRecord>() {
                Ok(record) => Some(record),
                Err(err) => return self.profile_failed(ResolveFailure::Decode(err.to_string())),
            },
        };

        let profile = profile.map(|mut record| {
            if needs_admin_repair(self.super_admin_email.as_deref(), &identity.email, record.role)
                && self.repair_admin(&identity)
            {
                record.role = Some(Role::Admin);
            }
            record
        });

        let principal = resolve_principal(&identity, profile.as_ref(), self.policy.as_ref());
        let next = AuthState {
            loading: false,
            principal: Some(principal),
            failure: None,
        };
        let changed = self.state != next;
        self.state = next;
        changed
    }

    fn repair_admin(&self, identity: &AuthIdentity) -> bool {
        let fields = repair_fields(identity, timestamp_value(self.store.now()));
        match self
            .store
            .set(Collection::Users, identity.uid.as_str(), fields, true)
        {
            Ok(()) => {
                info!(uid = %identity.uid, "restored admin role for reserved account");
                true
            }
            Err(err) => {
                warn!(uid = %identity.uid, error = %err, "admin role repair failed");
                false
            }
        }
    }

    fn profile_failed(&mut self, failure: ResolveFailure) -> bool {
        if self.state.principal.is_some() {
            warn!(?failure, "profile stream failed, keeping last principal");
            self.state.failure = Some(failure);
        } else {
            error!(?failure, "profile unavailable, failing closed");
            self.state = AuthState {
                loading: false,
                principal: None,
                failure: Some(failure),
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::policy::{EmailMarkerPolicy, GrantTable};
    use crate::model::UserId;
    use crate::store::MemoryStore;

    fn identity(uid: &str, email: &str) -> AuthIdentity {
        AuthIdentity {
            uid: UserId::new(uid),
            email: email.to_string(),
            display_name: None,
        }
    }

    fn profile(uid: &str, email: &str, role: Option<Role>) -> UserRecord {
        UserRecord {
            id: UserId::new(uid),
            name: "Profile Name".into(),
            email: email.into(),
            role,
            ..UserRecord::default()
        }
    }

    fn resolver(store: &Arc<MemoryStore>, super_admin: Option<&str>) -> IdentityResolver {
        IdentityResolver::new(
            Arc::clone(store) as Arc<dyn DocumentStore>,
            Arc::new(GrantTable::new().with_grant("u1", ["BU"])),
            super_admin.map(str::to_string),
        )
    }

    fn drain(resolver: &mut IdentityResolver, rx: &crate::events::EventReceiver) {
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Profile { generation, result } = event {
                resolver.on_profile(generation, result);
            }
        }
    }

    #[test]
    fn profile_fields_win_and_grants_apply() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(&profile("u1", "profile@x.com", Some(Role::User)))
            .unwrap();
        let (tx, rx) = events::channel();
        let mut resolver = resolver(&store, None);
        resolver.on_auth_change(Ok(Some(identity("u1", "auth@x.com"))), &tx);
        assert!(resolver.state().loading);
        drain(&mut resolver, &rx);

        let principal = resolver.principal().unwrap();
        assert_eq!(principal.email, "profile@x.com");
        assert_eq!(principal.name.as_deref(), Some("Profile Name"));
        assert_eq!(principal.role, Some(Role::User));
        assert!(principal.group_assignments.contains("BU"));
        assert!(!resolver.state().loading);
    }

    #[test]
    fn missing_profile_yields_bare_identity_without_writes() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = events::channel();
        let mut resolver = resolver(&store, Some("root@x.com"));
        resolver.on_auth_change(Ok(Some(identity("u2", "root@x.com"))), &tx);
        drain(&mut resolver, &rx);
        let principal = resolver.principal().unwrap();
        assert_eq!(principal.role, None);
        assert!(principal.group_assignments.is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn reserved_email_is_repaired_once() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(&profile("u3", "Root@X.com", Some(Role::User)))
            .unwrap();
        let (tx, rx) = events::channel();
        let mut resolver = resolver(&store, Some("root@x.com"));
        resolver.on_auth_change(Ok(Some(identity("u3", "root@x.com"))), &tx);
        drain(&mut resolver, &rx);

        assert_eq!(store.write_count(), 1);
        let principal = resolver.principal().unwrap();
        assert!(principal.is_admin());
        assert!(principal.group_assignments.contains_all());
        let stored = store.get(Collection::Users, "u3").unwrap().unwrap();
        assert_eq!(stored.fields["role"], "admin");
        assert_eq!(stored.fields["name"], "Profile Name");
    }

    #[test]
    fn failed_repair_keeps_stored_role() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(&profile("u3", "root@x.com", Some(Role::User)))
            .unwrap();
        store.inject_write_failure(Some(StoreError::Denied("rules".into())));
        let (tx, rx) = events::channel();
        let mut resolver = resolver(&store, Some("root@x.com"));
        resolver.on_auth_change(Ok(Some(identity("u3", "root@x.com"))), &tx);
        drain(&mut resolver, &rx);
        assert_eq!(resolver.principal().unwrap().role, Some(Role::User));
    }

    #[test]
    fn provider_error_fails_closed() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&profile("u1", "a@x.com", None)).unwrap();
        let (tx, rx) = events::channel();
        let mut resolver = resolver(&store, None);
        resolver.on_auth_change(Ok(Some(identity("u1", "a@x.com"))), &tx);
        drain(&mut resolver, &rx);
        assert!(resolver.principal().is_some());

        resolver.on_auth_change(Err(AuthError::Provider("token expired".into())), &tx);
        let state = resolver.state();
        assert!(state.principal.is_none());
        assert!(!state.loading);
        assert_eq!(
            state.failure,
            Some(ResolveFailure::Provider(AuthError::Provider("token expired".into())))
        );
    }

    #[test]
    fn profile_errors_keep_resolved_principal() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&profile("u1", "a@x.com", None)).unwrap();
        let (tx, rx) = events::channel();
        let mut resolver = resolver(&store, None);
        resolver.on_auth_change(Ok(Some(identity("u1", "a@x.com"))), &tx);
        drain(&mut resolver, &rx);

        store.fail_subscriptions(Collection::Users, &StoreError::Unavailable("offline".into()));
        drain(&mut resolver, &rx);
        assert!(resolver.principal().is_some());
        assert!(matches!(
            resolver.state().failure,
            Some(ResolveFailure::Profile(_))
        ));
    }

    #[test]
    fn profile_error_before_resolution_fails_closed() {
        let store = Arc::new(MemoryStore::new().deferred());
        let (tx, _rx) = events::channel();
        let mut resolver = resolver(&store, None);
        resolver.on_auth_change(Ok(Some(identity("u5", "e@x.com"))), &tx);
        let generation = resolver.generation();
        resolver.on_profile(generation, Err(StoreError::Unavailable("offline".into())));
        assert!(resolver.principal().is_none());
        assert!(!resolver.state().loading);
        assert!(matches!(
            resolver.state().failure,
            Some(ResolveFailure::Profile(StoreError::Unavailable(_)))
        ));
    }

    #[test]
    fn pushes_for_previous_identity_are_ignored() {
        let store = Arc::new(MemoryStore::new().deferred());
        store.seed(&profile("u1", "a@x.com", Some(Role::Admin))).unwrap();
        let (tx, rx) = events::channel();
        let mut resolver = resolver(&store, None);
        resolver.on_auth_change(Ok(Some(identity("u1", "a@x.com"))), &tx);
        resolver.on_auth_change(Ok(None), &tx);
        store.deliver_all();
        drain(&mut resolver, &rx);
        assert!(resolver.principal().is_none());
        assert!(!resolver.state().loading);
    }

    #[test]
    fn marker_policy_and_admin_role_combine() {
        let id = identity("u7", "user3@x.com");
        let record = profile("u7", "user3@x.com", Some(Role::Admin));
        let principal = resolve_principal(&id, Some(&record), &EmailMarkerPolicy::default());
        assert!(principal.group_assignments.contains("SMD"));
        assert!(principal.group_assignments.contains_all());
    }

    #[test]
    fn repair_predicate() {
        assert!(needs_admin_repair(Some("Root@x.com"), "root@X.com", Some(Role::User)));
        assert!(needs_admin_repair(Some("root@x.com"), "root@x.com", None));
        assert!(!needs_admin_repair(Some("root@x.com"), "root@x.com", Some(Role::Admin)));
        assert!(!needs_admin_repair(Some("root@x.com"), "other@x.com", Some(Role::User)));
        assert!(!needs_admin_repair(None, "root@x.com", None));
    }
}
