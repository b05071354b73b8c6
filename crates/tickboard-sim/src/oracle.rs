//! Invariant checks run against the session after every applied event,
//! and once more after the simulation has quiesced.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tickboard_core::identity::IdentityProvider;
use tickboard_core::model::{Board, Principal, Ticket, UserRecord};
use tickboard_core::session::Session;
use tickboard_core::store::{Collection, DocumentStore, MemoryStore, Query, decode_snapshot};
use tickboard_core::sync::CollectionSnapshot;
use tickboard_core::visibility::derive_visible;

/// One broken invariant, with enough context to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvariantViolation {
    /// The stored view differs from a fresh derivation of the same inputs.
    StaleView { step: usize },
    /// A visible item is missing from the raw snapshot.
    NotInSnapshot { step: usize, kind: String, id: String },
    /// A ticket is visible while its board is not.
    UngatedTicket { step: usize, ticket: String },
    /// Something is visible with no principal, or while loading.
    LeakedView { step: usize, loading: bool },
    /// Sync state survived the principal going away.
    LingeringSync { step: usize },
    /// The principal's own profile is hidden from them.
    HiddenSelf { step: usize, user: String },
    /// An admin's view is not the full snapshot.
    PartialAdminView { step: usize },
    /// The board rule disagrees with the derived view.
    BoardRule { step: usize, board: String, expected: bool },
    /// After quiescence the principal does not match the provider.
    PrincipalMismatch { expected: Option<String>, actual: Option<String> },
    /// After quiescence a snapshot differs from the store.
    SnapshotDrift { collection: String },
    /// After quiescence the principal's role differs from the profile.
    RoleDrift { user: String },
    /// The reserved admin account was not healed.
    AdminNotRestored { user: String },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleView { step } => write!(f, "step {step}: view differs from its inputs"),
            Self::NotInSnapshot { step, kind, id } => {
                write!(f, "step {step}: visible {kind} {id} missing from snapshot")
            }
            Self::UngatedTicket { step, ticket } => {
                write!(f, "step {step}: ticket {ticket} visible without its board")
            }
            Self::LeakedView { step, loading } => {
                write!(f, "step {step}: non-empty view (loading={loading})")
            }
            Self::LingeringSync { step } => {
                write!(f, "step {step}: sync state kept without a principal")
            }
            Self::HiddenSelf { step, user } => write!(f, "step {step}: {user} cannot see self"),
            Self::PartialAdminView { step } => write!(f, "step {step}: admin view incomplete"),
            Self::BoardRule {
                step,
                board,
                expected,
            } => write!(f, "step {step}: board {board} visible should be {expected}"),
            Self::PrincipalMismatch { expected, actual } => {
                write!(f, "principal {actual:?} but provider reports {expected:?}")
            }
            Self::SnapshotDrift { collection } => {
                write!(f, "{collection} snapshot differs from the store")
            }
            Self::RoleDrift { user } => write!(f, "principal role of {user} differs from profile"),
            Self::AdminNotRestored { user } => write!(f, "reserved admin {user} not restored"),
        }
    }
}

/// Accumulates violations over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Oracle {
    steps: usize,
    violations: Vec<InvariantViolation>,
}

impl Oracle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn steps_checked(&self) -> usize {
        self.steps
    }

    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    #[must_use]
    pub fn into_violations(self) -> Vec<InvariantViolation> {
        self.violations
    }

    /// Check the invariants that must hold after every applied event.
    pub fn check_step(&mut self, session: &Session) {
        let step = self.steps;
        self.steps += 1;
        let found = step_violations(step, session);
        self.violations.extend(found);
    }

    /// Check convergence once nothing is queued anywhere.
    ///
    /// `stale` lists collections whose last push was a stream error; their
    /// snapshots are allowed to lag the store.
    pub fn check_quiescent(
        &mut self,
        session: &Session,
        store: &MemoryStore,
        identity: &dyn IdentityProvider,
        super_admin_email: Option<&str>,
        stale: &BTreeSet<Collection>,
    ) {
        let found = quiescent_violations(session, store, identity, super_admin_email, stale);
        self.violations.extend(found);
    }
}

fn step_violations(step: usize, session: &Session) -> Vec<InvariantViolation> {
    let mut found = Vec::new();
    let principal = session.principal();
    let loading = session.loading();
    let snapshot = session.snapshot();
    let view = session.view();

    if view != &derive_visible(principal, snapshot.collections(), loading) {
        found.push(InvariantViolation::StaleView { step });
    }
    if (principal.is_none() || loading) && !view.is_empty() {
        found.push(InvariantViolation::LeakedView { step, loading });
    }
    if principal.is_none()
        && (session.subscription_count() > 0
            || !snapshot.boards.is_empty()
            || !snapshot.tickets.is_empty()
            || !snapshot.users.is_empty())
    {
        found.push(InvariantViolation::LingeringSync { step });
    }

    subset_violations(step, snapshot, &view.boards, &view.tickets, &view.users, &mut found);

    let visible_boards: HashSet<&str> = view.boards.iter().map(|b| b.id.as_str()).collect();
    for ticket in &view.tickets {
        if !visible_boards.contains(ticket.super_board_id.as_str()) {
            found.push(InvariantViolation::UngatedTicket {
                step,
                ticket: ticket.id.to_string(),
            });
        }
    }

    let Some(principal) = principal else {
        return found;
    };
    if loading {
        return found;
    }
    if snapshot.users.iter().any(|u| u.id == principal.id)
        && !view.users.iter().any(|u| u.id == principal.id)
    {
        found.push(InvariantViolation::HiddenSelf {
            step,
            user: principal.id.to_string(),
        });
    }
    if principal.sees_everything() {
        if view.boards.len() != snapshot.boards.len()
            || view.tickets.len() != snapshot.tickets.len()
            || view.users.len() != snapshot.users.len()
        {
            found.push(InvariantViolation::PartialAdminView { step });
        }
    } else {
        board_rule_violations(step, principal, snapshot, &visible_boards, &mut found);
    }
    found
}

fn subset_violations(
    step: usize,
    snapshot: &CollectionSnapshot,
    boards: &[Board],
    tickets: &[Ticket],
    users: &[UserRecord],
    found: &mut Vec<InvariantViolation>,
) {
    let missing = |kind: &str, id: &str| InvariantViolation::NotInSnapshot {
        step,
        kind: kind.to_string(),
        id: id.to_string(),
    };
    for board in boards {
        if !snapshot.boards.contains(board) {
            found.push(missing("board", board.id.as_str()));
        }
    }
    for ticket in tickets {
        if !snapshot.tickets.contains(ticket) {
            found.push(missing("ticket", ticket.id.as_str()));
        }
    }
    for user in users {
        if !snapshot.users.contains(user) {
            found.push(missing("user", user.id.as_str()));
        }
    }
}

/// Re-derive board visibility from the raw rule and compare.
fn board_rule_violations(
    step: usize,
    principal: &Principal,
    snapshot: &CollectionSnapshot,
    visible: &HashSet<&str>,
    found: &mut Vec<InvariantViolation>,
) {
    for board in snapshot.boards.iter() {
        let assigned_here = snapshot
            .tickets
            .iter()
            .any(|t| t.super_board_id == board.id && t.is_assigned_to(&principal.id));
        let expected = principal.group_assignments.contains(&board.name)
            || assigned_here
            || board.created_by == principal.id;
        if expected != visible.contains(board.id.as_str()) {
            found.push(InvariantViolation::BoardRule {
                step,
                board: board.id.to_string(),
                expected,
            });
        }
    }
}

fn ids_of(store: &MemoryStore, collection: Collection) -> Vec<String> {
    let mut ids: Vec<String> = store
        .query(&Query::new(collection))
        .map(|docs| docs.into_iter().map(|doc| doc.id).collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

fn snapshot_ids(snapshot: &CollectionSnapshot, collection: Collection) -> Vec<String> {
    let mut ids: Vec<String> = match collection {
        Collection::Boards => snapshot.boards.iter().map(|b| b.id.to_string()).collect(),
        Collection::Tickets => snapshot.tickets.iter().map(|t| t.id.to_string()).collect(),
        Collection::Users => snapshot.users.iter().map(|u| u.id.to_string()).collect(),
        Collection::ChatMessages | Collection::ChatTyping => Vec::new(),
    };
    ids.sort();
    ids
}

fn quiescent_violations(
    session: &Session,
    store: &MemoryStore,
    identity: &dyn IdentityProvider,
    super_admin_email: Option<&str>,
    stale: &BTreeSet<Collection>,
) -> Vec<InvariantViolation> {
    let mut found = Vec::new();
    if session.state().failure.is_some() {
        return found;
    }

    let expected = identity.current().map(|current| current.uid.to_string());
    let actual = session.principal().map(|p| p.id.to_string());
    if expected != actual {
        found.push(InvariantViolation::PrincipalMismatch { expected, actual });
        return found;
    }
    let Some(principal) = session.principal() else {
        return found;
    };

    for collection in tickboard_core::sync::SYNCED {
        if stale.contains(&collection) {
            continue;
        }
        if snapshot_ids(session.snapshot(), collection) != ids_of(store, collection) {
            found.push(InvariantViolation::SnapshotDrift {
                collection: collection.to_string(),
            });
        }
    }

    if stale.contains(&Collection::Users) {
        return found;
    }
    let profiles: Vec<UserRecord> = store
        .query(&Query::new(Collection::Users))
        .map(|docs| decode_snapshot(&docs))
        .unwrap_or_default();
    let Some(profile) = profiles.iter().find(|p| p.id == principal.id) else {
        return found;
    };
    if profile.role != principal.role {
        found.push(InvariantViolation::RoleDrift {
            user: principal.id.to_string(),
        });
    }
    let reserved = super_admin_email
        .is_some_and(|email| email.eq_ignore_ascii_case(principal.email.trim()));
    if reserved && !principal.is_admin() {
        found.push(InvariantViolation::AdminNotRestored {
            user: principal.id.to_string(),
        });
    }
    found
}
