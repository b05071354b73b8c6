//! The simulated world: accounts, an admin writing through the mutation
//! service, and the primary session signing in and out.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tickboard_core::config::UploadConfig;
use tickboard_core::identity::{GrantTable, IdentityProvider, MemoryIdentityProvider};
use tickboard_core::model::{
    BoardId, BoardPatch, GroupAssignments, GroupTag, NewBoard, NewTicket, Principal, Role,
    Status, TicketId, TicketPatch, UserId, UserPatch, UserRecord,
};
use tickboard_core::mutation::MutationService;
use tickboard_core::notice::TracingNotifier;
use tickboard_core::store::blob::MemoryBlobStore;
use tickboard_core::store::{Collection, DocumentStore, MemoryStore};

use crate::rng::DeterministicRng;

/// Board names; the first three double as group tags.
pub const BOARD_NAMES: [&str; 4] = ["BU", "OPS", "HR", "MISC"];
pub const PASSWORD: &str = "simulated-pass";

/// Index of a simulated account.
pub type UserIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    SignIn { user: UserIndex },
    SignOut,
    CreateBoard { name: usize },
    RenameBoard { board: usize, name: usize },
    DeleteBoard { board: usize },
    CreateTicket { board: usize, assignee: Option<UserIndex> },
    Reassign { ticket: usize, assignee: Option<UserIndex> },
    MoveTicket { ticket: usize, board: usize },
    SetStatus { ticket: usize },
    DeleteTicket { ticket: usize },
    SetRole { user: UserIndex, admin: bool },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignIn { user } => write!(f, "sign in as user {user}"),
            Self::SignOut => f.write_str("sign out"),
            Self::CreateBoard { name } => write!(f, "create board #{name}"),
            Self::RenameBoard { board, name } => write!(f, "rename board {board} to #{name}"),
            Self::DeleteBoard { board } => write!(f, "delete board {board}"),
            Self::CreateTicket { board, assignee } => {
                write!(f, "create ticket on board {board} for {assignee:?}")
            }
            Self::Reassign { ticket, assignee } => {
                write!(f, "reassign ticket {ticket} to {assignee:?}")
            }
            Self::MoveTicket { ticket, board } => write!(f, "move ticket {ticket} to board {board}"),
            Self::SetStatus { ticket } => write!(f, "change status of ticket {ticket}"),
            Self::DeleteTicket { ticket } => write!(f, "delete ticket {ticket}"),
            Self::SetRole { user, admin } => write!(f, "set user {user} admin={admin}"),
        }
    }
}

#[must_use]
pub fn email_for(user: UserIndex) -> String {
    format!("user{user}@sim.test")
}

/// Everything outside the session under test.
pub struct World {
    pub store: Arc<MemoryStore>,
    pub identity: Arc<MemoryIdentityProvider>,
    pub grants: GrantTable,
    users: Vec<UserId>,
    boards: Vec<BoardId>,
    tickets: Vec<TicketId>,
    admin: Principal,
    mutations: MutationService,
    signed_in: Option<UserIndex>,
}

impl World {
    /// Create `user_count` accounts with profiles. User 0 holds the reserved
    /// admin email but starts with a drifted `user` role; user 1 is a
    /// regular admin.
    ///
    /// # Errors
    ///
    /// Returns an error if an account or profile cannot be created.
    pub fn new(store: Arc<MemoryStore>, user_count: usize) -> Result<Self> {
        let identity = Arc::new(MemoryIdentityProvider::new());
        let mut grants = GrantTable::new();
        let mut users = Vec::with_capacity(user_count);
        for index in 0..user_count {
            let account = identity
                .add_account(&email_for(index), PASSWORD)
                .with_context(|| format!("creating account {index}"))?;
            let role = if index == 1 { Role::Admin } else { Role::User };
            store
                .seed(&UserRecord {
                    id: account.uid.clone(),
                    name: format!("User {index}"),
                    email: account.email.clone(),
                    role: Some(role),
                    ..UserRecord::default()
                })
                .context("seeding profile")?;
            grants.grant(account.uid.clone(), [BOARD_NAMES[index % 3]]);
            users.push(account.uid);
        }

        let mut assignments = GroupAssignments::new();
        assignments.insert(GroupTag::all());
        let admin = Principal {
            id: users.get(1).or_else(|| users.first()).cloned().unwrap_or_default(),
            email: "operator@sim.test".to_string(),
            name: Some("Operator".to_string()),
            role: Some(Role::Admin),
            group_assignments: assignments,
        };
        let mutations = MutationService::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::new(MemoryBlobStore::default()),
            Arc::new(TracingNotifier),
            &UploadConfig::default(),
        );

        Ok(Self {
            store,
            identity,
            grants,
            users,
            boards: Vec::new(),
            tickets: Vec::new(),
            admin,
            mutations,
            signed_in: None,
        })
    }

    #[must_use]
    pub const fn signed_in(&self) -> Option<UserIndex> {
        self.signed_in
    }

    #[must_use]
    pub fn user_id(&self, user: UserIndex) -> Option<&UserId> {
        self.users.get(user)
    }

    /// Pick an action that makes sense in the current world.
    pub fn choose(&self, rng: &mut DeterministicRng) -> Action {
        let users = self.users.len();
        let roll = rng.next_bounded(100);
        let assignee = |rng: &mut DeterministicRng| {
            if rng.hit_rate_percent(20) {
                None
            } else {
                rng.index(users)
            }
        };
        match roll {
            0..=9 => Action::SignIn {
                user: rng.index(users).unwrap_or(0),
            },
            10..=13 => Action::SignOut,
            14..=21 => Action::CreateBoard {
                name: rng.index(BOARD_NAMES.len()).unwrap_or(0),
            },
            _ if self.boards.is_empty() => Action::CreateBoard {
                name: rng.index(BOARD_NAMES.len()).unwrap_or(0),
            },
            22..=26 => Action::RenameBoard {
                board: rng.index(self.boards.len()).unwrap_or(0),
                name: rng.index(BOARD_NAMES.len()).unwrap_or(0),
            },
            27..=29 => Action::DeleteBoard {
                board: rng.index(self.boards.len()).unwrap_or(0),
            },
            30..=54 => Action::CreateTicket {
                board: rng.index(self.boards.len()).unwrap_or(0),
                assignee: assignee(rng),
            },
            55..=94 if !self.tickets.is_empty() => {
                let ticket = rng.index(self.tickets.len()).unwrap_or(0);
                match roll {
                    55..=69 => Action::Reassign {
                        ticket,
                        assignee: assignee(rng),
                    },
                    70..=79 => Action::MoveTicket {
                        ticket,
                        board: rng.index(self.boards.len()).unwrap_or(0),
                    },
                    80..=88 => Action::SetStatus { ticket },
                    _ => Action::DeleteTicket { ticket },
                }
            }
            _ => Action::SetRole {
                user: rng.index(users).unwrap_or(0),
                admin: rng.hit_rate_percent(50),
            },
        }
    }

    /// Carry out `action`. Returns the collection it wrote to, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if a write the operator is entitled to fails, or
    /// the action refers to something that does not exist.
    pub fn perform(&mut self, action: Action, rng: &mut DeterministicRng) -> Result<Option<Collection>> {
        match action {
            Action::SignIn { user } => {
                self.identity
                    .sign_in(&email_for(user), PASSWORD)
                    .with_context(|| format!("signing in user {user}"))?;
                self.signed_in = Some(user);
                Ok(None)
            }
            Action::SignOut => {
                self.identity.sign_out().context("signing out")?;
                self.signed_in = None;
                Ok(None)
            }
            Action::CreateBoard { name } => {
                let name = BOARD_NAMES.get(name).copied().unwrap_or("MISC");
                let id = self.mutations.create_board(&self.admin, NewBoard::named(name))?;
                self.boards.push(id);
                Ok(Some(Collection::Boards))
            }
            Action::RenameBoard { board, name } => {
                let id = self.board(board)?;
                let patch = BoardPatch {
                    name: BOARD_NAMES.get(name).map(|name| (*name).to_string()),
                    ..BoardPatch::default()
                };
                self.mutations.update_board(&self.admin, &id, patch)?;
                Ok(Some(Collection::Boards))
            }
            Action::DeleteBoard { board } => {
                let id = self.board(board)?;
                self.mutations.delete_board(&self.admin, &id)?;
                self.boards.retain(|existing| existing != &id);
                Ok(Some(Collection::Boards))
            }
            Action::CreateTicket { board, assignee } => {
                let ticket = NewTicket {
                    title: format!("Ticket {}", self.tickets.len()),
                    assignee_id: assignee.and_then(|user| self.users.get(user).cloned()),
                    super_board_id: self.board(board)?,
                    ..NewTicket::default()
                };
                let id = self.mutations.create_ticket(&self.admin, ticket, &[])?;
                self.tickets.push(id);
                Ok(Some(Collection::Tickets))
            }
            Action::Reassign { ticket, assignee } => {
                let id = self.ticket(ticket)?;
                let patch = TicketPatch {
                    // An empty id unassigns.
                    assignee_id: Some(
                        assignee
                            .and_then(|user| self.users.get(user).cloned())
                            .unwrap_or_default(),
                    ),
                    ..TicketPatch::default()
                };
                self.mutations.update_ticket(&self.admin, &id, patch)?;
                Ok(Some(Collection::Tickets))
            }
            Action::MoveTicket { ticket, board } => {
                let id = self.ticket(ticket)?;
                let patch = TicketPatch {
                    super_board_id: Some(self.board(board)?),
                    ..TicketPatch::default()
                };
                self.mutations.update_ticket(&self.admin, &id, patch)?;
                Ok(Some(Collection::Tickets))
            }
            Action::SetStatus { ticket } => {
                let id = self.ticket(ticket)?;
                let status = *rng.pick(&Status::ALL).unwrap_or(&Status::Todo);
                self.mutations.update_ticket_status(&self.admin, &id, status)?;
                Ok(Some(Collection::Tickets))
            }
            Action::DeleteTicket { ticket } => {
                let id = self.ticket(ticket)?;
                self.mutations.delete_ticket(&self.admin, &id)?;
                self.tickets.retain(|existing| existing != &id);
                Ok(Some(Collection::Tickets))
            }
            Action::SetRole { user, admin } => {
                let id = self
                    .users
                    .get(user)
                    .cloned()
                    .with_context(|| format!("no user {user}"))?;
                let patch = UserPatch {
                    role: Some(if admin { Role::Admin } else { Role::User }),
                    ..UserPatch::default()
                };
                self.mutations.update_user(&self.admin, &id, patch)?;
                Ok(Some(Collection::Users))
            }
        }
    }

    fn board(&self, index: usize) -> Result<BoardId> {
        self.boards
            .get(index)
            .cloned()
            .with_context(|| format!("no board {index}"))
    }

    fn ticket(&self, index: usize) -> Result<TicketId> {
        self.tickets
            .get(index)
            .cloned()
            .with_context(|| format!("no ticket {index}"))
    }
}
