//! Visibility derivation and edit-rights predicates.
//!
//! [`derive_visible`] is a pure function of the principal, the three raw
//! collection snapshots and the loading flag. It is recomputed wholesale on
//! every change; nothing is cached between calls.
//!
//! For a principal that does not see everything (neither admin nor holder
//! of the `ALL` group) a board is visible when any of these hold:
//!
//! 1. its name is one of the principal's group tags (exact match),
//! 2. the principal is the assignee of a ticket on it,
//! 3. the principal created it.
//!
//! A ticket is visible exactly when its board is. A user is visible when
//! they are the assignee of a visible ticket, or are the principal.
//!
//! All of this is advisory. The document store enforces none of it.

use std::collections::HashSet;

use crate::model::{Board, BoardId, Principal, Status, Ticket, UserId, UserRecord};

/// Kanban columns, left to right. `complete` and `deleted` tickets are not
/// shown on the board.
pub const KANBAN_COLUMNS: [Status; 5] = [
    Status::Todo,
    Status::InProgress,
    Status::Fixed,
    Status::Blocked,
    Status::Deployed,
];

/// Borrowed view of the raw collections.
#[derive(Debug, Clone, Copy, Default)]
pub struct Collections<'a> {
    pub boards: &'a [Board],
    pub tickets: &'a [Ticket],
    pub users: &'a [UserRecord],
}

/// The authorized subset of each collection, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibleView {
    pub boards: Vec<Board>,
    pub tickets: Vec<Ticket>,
    pub users: Vec<UserRecord>,
}

impl VisibleView {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boards.is_empty() && self.tickets.is_empty() && self.users.is_empty()
    }

    #[must_use]
    pub fn board(&self, id: &BoardId) -> Option<&Board> {
        self.boards.iter().find(|board| &board.id == id)
    }

    /// Visible tickets on one board.
    pub fn tickets_on<'a>(&'a self, board: &'a BoardId) -> impl Iterator<Item = &'a Ticket> + 'a {
        self.tickets
            .iter()
            .filter(move |ticket| &ticket.super_board_id == board)
    }

    /// Visible tickets in one Kanban column, in view order.
    #[must_use]
    pub fn kanban_column(&self, status: Status, filter: &KanbanFilter) -> Vec<&Ticket> {
        self.tickets
            .iter()
            .filter(|ticket| ticket.status == status && filter.admits(ticket))
            .collect()
    }

    /// Every Kanban column with its tickets.
    #[must_use]
    pub fn kanban_columns(&self, filter: &KanbanFilter) -> Vec<(Status, Vec<&Ticket>)> {
        KANBAN_COLUMNS
            .iter()
            .map(|status| (*status, self.kanban_column(*status, filter)))
            .collect()
    }
}

/// Assignee and board pickers of the Kanban board. `None` means "all".
///
/// Only tickets already in the visible view are considered, so picking a
/// board outside it yields empty columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KanbanFilter {
    pub assignee: Option<UserId>,
    pub board: Option<BoardId>,
}

impl KanbanFilter {
    fn admits(&self, ticket: &Ticket) -> bool {
        self.assignee
            .as_ref()
            .is_none_or(|assignee| ticket.is_assigned_to(assignee))
            && self
                .board
                .as_ref()
                .is_none_or(|board| &ticket.super_board_id == board)
    }
}

/// Board rule for a principal that does not see everything.
/// `assigned_here` says whether they are the assignee of a ticket on it.
fn board_rule(principal: &Principal, board: &Board, assigned_here: bool) -> bool {
    principal.group_assignments.contains(&board.name)
        || assigned_here
        || board.created_by == principal.id
}

/// Compute the principal's visible boards, tickets and users.
///
/// No principal, or collections still loading, yields an empty view.
#[must_use]
pub fn derive_visible(
    principal: Option<&Principal>,
    collections: Collections<'_>,
    loading: bool,
) -> VisibleView {
    let Some(principal) = principal else {
        return VisibleView::default();
    };
    if loading {
        return VisibleView::default();
    }
    if principal.sees_everything() {
        return VisibleView {
            boards: collections.boards.to_vec(),
            tickets: collections.tickets.to_vec(),
            users: collections.users.to_vec(),
        };
    }

    let staked: HashSet<&BoardId> = collections
        .tickets
        .iter()
        .filter(|ticket| ticket.is_assigned_to(&principal.id))
        .map(|ticket| &ticket.super_board_id)
        .collect();

    let boards: Vec<Board> = collections
        .boards
        .iter()
        .filter(|board| board_rule(principal, board, staked.contains(&board.id)))
        .cloned()
        .collect();

    let board_ids: HashSet<&BoardId> = boards.iter().map(|board| &board.id).collect();
    let tickets: Vec<Ticket> = collections
        .tickets
        .iter()
        .filter(|ticket| board_ids.contains(&ticket.super_board_id))
        .cloned()
        .collect();

    let assignees: HashSet<&UserId> = tickets.iter().filter_map(Ticket::assignee).collect();
    let users: Vec<UserRecord> = collections
        .users
        .iter()
        .filter(|user| user.id == principal.id || assignees.contains(&user.id))
        .cloned()
        .collect();

    VisibleView {
        boards,
        tickets,
        users,
    }
}

/// Admins and the assignee may edit a ticket, including its status.
#[must_use]
pub fn can_edit_ticket(principal: &Principal, ticket: &Ticket) -> bool {
    principal.is_admin() || ticket.is_assigned_to(&principal.id)
}

/// Anyone who can see a ticket may comment on it. `board` is the ticket's
/// board (`None` when it no longer exists) and `assigned_here` whether the
/// principal is the assignee of any ticket on that board.
#[must_use]
pub fn can_comment_ticket(
    principal: &Principal,
    board: Option<&Board>,
    assigned_here: bool,
) -> bool {
    principal.sees_everything()
        || board.is_some_and(|board| board_rule(principal, board, assigned_here))
}

/// Admins and the creator may update or delete a board.
#[must_use]
pub fn can_manage_board(principal: &Principal, board: &Board) -> bool {
    principal.is_admin() || board.created_by == principal.id
}

#[must_use]
pub fn can_manage_users(principal: &Principal) -> bool {
    principal.is_admin()
}

#[must_use]
pub fn can_edit_profile(principal: &Principal, target: &UserId) -> bool {
    principal.is_admin() || &principal.id == target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupAssignments, Role};

    fn principal(id: &str, role: Option<Role>, groups: &[&str]) -> Principal {
        Principal {
            id: UserId::new(id),
            email: format!("{id}@x.com"),
            name: None,
            role,
            group_assignments: groups.iter().copied().collect::<GroupAssignments>(),
        }
    }

    fn board(id: &str, name: &str, creator: &str) -> Board {
        Board {
            id: BoardId::new(id),
            name: name.into(),
            created_by: UserId::new(creator),
            ..Board::default()
        }
    }

    fn ticket(id: &str, board: &str, assignee: Option<&str>) -> Ticket {
        Ticket {
            id: id.into(),
            super_board_id: BoardId::new(board),
            assignee_id: assignee.map(UserId::new),
            ..Ticket::default()
        }
    }

    fn user(id: &str) -> UserRecord {
        UserRecord {
            id: UserId::new(id),
            ..UserRecord::default()
        }
    }

    #[test]
    fn loading_or_anonymous_yields_nothing() {
        let boards = vec![board("b1", "BU", "u9")];
        let collections = Collections {
            boards: &boards,
            ..Collections::default()
        };
        let admin = principal("a", Some(Role::Admin), &[]);
        assert!(derive_visible(Some(&admin), collections, true).is_empty());
        assert!(derive_visible(None, collections, false).is_empty());
        assert_eq!(derive_visible(Some(&admin), collections, false).boards.len(), 1);
    }

    #[test]
    fn creator_sees_own_board_and_its_tickets() {
        let boards = vec![board("b1", "HR", "u1"), board("b2", "OPS", "u2")];
        let tickets = vec![ticket("t1", "b1", Some("u3")), ticket("t2", "b2", Some("u3"))];
        let users = vec![user("u1"), user("u2"), user("u3")];
        let me = principal("u1", Some(Role::User), &[]);
        let view = derive_visible(
            Some(&me),
            Collections {
                boards: &boards,
                tickets: &tickets,
                users: &users,
            },
            false,
        );
        assert_eq!(view.boards, vec![boards[0].clone()]);
        assert_eq!(view.tickets, vec![tickets[0].clone()]);
        let ids: Vec<&str> = view.users.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u3"]);
    }

    #[test]
    fn all_group_sees_everything() {
        let boards = vec![board("b1", "HR", "u9")];
        let users = vec![user("u9")];
        let viewer = principal("u1", Some(Role::User), &["ALL"]);
        let view = derive_visible(
            Some(&viewer),
            Collections {
                boards: &boards,
                tickets: &[],
                users: &users,
            },
            false,
        );
        assert_eq!(view.boards.len(), 1);
        assert_eq!(view.users.len(), 1);
    }

    #[test]
    fn dangling_ticket_references_stay_hidden() {
        let tickets = vec![ticket("t1", "missing", Some("u1"))];
        let me = principal("u1", None, &[]);
        let view = derive_visible(
            Some(&me),
            Collections {
                boards: &[],
                tickets: &tickets,
                users: &[],
            },
            false,
        );
        assert!(view.tickets.is_empty());
    }

    #[test]
    fn rights_follow_role_and_ownership() {
        let admin = principal("a", Some(Role::Admin), &[]);
        let assignee = principal("u1", Some(Role::User), &[]);
        let reporter = principal("u2", Some(Role::User), &[]);
        let stranger = principal("u3", Some(Role::User), &["ALL"]);
        let mut t = ticket("t1", "b1", Some("u1"));
        t.reporter_id = Some(UserId::new("u2"));

        assert!(can_edit_ticket(&admin, &t));
        assert!(can_edit_ticket(&assignee, &t));
        assert!(!can_edit_ticket(&reporter, &t));

        let b = board("b1", "BU", "u2");
        assert!(can_manage_board(&reporter, &b));
        assert!(!can_manage_board(&stranger, &b));
        assert!(can_manage_users(&admin));
        assert!(!can_manage_users(&stranger));
        assert!(can_edit_profile(&assignee, &UserId::new("u1")));
        assert!(!can_edit_profile(&assignee, &UserId::new("u2")));
    }

    #[test]
    fn commenting_follows_ticket_visibility() {
        let b = board("b1", "BU", "u9");
        let member = principal("u1", Some(Role::User), &["BU"]);
        let outsider = principal("u2", Some(Role::User), &["HR"]);
        let everyone = principal("u3", Some(Role::User), &["ALL"]);

        assert!(can_comment_ticket(&member, Some(&b), false));
        assert!(!can_comment_ticket(&outsider, Some(&b), false));
        assert!(can_comment_ticket(&outsider, Some(&b), true));
        assert!(can_comment_ticket(&everyone, Some(&b), false));
        assert!(can_comment_ticket(&everyone, None, false));
        assert!(!can_comment_ticket(&member, None, true));
    }

    fn kanban_view() -> VisibleView {
        let status_ticket = |id: &str, board: &str, assignee: &str, status: Status| Ticket {
            status,
            ..ticket(id, board, Some(assignee))
        };
        VisibleView {
            boards: vec![board("b1", "BU", "u9"), board("b2", "OPS", "u9")],
            tickets: vec![
                status_ticket("t1", "b1", "u1", Status::Todo),
                status_ticket("t2", "b2", "u2", Status::Todo),
                status_ticket("t3", "b1", "u2", Status::Blocked),
                status_ticket("t4", "b1", "u1", Status::Complete),
                status_ticket("t5", "b2", "u1", Status::Deployed),
            ],
            users: Vec::new(),
        }
    }

    fn column_ids(tickets: &[&Ticket]) -> Vec<String> {
        tickets.iter().map(|t| t.id.to_string()).collect()
    }

    #[test]
    fn kanban_columns_group_by_status_in_display_order() {
        let view = kanban_view();
        let columns = view.kanban_columns(&KanbanFilter::default());
        let statuses: Vec<Status> = columns.iter().map(|(status, _)| *status).collect();
        assert_eq!(statuses, KANBAN_COLUMNS.to_vec());
        assert_eq!(column_ids(&columns[0].1), vec!["t1", "t2"]);
        assert_eq!(column_ids(&columns[3].1), vec!["t3"]);
        assert_eq!(column_ids(&columns[4].1), vec!["t5"]);
        let shown: usize = columns.iter().map(|(_, tickets)| tickets.len()).sum();
        assert_eq!(shown, 4);
    }

    #[test]
    fn kanban_filters_combine() {
        let view = kanban_view();
        let mine = KanbanFilter {
            assignee: Some(UserId::new("u1")),
            board: None,
        };
        assert_eq!(column_ids(&view.kanban_column(Status::Todo, &mine)), vec!["t1"]);
        let ops_only = KanbanFilter {
            assignee: None,
            board: Some(BoardId::new("b2")),
        };
        assert_eq!(column_ids(&view.kanban_column(Status::Todo, &ops_only)), vec!["t2"]);
        let both = KanbanFilter {
            assignee: Some(UserId::new("u1")),
            board: Some(BoardId::new("b2")),
        };
        assert!(view.kanban_column(Status::Todo, &both).is_empty());
        assert_eq!(column_ids(&view.kanban_column(Status::Deployed, &both)), vec!["t5"]);
    }

    #[test]
    fn kanban_board_outside_the_view_is_empty() {
        let view = kanban_view();
        let hidden = KanbanFilter {
            assignee: None,
            board: Some(BoardId::new("b-hidden")),
        };
        assert!(view.kanban_columns(&hidden).iter().all(|(_, tickets)| tickets.is_empty()));
    }
}
