use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BoardId, UserId};
use crate::store::{Collection, Record};

/// A board ("super board") owning a set of tickets.
///
/// The board name doubles as the group tag matched against a principal's
/// group assignments (e.g. `BU`, `SMD`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Board {
    pub id: BoardId,
    pub name: String,
    pub created_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assigned_users: Vec<UserId>,
}

impl Board {
    /// Whether `user` may be picked as assignee for tickets on this board.
    ///
    /// Boards without an explicit member list accept everyone.
    #[must_use]
    pub fn accepts_assignee(&self, user: &UserId) -> bool {
        self.assigned_users.is_empty() || self.assigned_users.contains(user)
    }
}

impl Record for Board {
    const COLLECTION: Collection = Collection::Boards;

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBoard {
    pub name: String,
    pub assigned_users: Vec<UserId>,
}

impl NewBoard {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assigned_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_users: Option<Vec<UserId>>,
}

/// Resolve a board name for display, tolerating dangling references.
#[must_use]
pub fn board_name_or_unknown<'a>(boards: &'a [Board], id: &BoardId) -> &'a str {
    boards
        .iter()
        .find(|board| &board.id == id)
        .map_or("Unknown", |board| board.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_boards_accept_any_assignee() {
        let board = Board {
            id: BoardId::new("b1"),
            name: "BU".into(),
            ..Board::default()
        };
        assert!(board.accepts_assignee(&UserId::new("anyone")));
    }

    #[test]
    fn member_lists_restrict_assignees() {
        let board = Board {
            assigned_users: vec![UserId::new("u1")],
            ..Board::default()
        };
        assert!(board.accepts_assignee(&UserId::new("u1")));
        assert!(!board.accepts_assignee(&UserId::new("u2")));
    }

    #[test]
    fn dangling_board_reference_renders_unknown() {
        let boards = vec![Board {
            id: BoardId::new("b1"),
            name: "HR".into(),
            ..Board::default()
        }];
        assert_eq!(board_name_or_unknown(&boards, &BoardId::new("b1")), "HR");
        assert_eq!(board_name_or_unknown(&boards, &BoardId::new("gone")), "Unknown");
    }
}
