//! Tracker data model: boards, tickets, users, principals and chat.

pub mod board;
pub mod chat;
pub mod ids;
pub mod principal;
pub mod ticket;
pub mod user;

use std::fmt;

pub use board::{Board, BoardPatch, NewBoard};
pub use chat::{ChatMedia, ChatMessage, MediaKind, TypingStatus};
pub use ids::{BoardId, TicketId, UserId};
pub use principal::{GroupAssignments, GroupTag, Principal};
pub use ticket::{Comment, NewTicket, Priority, Status, Ticket, TicketPatch, TicketType};
pub use user::{NewUser, Role, UserPatch, UserRecord};

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}
