//! Ticket, board and profile writes.
//!
//! Every operation awaits the store's acknowledgement and then reports the
//! outcome through the [`Notifier`], success or failure. Nothing is applied
//! locally: the session only changes when the realtime push for the write
//! arrives.
//!
//! `createdAt` / `updatedAt` always come from [`DocumentStore::now`].
//! Attachments are uploaded before anything is written, and a failed
//! upload aborts the whole operation.
//!
//! Rights are checked with the predicates in [`crate::visibility`]. They
//! are advisory; the store does not enforce them.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::model::{
    Board, BoardId, BoardPatch, Comment, NewBoard, NewTicket, Principal, Status, Ticket, TicketId,
    TicketPatch, UserId, UserPatch,
};
use crate::notice::{Notice, Notifier};
use crate::store::blob::{BlobStore, Upload, upload_all};
use crate::store::{
    Collection, DocumentStore, Fields, Filter, Record, StoreError, encode, timestamp_value,
};
use crate::visibility::{
    can_comment_ticket, can_edit_profile, can_edit_ticket, can_manage_board, can_manage_users,
};

/// What the editor produces for an empty rich-text body.
const EMPTY_RICH_TEXT: &str = "<p><br></p>";

/// Notice texts for one operation.
struct Outcome {
    action: &'static str,
    success: &'static str,
    failure: &'static str,
}

const CREATE_TICKET: Outcome = Outcome {
    action: "create_ticket",
    success: "Ticket created successfully!",
    failure: "Failed to create ticket",
};
const UPDATE_TICKET: Outcome = Outcome {
    action: "update_ticket",
    success: "Ticket updated successfully!",
    failure: "Failed to update ticket",
};
const UPDATE_STATUS: Outcome = Outcome {
    action: "update_ticket_status",
    success: "Ticket status updated!",
    failure: "Failed to update status",
};
const ADD_COMMENT: Outcome = Outcome {
    action: "add_comment",
    success: "Comment added!",
    failure: "Failed to save comment",
};
const ADD_ATTACHMENTS: Outcome = Outcome {
    action: "add_attachments",
    success: "Attachments added!",
    failure: "Failed to add attachments",
};
const DELETE_TICKET: Outcome = Outcome {
    action: "delete_ticket",
    success: "Ticket deleted successfully!",
    failure: "Failed to delete ticket",
};
const CREATE_BOARD: Outcome = Outcome {
    action: "create_board",
    success: "Super Board created!",
    failure: "Failed to create Super Board",
};
const UPDATE_BOARD: Outcome = Outcome {
    action: "update_board",
    success: "Super Board updated!",
    failure: "Failed to update Super Board",
};
const DELETE_BOARD: Outcome = Outcome {
    action: "delete_board",
    success: "Super Board deleted!",
    failure: "Failed to delete Super Board",
};
const UPDATE_USER: Outcome = Outcome {
    action: "update_user",
    success: "User updated!",
    failure: "Failed to update user",
};
const DELETE_USER: Outcome = Outcome {
    action: "delete_user",
    success: "User deleted!",
    failure: "Failed to delete user",
};

/// Whether a comment body has no content: blank after trimming, or the
/// editor's empty paragraph.
#[must_use]
pub fn is_blank_comment(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed == EMPTY_RICH_TEXT
}

pub struct MutationService {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn Notifier>,
    key_prefix: String,
}

impl MutationService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
        uploads: &UploadConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            notifier,
            key_prefix: uploads.key_prefix.clone(),
        }
    }

    // --- tickets ---

    /// Create a ticket reported by `principal`, uploading `uploads` as
    /// images first.
    ///
    /// # Errors
    ///
    /// Returns an error for a blank title or missing board, a failed
    /// upload, or a rejected write.
    pub fn create_ticket(
        &self,
        principal: &Principal,
        ticket: NewTicket,
        uploads: &[Upload],
    ) -> Result<TicketId> {
        let result = self.try_create_ticket(principal, ticket, uploads);
        self.report(&CREATE_TICKET, result)
    }

    fn try_create_ticket(
        &self,
        principal: &Principal,
        ticket: NewTicket,
        uploads: &[Upload],
    ) -> Result<TicketId> {
        if ticket.title.trim().is_empty() {
            return Err(Error::InvalidRequest("a ticket needs a title".into()));
        }
        if ticket.super_board_id.is_empty() {
            return Err(Error::InvalidRequest("a ticket needs a board".into()));
        }
        let now = self.store.now();
        let mut images = ticket.images;
        images.extend(self.upload(now, uploads)?);

        let record = Ticket {
            id: TicketId::default(),
            title: ticket.title,
            description: ticket.description,
            status: ticket.status.unwrap_or_default(),
            priority: ticket.priority.unwrap_or_default(),
            ticket_type: ticket.ticket_type,
            assignee_id: ticket.assignee_id.filter(|id| !id.is_empty()),
            reporter_id: Some(principal.id.clone()),
            super_board_id: ticket.super_board_id,
            images,
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
            spend_time: None,
        };
        let fields = encode(&record).map_err(|err| Error::codec("new ticket", err))?;
        let id = self.store.create(Collection::Tickets, fields)?;
        Ok(TicketId::new(id))
    }

    /// Apply a partial update. Requires admin or assignee.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without edit rights, or the store error.
    pub fn update_ticket(&self, principal: &Principal, id: &TicketId, patch: TicketPatch) -> Result<()> {
        let result = self.try_update_ticket(principal, id, &patch);
        self.report(&UPDATE_TICKET, result)
    }

    /// Move a ticket to any status. There is no transition table.
    ///
    /// # Errors
    ///
    /// Same as [`Self::update_ticket`].
    pub fn update_ticket_status(&self, principal: &Principal, id: &TicketId, status: Status) -> Result<()> {
        let result = self.try_update_ticket(principal, id, &TicketPatch::status(status));
        self.report(&UPDATE_STATUS, result)
    }

    fn try_update_ticket(&self, principal: &Principal, id: &TicketId, patch: &TicketPatch) -> Result<()> {
        if patch.title.as_deref().is_some_and(|title| title.trim().is_empty()) {
            return Err(Error::InvalidRequest("a ticket needs a title".into()));
        }
        let ticket = self.load::<Ticket>(id.as_str())?;
        if !can_edit_ticket(principal, &ticket) {
            return Err(Error::Forbidden(format!(
                "only admins and the assignee may edit ticket {id}"
            )));
        }
        let fields = encode(patch).map_err(|err| Error::codec("ticket update", err))?;
        self.write_update(Collection::Tickets, id.as_str(), fields)
    }

    /// Append a comment authored by `principal`, with optional attachments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a blank comment without
    /// attachments, [`Error::Forbidden`] for principals who cannot see the
    /// ticket, and upload or store errors.
    pub fn add_comment(
        &self,
        principal: &Principal,
        id: &TicketId,
        text: &str,
        uploads: &[Upload],
    ) -> Result<()> {
        let result = self.try_add_comment(principal, id, text, uploads);
        self.report(&ADD_COMMENT, result)
    }

    fn try_add_comment(
        &self,
        principal: &Principal,
        id: &TicketId,
        text: &str,
        uploads: &[Upload],
    ) -> Result<()> {
        if is_blank_comment(text) && uploads.is_empty() {
            return Err(Error::InvalidRequest("a comment needs text or an attachment".into()));
        }
        let ticket = self.load::<Ticket>(id.as_str())?;
        if !self.sees_ticket(principal, &ticket)? {
            return Err(Error::Forbidden(format!("may not comment on ticket {id}")));
        }
        let now = self.store.now();
        let attachments = self.upload(now, uploads)?;

        let mut comments = ticket.comments;
        comments.push(Comment {
            text: if is_blank_comment(text) { String::new() } else { text.to_string() },
            author: principal.display_name().to_string(),
            timestamp: now,
            attachments,
        });
        let mut fields = Fields::new();
        fields.insert(
            "comments".into(),
            serde_json::to_value(&comments).map_err(|err| Error::codec("comments", err))?,
        );
        self.write_update(Collection::Tickets, id.as_str(), fields)
    }

    /// Upload files and append them to the ticket's images.
    ///
    /// # Errors
    ///
    /// Returns an error when nothing is attached, without edit rights, or
    /// when any upload fails (in which case nothing is written).
    pub fn add_attachments(&self, principal: &Principal, id: &TicketId, uploads: &[Upload]) -> Result<()> {
        let result = self.try_add_attachments(principal, id, uploads);
        self.report(&ADD_ATTACHMENTS, result)
    }

    fn try_add_attachments(&self, principal: &Principal, id: &TicketId, uploads: &[Upload]) -> Result<()> {
        if uploads.is_empty() {
            return Err(Error::InvalidRequest("no files to attach".into()));
        }
        let ticket = self.load::<Ticket>(id.as_str())?;
        if !can_edit_ticket(principal, &ticket) {
            return Err(Error::Forbidden(format!(
                "only admins and the assignee may attach files to ticket {id}"
            )));
        }
        let mut images = ticket.images;
        images.extend(self.upload(self.store.now(), uploads)?);
        let mut fields = Fields::new();
        fields.insert(
            "images".into(),
            Value::Array(images.into_iter().map(Value::String).collect()),
        );
        self.write_update(Collection::Tickets, id.as_str(), fields)
    }

    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without edit rights, or the store error.
    pub fn delete_ticket(&self, principal: &Principal, id: &TicketId) -> Result<()> {
        let result = self.try_delete_ticket(principal, id);
        self.report(&DELETE_TICKET, result)
    }

    fn try_delete_ticket(&self, principal: &Principal, id: &TicketId) -> Result<()> {
        let ticket = self.load::<Ticket>(id.as_str())?;
        if !can_edit_ticket(principal, &ticket) {
            return Err(Error::Forbidden(format!(
                "only admins and the assignee may delete ticket {id}"
            )));
        }
        self.store.delete(Collection::Tickets, id.as_str())?;
        Ok(())
    }

    // --- boards ---

    /// Create a board owned by `principal`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a blank name, or the store
    /// error.
    pub fn create_board(&self, principal: &Principal, board: NewBoard) -> Result<BoardId> {
        let result = self.try_create_board(principal, board);
        self.report(&CREATE_BOARD, result)
    }

    fn try_create_board(&self, principal: &Principal, board: NewBoard) -> Result<BoardId> {
        let name = board.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("a board needs a name".into()));
        }
        let record = Board {
            id: BoardId::default(),
            name: name.to_string(),
            created_by: principal.id.clone(),
            created_at: self.store.now(),
            updated_at: None,
            assigned_users: board.assigned_users,
        };
        let fields = encode(&record).map_err(|err| Error::codec("new board", err))?;
        let id = self.store.create(Collection::Boards, fields)?;
        Ok(BoardId::new(id))
    }

    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] unless admin or creator, or the store
    /// error.
    pub fn update_board(&self, principal: &Principal, id: &BoardId, patch: BoardPatch) -> Result<()> {
        let result = self.try_update_board(principal, id, &patch);
        self.report(&UPDATE_BOARD, result)
    }

    fn try_update_board(&self, principal: &Principal, id: &BoardId, patch: &BoardPatch) -> Result<()> {
        if patch.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(Error::InvalidRequest("a board needs a name".into()));
        }
        let board = self.load::<Board>(id.as_str())?;
        if !can_manage_board(principal, &board) {
            return Err(Error::Forbidden(format!(
                "only admins and the creator may change board {id}"
            )));
        }
        let fields = encode(patch).map_err(|err| Error::codec("board update", err))?;
        self.write_update(Collection::Boards, id.as_str(), fields)
    }

    /// Delete a board. Its tickets are left in place and render with an
    /// unknown board.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] unless admin or creator, or the store
    /// error.
    pub fn delete_board(&self, principal: &Principal, id: &BoardId) -> Result<()> {
        let result = self.try_delete_board(principal, id);
        self.report(&DELETE_BOARD, result)
    }

    fn try_delete_board(&self, principal: &Principal, id: &BoardId) -> Result<()> {
        let board = self.load::<Board>(id.as_str())?;
        if !can_manage_board(principal, &board) {
            return Err(Error::Forbidden(format!(
                "only admins and the creator may delete board {id}"
            )));
        }
        self.store.delete(Collection::Boards, id.as_str())?;
        Ok(())
    }

    // --- user profiles ---

    /// Update a profile. Users may edit their own; only admins may edit
    /// others or change a role.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without rights, or the store error
    /// ([`StoreError::NotFound`] when no profile exists).
    pub fn update_user(&self, principal: &Principal, id: &UserId, patch: UserPatch) -> Result<()> {
        let result = self.try_update_user(principal, id, &patch);
        self.report(&UPDATE_USER, result)
    }

    fn try_update_user(&self, principal: &Principal, id: &UserId, patch: &UserPatch) -> Result<()> {
        if !can_edit_profile(principal, id) {
            return Err(Error::Forbidden(format!("may not edit the profile of {id}")));
        }
        if patch.role.is_some() && !principal.is_admin() {
            return Err(Error::Forbidden("only admins may change roles".into()));
        }
        let fields = encode(patch).map_err(|err| Error::codec("profile update", err))?;
        self.write_update(Collection::Users, id.as_str(), fields)
    }

    /// Delete a profile record. The account itself stays with the identity
    /// provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] for non-admins, or the store error.
    pub fn delete_user(&self, principal: &Principal, id: &UserId) -> Result<()> {
        let result = self.try_delete_user(principal, id);
        self.report(&DELETE_USER, result)
    }

    fn try_delete_user(&self, principal: &Principal, id: &UserId) -> Result<()> {
        if !can_manage_users(principal) {
            return Err(Error::Forbidden("only admins may delete users".into()));
        }
        self.store.delete(Collection::Users, id.as_str())?;
        Ok(())
    }

    // --- helpers ---

    fn load<R: Record>(&self, id: &str) -> Result<R> {
        let doc = self
            .store
            .get(R::COLLECTION, id)?
            .ok_or_else(|| StoreError::NotFound {
                collection: R::COLLECTION,
                id: id.to_string(),
            })?;
        doc.decode::<R>()
            .map_err(|err| Error::codec(format!("{}/{id}", R::COLLECTION), err))
    }

    /// Whether `ticket` is in the principal's visible view.
    fn sees_ticket(&self, principal: &Principal, ticket: &Ticket) -> Result<bool> {
        if principal.sees_everything() {
            return Ok(true);
        }
        let board_id = ticket.super_board_id.as_str();
        let board = match self.store.get(Collection::Boards, board_id)? {
            Some(doc) => Some(
                doc.decode::<Board>()
                    .map_err(|err| Error::codec(format!("boards/{board_id}"), err))?,
            ),
            None => None,
        };
        let assigned_here = ticket.is_assigned_to(&principal.id)
            || self.store.count(
                Collection::Tickets,
                &[
                    Filter::eq("superBoardId", board_id),
                    Filter::eq("assigneeId", principal.id.as_str()),
                ],
            )? > 0;
        Ok(can_comment_ticket(principal, board.as_ref(), assigned_here))
    }

    fn write_update(&self, collection: Collection, id: &str, mut fields: Fields) -> Result<()> {
        if fields.is_empty() {
            return Err(Error::InvalidRequest("nothing to update".into()));
        }
        fields.insert("updatedAt".into(), timestamp_value(self.store.now()));
        self.store.update(collection, id, fields)?;
        Ok(())
    }

    fn upload(&self, at: chrono::DateTime<chrono::Utc>, uploads: &[Upload]) -> Result<Vec<String>> {
        Ok(upload_all(self.blobs.as_ref(), &self.key_prefix, at, uploads)?)
    }

    fn report<T>(&self, outcome: &Outcome, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                info!(action = outcome.action, "mutation applied");
                self.notifier.notify(Notice::success(outcome.success));
            }
            Err(err) => {
                warn!(action = outcome.action, code = err.code().code(), error = %err, "mutation failed");
                self.notifier.notify(Notice::error(
                    err.code(),
                    format!("{}: {err}", outcome.failure),
                ));
            }
        }
        result
    }
}
