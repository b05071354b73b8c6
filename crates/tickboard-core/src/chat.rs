//! Team chat over the `chat_messages` and `chat_typing` collections.
//!
//! Sending uploads the optional media first and writes nothing if that
//! fails. After the message is stored the sender's typing flag is cleared
//! and every other user with a device token gets a push notification.
//! Push failures are logged and never fail the send.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{ChatConfig, UploadConfig};
use crate::error::{Error, ErrorCode, Result};
use crate::model::{
    ChatMedia, ChatMessage, MediaKind, Principal, TypingStatus, UserId, UserRecord,
};
use crate::notice::{Notice, Notifier};
use crate::store::blob::{BlobStore, Upload, attachment_key};
use crate::store::push::NotificationChannel;
use crate::store::{
    Collection, DocumentStore, Fields, Query, Subscription, decode_snapshot, encode,
    timestamp_value,
};

/// Key prefix for chat media, below the configured upload prefix.
const MEDIA_FOLDER: &str = "chat";

pub struct ChatService {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    push: Arc<dyn NotificationChannel>,
    notifier: Arc<dyn Notifier>,
    key_prefix: String,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        push: Arc<dyn NotificationChannel>,
        notifier: Arc<dyn Notifier>,
        uploads: &UploadConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            push,
            notifier,
            key_prefix: format!("{}/{MEDIA_FOLDER}", uploads.key_prefix.trim_end_matches('/')),
        }
    }

    /// Post a message with optional image or video. Returns the message id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an empty message or a media
    /// type other than image/video, the upload error, or the store error.
    pub fn send_message(
        &self,
        sender: &Principal,
        text: &str,
        media: Option<&Upload>,
    ) -> Result<String> {
        let result = self.try_send(sender, text, media);
        if let Err(err) = &result {
            warn!(uid = %sender.id, error = %err, "chat message not sent");
            self.notifier.notify(Notice::error(
                err.code(),
                format!("Failed to send message: {err}"),
            ));
        }
        result
    }

    fn try_send(&self, sender: &Principal, text: &str, media: Option<&Upload>) -> Result<String> {
        let text = text.trim();
        if text.is_empty() && media.is_none() {
            return Err(Error::InvalidRequest("a message needs text or media".into()));
        }
        let now = self.store.now();
        let media = match media {
            None => None,
            Some(upload) => {
                let kind = upload.media_kind().ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "only images and videos can be shared, not '{}'",
                        upload.content_type
                    ))
                })?;
                let key = attachment_key(&self.key_prefix, now, &upload.file_name);
                let url = self.blobs.upload(&upload.bytes, &upload.content_type, &key)?;
                Some(ChatMedia { kind, url })
            }
        };

        let message = ChatMessage {
            id: String::new(),
            text: text.to_string(),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name().to_string(),
            created_at: now,
            read_by: vec![sender.id.clone()],
            media,
        };
        let fields = encode(&message).map_err(|err| Error::codec("chat message", err))?;
        let id = self.store.create(Collection::ChatMessages, fields)?;
        debug!(%id, uid = %sender.id, "chat message stored");

        if let Err(err) = self.set_typing(sender, false) {
            warn!(uid = %sender.id, error = %err, "could not clear typing flag");
        }
        self.fan_out(&message);
        Ok(id)
    }

    /// Push the message to every other user with a device token. Returns
    /// how many pushes were accepted.
    fn fan_out(&self, message: &ChatMessage) -> usize {
        let users: Vec<UserRecord> = match self.store.query(&Query::new(Collection::Users)) {
            Ok(docs) => decode_snapshot(&docs),
            Err(err) => {
                error!(error = %err, "could not load recipients for chat push");
                return 0;
            }
        };
        let title = format!("New message from {}", message.sender_name);
        let body = push_body(message);
        let mut delivered = 0;
        for user in users.iter().filter(|user| user.id != message.sender_id) {
            let Some(token) = user.fcm_token.as_deref().filter(|token| !token.is_empty()) else {
                continue;
            };
            match self.push.send(token, &title, &body) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        uid = %user.id,
                        code = err.code().code(),
                        error = %err,
                        "chat push failed"
                    );
                }
            }
        }
        info!(delivered, "chat push fan-out done");
        delivered
    }

    /// Add `reader` to `readBy` on every message they have not read.
    /// Returns the number of messages updated.
    ///
    /// # Errors
    ///
    /// Returns the first store error; earlier messages stay marked.
    pub fn mark_all_read(&self, reader: &Principal, messages: &[ChatMessage]) -> Result<usize> {
        let mut updated = 0;
        for message in messages.iter().filter(|m| !m.is_read_by(&reader.id)) {
            let mut read_by = message.read_by.clone();
            read_by.push(reader.id.clone());
            let mut fields = Fields::new();
            fields.insert(
                "readBy".into(),
                Value::Array(read_by.into_iter().map(|id| Value::String(id.into_inner())).collect()),
            );
            self.store.update(Collection::ChatMessages, &message.id, fields)?;
            updated += 1;
        }
        if updated > 0 {
            debug!(uid = %reader.id, updated, "chat messages marked read");
        }
        Ok(updated)
    }

    /// Upsert `chat_typing/<uid>`.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub fn set_typing(&self, principal: &Principal, is_typing: bool) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("uid".into(), json!(principal.id.as_str()));
        fields.insert("name".into(), json!(principal.display_name()));
        fields.insert("isTyping".into(), json!(is_typing));
        fields.insert("updatedAt".into(), timestamp_value(self.store.now()));
        self.store
            .set(Collection::ChatTyping, principal.id.as_str(), fields, true)?;
        Ok(())
    }

    /// Subscribe to all messages, oldest first. Stream errors are logged
    /// and the sink keeps its last list.
    ///
    /// # Errors
    ///
    /// Returns the store error if the subscription cannot be opened.
    pub fn subscribe_messages(
        &self,
        mut sink: impl FnMut(Vec<ChatMessage>) + Send + 'static,
    ) -> Result<Subscription> {
        Ok(self.store.subscribe(
            Collection::ChatMessages,
            Box::new(move |result| match result {
                Ok(docs) => {
                    let mut messages: Vec<ChatMessage> = decode_snapshot(&docs);
                    messages.sort_by(|a, b| {
                        a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
                    });
                    sink(messages);
                }
                Err(err) => error!(
                    code = ErrorCode::SubscriptionFailed.code(),
                    error = %err,
                    "chat message stream failed"
                ),
            }),
        )?)
    }

    /// Subscribe to typing flags. Stream errors are logged.
    ///
    /// # Errors
    ///
    /// Returns the store error if the subscription cannot be opened.
    pub fn subscribe_typing(
        &self,
        mut sink: impl FnMut(Vec<TypingStatus>) + Send + 'static,
    ) -> Result<Subscription> {
        Ok(self.store.subscribe(
            Collection::ChatTyping,
            Box::new(move |result| match result {
                Ok(docs) => sink(decode_snapshot(&docs)),
                Err(err) => error!(
                    code = ErrorCode::SubscriptionFailed.code(),
                    error = %err,
                    "typing stream failed"
                ),
            }),
        )?)
    }
}

fn push_body(message: &ChatMessage) -> String {
    if !message.text.is_empty() {
        return message.text.clone();
    }
    match message.media.as_ref().map(|media| media.kind) {
        Some(MediaKind::Image) => "Sent an image".to_string(),
        Some(MediaKind::Video) => "Sent a video".to_string(),
        None => String::new(),
    }
}

/// Messages `user` has not read yet.
#[must_use]
pub fn unread_count(messages: &[ChatMessage], user: &UserId) -> usize {
    messages.iter().filter(|m| !m.is_read_by(user)).count()
}

/// Someone besides `me` has read the message.
#[must_use]
pub fn is_read_by_others(message: &ChatMessage, me: &UserId) -> bool {
    message.read_by.iter().any(|reader| reader != me)
}

/// Users other than `me` currently typing.
#[must_use]
pub fn typing_others<'a>(statuses: &'a [TypingStatus], me: &UserId) -> Vec<&'a TypingStatus> {
    statuses
        .iter()
        .filter(|status| status.is_typing && &status.uid != me)
        .collect()
}

/// "Ada is typing..." or "3 people are typing...".
#[must_use]
pub fn typing_label(others: &[&TypingStatus]) -> Option<String> {
    match others {
        [] => None,
        [one] => Some(format!("{} is typing...", one.name)),
        many => Some(format!("{} people are typing...", many.len())),
    }
}

/// Local typing state of the composer.
///
/// Input marks the user as typing; once no input has arrived for the idle
/// period, [`TypingTracker::poll`] tells the caller to clear the flag.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    idle: Duration,
    last_input: Option<DateTime<Utc>>,
}

impl TypingTracker {
    #[must_use]
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            idle: Duration::milliseconds(i64::try_from(config.typing_idle_ms).unwrap_or(i64::MAX)),
            last_input: None,
        }
    }

    /// Record a keystroke. Returns `true` when the typing flag should be
    /// raised (it was not already).
    pub fn on_input(&mut self, now: DateTime<Utc>) -> bool {
        self.last_input.replace(now).is_none()
    }

    /// Returns `true` once, when the idle period has passed since the last
    /// input and the flag should be cleared.
    pub fn poll(&mut self, now: DateTime<Utc>) -> bool {
        match self.last_input {
            Some(at) if now - at >= self.idle => {
                self.last_input = None;
                true
            }
            _ => false,
        }
    }

    /// The message was sent. Returns whether the flag was raised.
    pub fn on_send(&mut self) -> bool {
        self.last_input.take().is_some()
    }

    #[must_use]
    pub const fn is_typing(&self) -> bool {
        self.last_input.is_some()
    }
}
