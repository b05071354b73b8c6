use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::UserId;
use crate::store::{Collection, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a MIME content type. Anything but images and videos is
    /// rejected.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let lowered = content_type.trim().to_ascii_lowercase();
        if lowered.starts_with("image/") {
            Some(Self::Image)
        } else if lowered.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMedia {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub url: String,
}

/// A team chat message from `chat_messages`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub read_by: Vec<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<ChatMedia>,
}

impl ChatMessage {
    #[must_use]
    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.contains(user)
    }
}

impl Record for ChatMessage {
    const COLLECTION: Collection = Collection::ChatMessages;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Per-user typing flag from `chat_typing`, keyed by uid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypingStatus {
    pub id: String,
    pub uid: UserId,
    pub name: String,
    pub is_typing: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Record for TypingStatus {
    const COLLECTION: Collection = Collection::ChatTyping;

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_follows_content_type() {
        assert_eq!(MediaKind::from_content_type("image/png"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_content_type("Video/MP4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_content_type("application/pdf"), None);
    }
}
