//! Blob storage for ticket attachments and chat media.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

use crate::model::MediaKind;

/// A file picked by the user, not yet uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn media_kind(&self) -> Option<MediaKind> {
        MediaKind::from_content_type(&self.content_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upload of '{key}' failed: {reason}")]
pub struct UploadError {
    pub key: String,
    pub reason: String,
}

/// Object storage returning a public URL per uploaded object.
pub trait BlobStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`UploadError`] when the object could not be stored.
    fn upload(&self, bytes: &[u8], content_type: &str, suggested_key: &str)
    -> Result<String, UploadError>;
}

/// Replace everything outside `[A-Za-z0-9.-]` with `_`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// `<prefix>/<millis>-<sanitized name>`.
#[must_use]
pub fn attachment_key(prefix: &str, at: DateTime<Utc>, file_name: &str) -> String {
    format!(
        "{}/{}-{}",
        prefix.trim_end_matches('/'),
        at.timestamp_millis(),
        sanitize_file_name(file_name)
    )
}

/// Upload every file in order and collect their URLs. Stops at the first
/// failure; nothing uploaded before it is referenced by any document.
///
/// # Errors
///
/// Returns the first [`UploadError`].
pub fn upload_all(
    blobs: &dyn BlobStore,
    prefix: &str,
    at: DateTime<Utc>,
    uploads: &[Upload],
) -> Result<Vec<String>, UploadError> {
    uploads
        .iter()
        .map(|upload| {
            let key = attachment_key(prefix, at, &upload.file_name);
            blobs
                .upload(&upload.bytes, &upload.content_type, &key)
                .inspect_err(|err| warn!(%key, error = %err, "attachment upload failed"))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// In-process blob store with failure injection.
pub struct MemoryBlobStore {
    base_url: String,
    state: Mutex<BlobState>,
}

#[derive(Default)]
struct BlobState {
    objects: BTreeMap<String, StoredBlob>,
    /// Remaining uploads that succeed before every further one fails.
    budget: Option<usize>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new("memory://blobs")
    }
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: Mutex::new(BlobState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Let `n` more uploads succeed, then fail the rest. `None` clears it.
    pub fn fail_uploads_after(&self, n: Option<usize>) {
        self.lock().budget = n;
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    #[must_use]
    pub fn object(&self, key: &str) -> Option<StoredBlob> {
        self.lock().objects.get(key).cloned()
    }
}

impl BlobStore for MemoryBlobStore {
    fn upload(
        &self,
        bytes: &[u8],
        content_type: &str,
        suggested_key: &str,
    ) -> Result<String, UploadError> {
        let mut state = self.lock();
        if let Some(budget) = state.budget.as_mut() {
            if *budget == 0 {
                return Err(UploadError {
                    key: suggested_key.to_string(),
                    reason: "storage quota exceeded".to_string(),
                });
            }
            *budget -= 1;
        }
        state.objects.insert(
            suggested_key.to_string(),
            StoredBlob {
                content_type: content_type.to_string(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(format!("{}/{suggested_key}", self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_names_are_sanitized_into_keys() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        assert_eq!(
            attachment_key("attachments/", at, "screen shot (1).png"),
            "attachments/1700000000000-screen_shot__1_.png"
        );
        assert_eq!(sanitize_file_name(""), "file");
    }

    #[test]
    fn upload_all_stops_at_first_failure() {
        let blobs = MemoryBlobStore::default();
        blobs.fail_uploads_after(Some(1));
        let at = Utc.timestamp_millis_opt(5).unwrap();
        let files = vec![
            Upload::new("a.png", "image/png", vec![1]),
            Upload::new("b.png", "image/png", vec![2]),
        ];
        let err = upload_all(&blobs, "attachments", at, &files).unwrap_err();
        assert_eq!(err.key, "attachments/5-b.png");
        assert_eq!(blobs.object_count(), 1);

        blobs.fail_uploads_after(None);
        let urls = upload_all(&blobs, "attachments", at, &files).unwrap();
        assert_eq!(urls[0], "memory://blobs/attachments/5-a.png");
    }
}
