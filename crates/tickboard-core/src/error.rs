use std::fmt;

use crate::identity::AuthError;
use crate::model::ParseEnumError;
use crate::store::StoreError;
use crate::store::blob::UploadError;

/// Machine-readable error codes surfaced next to user-facing notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotSignedIn,
    ConfigParseError,
    AuthFailed,
    SessionUnavailable,
    DocumentNotFound,
    PermissionDenied,
    InvalidRequest,
    InvalidEnumValue,
    DecodeFailed,
    QueryRejected,
    WriteRejected,
    StoreUnavailable,
    SubscriptionFailed,
    UploadFailed,
    NotificationFailed,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotSignedIn => "E1001",
            Self::ConfigParseError => "E1002",
            Self::AuthFailed => "E1003",
            Self::SessionUnavailable => "E1004",
            Self::DocumentNotFound => "E2001",
            Self::PermissionDenied => "E2002",
            Self::InvalidRequest => "E2003",
            Self::InvalidEnumValue => "E2004",
            Self::DecodeFailed => "E2005",
            Self::QueryRejected => "E3001",
            Self::WriteRejected => "E3002",
            Self::StoreUnavailable => "E3003",
            Self::SubscriptionFailed => "E3004",
            Self::UploadFailed => "E5001",
            Self::NotificationFailed => "E5002",
        }
    }

    /// Short human-facing summary for logs and notices.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotSignedIn => "Not signed in",
            Self::ConfigParseError => "Config file parse error",
            Self::AuthFailed => "Authentication failed",
            Self::SessionUnavailable => "Identity session unavailable",
            Self::DocumentNotFound => "Document not found",
            Self::PermissionDenied => "Permission denied",
            Self::InvalidRequest => "Invalid request",
            Self::InvalidEnumValue => "Invalid status/priority/type value",
            Self::DecodeFailed => "Document could not be decoded",
            Self::QueryRejected => "Query rejected by the document store",
            Self::WriteRejected => "Write rejected by the document store",
            Self::StoreUnavailable => "Document store unavailable",
            Self::SubscriptionFailed => "Realtime subscription failed",
            Self::UploadFailed => "Attachment upload failed",
            Self::NotificationFailed => "Push notification failed",
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotSignedIn => Some("Sign in before reading or writing tracker data."),
            Self::ConfigParseError => Some("Fix syntax in the tickboard config.toml and retry."),
            Self::AuthFailed => Some("Check the email and password and try again."),
            Self::SessionUnavailable => None,
            Self::DocumentNotFound => None,
            Self::PermissionDenied => {
                Some("Only admins, assignees or board creators may change this record.")
            }
            Self::InvalidRequest => None,
            Self::InvalidEnumValue => Some("Use one of the documented status/priority/type values."),
            Self::DecodeFailed => Some("The stored document has an unexpected shape."),
            Self::QueryRejected => {
                Some("Inequality filters and the first sort field must use the same field.")
            }
            Self::WriteRejected => None,
            Self::StoreUnavailable => Some("Check connectivity to the document store."),
            Self::SubscriptionFailed => {
                Some("Showing the last received data until the stream recovers.")
            }
            Self::UploadFailed => Some("Nothing was saved. Retry the upload."),
            Self::NotificationFailed => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors returned by tickboard operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("not signed in")]
    NotSignedIn,
    #[error("permission denied: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    InvalidValue(#[from] ParseEnumError),
    #[error("could not decode {context}: {source}")]
    Codec {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(err) => err.code(),
            Self::Store(err) => err.code(),
            Self::Upload(_) => ErrorCode::UploadFailed,
            Self::NotSignedIn => ErrorCode::NotSignedIn,
            Self::Forbidden(_) => ErrorCode::PermissionDenied,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::InvalidValue(_) => ErrorCode::InvalidEnumValue,
            Self::Codec { .. } => ErrorCode::DecodeFailed,
        }
    }

    pub(crate) fn codec(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Codec {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
