//! Identity provider capability and principal resolution.
//!
//! The provider authenticates accounts and reports auth-state changes.
//! [`resolver::IdentityResolver`] turns those changes plus the user's
//! profile document into a [`Principal`](crate::model::Principal).

pub mod memory;
pub mod policy;
pub mod resolver;

use crate::error::ErrorCode;
use crate::model::UserId;
use crate::store::Subscription;

pub use memory::MemoryIdentityProvider;
pub use policy::{EmailMarkerPolicy, GrantTable, GroupPolicy, PolicySubject};
pub use resolver::{AuthState, IdentityResolver, ResolveFailure};

/// An authenticated account as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    pub uid: UserId,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("'{0}' is not a valid email address")]
    InvalidEmail(String),
    #[error("email '{0}' is already registered")]
    EmailInUse(String),
    #[error("password must be at least {min} characters")]
    WeakPassword { min: usize },
    #[error("no active session")]
    NoSession,
    #[error("identity provider error: {0}")]
    Provider(String),
}

impl AuthError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NoSession => ErrorCode::SessionUnavailable,
            Self::InvalidCredentials
            | Self::InvalidEmail(_)
            | Self::EmailInUse(_)
            | Self::WeakPassword { .. }
            | Self::Provider(_) => ErrorCode::AuthFailed,
        }
    }
}

/// Receives the current identity on registration and after every change.
pub type AuthListener = Box<dyn FnMut(Result<Option<AuthIdentity>, AuthError>) + Send>;

/// The primary authentication session plus a factory for isolated ones.
pub trait IdentityProvider: Send + Sync {
    /// Register for auth-state changes. The listener is called with the
    /// current state right away.
    fn on_auth_state_changed(&self, listener: AuthListener) -> Subscription;

    fn current(&self) -> Option<AuthIdentity>;

    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] on a bad email or password.
    fn sign_in(&self, email: &str, password: &str) -> Result<AuthIdentity, AuthError>;

    /// Create an account and sign the primary session into it.
    ///
    /// # Errors
    ///
    /// Returns an error if the account cannot be created.
    fn sign_up(&self, email: &str, password: &str) -> Result<AuthIdentity, AuthError>;

    /// # Errors
    ///
    /// Returns an error if the provider cannot end the session.
    fn sign_out(&self) -> Result<(), AuthError>;

    /// A second session that shares the account table but never touches the
    /// primary session.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot open another session.
    fn isolated_session(&self) -> Result<Box<dyn IdentitySession>, AuthError>;
}

/// An isolated identity session, used to provision accounts on behalf of
/// an admin.
pub trait IdentitySession: Send {
    /// # Errors
    ///
    /// Returns an error if the account cannot be created.
    fn sign_up(&mut self, email: &str, password: &str) -> Result<AuthIdentity, AuthError>;

    fn current(&self) -> Option<AuthIdentity>;

    /// # Errors
    ///
    /// Returns an error if the provider cannot end the session.
    fn sign_out(&mut self) -> Result<(), AuthError>;
}
