//! In-process identity provider.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use super::{AuthError, AuthIdentity, AuthListener, IdentityProvider, IdentitySession};
use crate::model::UserId;
use crate::store::Subscription;

pub const MIN_PASSWORD_LEN: usize = 6;

struct Account {
    uid: UserId,
    email: String,
    password: String,
}

#[derive(Default)]
struct Accounts {
    /// Keyed by lowercased email.
    by_email: BTreeMap<String, Account>,
    next_uid: u64,
    sign_up_failure: Option<AuthError>,
    isolated_signed_in: usize,
}

impl Accounts {
    fn create(&mut self, email: &str, password: &str) -> Result<AuthIdentity, AuthError> {
        if let Some(err) = self.sign_up_failure.clone() {
            return Err(err);
        }
        let email = email.trim();
        if !email.contains('@') {
            return Err(AuthError::InvalidEmail(email.to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword {
                min: MIN_PASSWORD_LEN,
            });
        }
        let key = email.to_ascii_lowercase();
        if self.by_email.contains_key(&key) {
            return Err(AuthError::EmailInUse(email.to_string()));
        }
        self.next_uid += 1;
        let account = Account {
            uid: UserId::new(format!("uid-{:04}", self.next_uid)),
            email: email.to_string(),
            password: password.to_string(),
        };
        let identity = identity_of(&account);
        self.by_email.insert(key, account);
        Ok(identity)
    }

    fn verify(&self, email: &str, password: &str) -> Result<AuthIdentity, AuthError> {
        self.by_email
            .get(&email.trim().to_ascii_lowercase())
            .filter(|account| account.password == password)
            .map(identity_of)
            .ok_or(AuthError::InvalidCredentials)
    }
}

fn identity_of(account: &Account) -> AuthIdentity {
    AuthIdentity {
        uid: account.uid.clone(),
        email: account.email.clone(),
        display_name: None,
    }
}

type SharedListener = Arc<Mutex<AuthListener>>;

#[derive(Default)]
struct Primary {
    current: Option<AuthIdentity>,
    listeners: BTreeMap<u64, SharedListener>,
    next_listener: u64,
    changes: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn notify(listeners: Vec<SharedListener>, state: &Result<Option<AuthIdentity>, AuthError>) {
    for listener in listeners {
        let mut listener = lock(&listener);
        (*listener)(state.clone());
    }
}

/// Identity provider backed by an in-memory account table.
///
/// Uids are assigned sequentially (`uid-0001`, ...). Isolated sessions
/// share the account table with the primary session and nothing else.
#[derive(Default)]
pub struct MemoryIdentityProvider {
    accounts: Arc<Mutex<Accounts>>,
    primary: Arc<Mutex<Primary>>,
}

impl MemoryIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account without signing anyone in.
    ///
    /// # Errors
    ///
    /// Returns the same errors as sign-up.
    pub fn add_account(&self, email: &str, password: &str) -> Result<AuthIdentity, AuthError> {
        lock(&self.accounts).create(email, password)
    }

    #[must_use]
    pub fn uid_for(&self, email: &str) -> Option<UserId> {
        lock(&self.accounts)
            .by_email
            .get(&email.trim().to_ascii_lowercase())
            .map(|account| account.uid.clone())
    }

    /// How many times the primary session changed identity.
    #[must_use]
    pub fn primary_changes(&self) -> usize {
        lock(&self.primary).changes
    }

    /// Isolated sessions currently signed in.
    #[must_use]
    pub fn isolated_sessions_signed_in(&self) -> usize {
        lock(&self.accounts).isolated_signed_in
    }

    /// Fail every sign-up (primary and isolated) until cleared.
    pub fn fail_sign_ups(&self, err: Option<AuthError>) {
        lock(&self.accounts).sign_up_failure = err;
    }

    /// Report a provider failure to every listener.
    pub fn fail_listeners(&self, err: &AuthError) {
        let listeners: Vec<SharedListener> = lock(&self.primary).listeners.values().cloned().collect();
        notify(listeners, &Err(err.clone()));
    }

    fn switch_to(&self, next: Option<AuthIdentity>) {
        let listeners = {
            let mut primary = lock(&self.primary);
            if primary.current == next {
                return;
            }
            primary.current.clone_from(&next);
            primary.changes += 1;
            primary.listeners.values().cloned().collect::<Vec<_>>()
        };
        debug!(uid = ?next.as_ref().map(|id| id.uid.as_str()), "primary session changed");
        notify(listeners, &Ok(next));
    }
}

impl IdentityProvider for MemoryIdentityProvider {
    fn on_auth_state_changed(&self, listener: AuthListener) -> Subscription {
        let listener = Arc::new(Mutex::new(listener));
        let (id, current) = {
            let mut primary = lock(&self.primary);
            let id = primary.next_listener;
            primary.next_listener += 1;
            primary.listeners.insert(id, Arc::clone(&listener));
            (id, primary.current.clone())
        };
        notify(vec![listener], &Ok(current));

        let weak: Weak<Mutex<Primary>> = Arc::downgrade(&self.primary);
        Subscription::new(move || {
            if let Some(primary) = weak.upgrade() {
                lock(&primary).listeners.remove(&id);
            }
        })
    }

    fn current(&self) -> Option<AuthIdentity> {
        lock(&self.primary).current.clone()
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<AuthIdentity, AuthError> {
        let identity = lock(&self.accounts).verify(email, password)?;
        self.switch_to(Some(identity.clone()));
        Ok(identity)
    }

    fn sign_up(&self, email: &str, password: &str) -> Result<AuthIdentity, AuthError> {
        let identity = lock(&self.accounts).create(email, password)?;
        self.switch_to(Some(identity.clone()));
        Ok(identity)
    }

    fn sign_out(&self) -> Result<(), AuthError> {
        self.switch_to(None);
        Ok(())
    }

    fn isolated_session(&self) -> Result<Box<dyn IdentitySession>, AuthError> {
        Ok(Box::new(IsolatedSession {
            accounts: Arc::clone(&self.accounts),
            current: None,
        }))
    }
}

struct IsolatedSession {
    accounts: Arc<Mutex<Accounts>>,
    current: Option<AuthIdentity>,
}

impl IdentitySession for IsolatedSession {
    fn sign_up(&mut self, email: &str, password: &str) -> Result<AuthIdentity, AuthError> {
        let mut accounts = lock(&self.accounts);
        let identity = accounts.create(email, password)?;
        if self.current.is_none() {
            accounts.isolated_signed_in += 1;
        }
        self.current = Some(identity.clone());
        Ok(identity)
    }

    fn current(&self) -> Option<AuthIdentity> {
        self.current.clone()
    }

    fn sign_out(&mut self) -> Result<(), AuthError> {
        if self.current.take().is_some() {
            let mut accounts = lock(&self.accounts);
            accounts.isolated_signed_in = accounts.isolated_signed_in.saturating_sub(1);
        }
        Ok(())
    }
}

impl Drop for IsolatedSession {
    fn drop(&mut self) {
        let _ = self.sign_out();
    }
}
