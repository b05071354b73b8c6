//! Account lifecycle: sign-in, registration and admin-provisioned users.
//!
//! Admin-created accounts are signed up through an isolated identity
//! session so the admin's own session is never switched to the new user.
//! The isolated session is signed out on every path, success or failure.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::identity::{AuthIdentity, IdentityProvider, IdentitySession};
use crate::model::{NewUser, Principal, Role, UserRecord};
use crate::notice::{Notice, Notifier};
use crate::store::{Collection, DocumentStore};
use crate::visibility::can_manage_users;

pub struct AccountService {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
}

impl AccountService {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            identity,
            store,
            notifier,
        }
    }

    /// Sign the primary session in. The session picks the change up from
    /// the provider's auth-state stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] on bad credentials.
    pub fn sign_in(&self, email: &str, password: &str) -> Result<AuthIdentity> {
        self.identity.sign_in(email, password).map_err(|err| {
            warn!(error = %err, "sign-in failed");
            let err = Error::from(err);
            self.notifier
                .notify(Notice::error(err.code(), format!("Failed to sign in: {err}")));
            err
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the provider cannot end the session.
    pub fn sign_out(&self) -> Result<()> {
        self.identity.sign_out()?;
        info!("signed out");
        Ok(())
    }

    /// Self-service registration: create the account on the primary
    /// session and write its profile with role `user`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the account cannot be created, or the
    /// store error when the profile write fails.
    pub fn register(&self, email: &str, password: &str, name: &str) -> Result<AuthIdentity> {
        let result = self.try_register(email, password, name);
        match &result {
            Ok(identity) => info!(uid = %identity.uid, "registered"),
            Err(err) => {
                warn!(error = %err, "registration failed");
                self.notifier
                    .notify(Notice::error(err.code(), format!("Failed to register: {err}")));
            }
        }
        result
    }

    fn try_register(&self, email: &str, password: &str, name: &str) -> Result<AuthIdentity> {
        let identity = self.identity.sign_up(email, password)?;
        self.write_profile(&identity, name, Role::User)?;
        Ok(identity)
    }

    /// Provision an account on behalf of `admin`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] for non-admins, [`Error::Auth`] when
    /// the account cannot be created, or the store error when the profile
    /// write fails.
    pub fn create_user(&self, admin: &Principal, user: NewUser) -> Result<AuthIdentity> {
        let result = self.try_create_user(admin, &user);
        match &result {
            Ok(identity) => {
                info!(uid = %identity.uid, by = %admin.id, "user created");
                self.notifier.notify(Notice::success("User created successfully!"));
            }
            Err(err) => {
                warn!(error = %err, by = %admin.id, "user creation failed");
                self.notifier.notify(Notice::error(
                    err.code(),
                    format!("Failed to create user: {err}"),
                ));
            }
        }
        result
    }

    fn try_create_user(&self, admin: &Principal, user: &NewUser) -> Result<AuthIdentity> {
        if !can_manage_users(admin) {
            return Err(Error::Forbidden("only admins may create users".into()));
        }
        let mut session = self.identity.isolated_session()?;
        let result = self.provision(session.as_mut(), user);
        if let Err(err) = session.sign_out() {
            warn!(error = %err, "could not sign out the provisioning session");
        }
        result
    }

    fn provision(&self, session: &mut dyn IdentitySession, user: &NewUser) -> Result<AuthIdentity> {
        let identity = session.sign_up(&user.email, &user.password)?;
        self.write_profile(&identity, &user.name, user.role)?;
        Ok(identity)
    }

    fn write_profile(&self, identity: &AuthIdentity, name: &str, role: Role) -> Result<()> {
        let record = UserRecord {
            id: identity.uid.clone(),
            name: name.trim().to_string(),
            email: identity.email.clone(),
            role: Some(role),
            avatar: String::new(),
            fcm_token: None,
            created_at: Some(self.store.now()),
        };
        let fields = record
            .to_profile_fields()
            .map_err(|err| Error::codec("profile", err))?;
        self.store
            .set(Collection::Users, identity.uid.as_str(), fields, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::identity::{AuthError, MemoryIdentityProvider};
    use crate::model::{GroupAssignments, UserId};
    use crate::notice::RecordingNotifier;
    use crate::store::{MemoryStore, StoreError};

    struct Fixture {
        identity: Arc<MemoryIdentityProvider>,
        store: Arc<MemoryStore>,
        notices: Arc<RecordingNotifier>,
        service: AccountService,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(MemoryIdentityProvider::new());
        let store = Arc::new(MemoryStore::new());
        let notices = Arc::new(RecordingNotifier::new());
        let service = AccountService::new(
            Arc::clone(&identity) as Arc<dyn IdentityProvider>,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&notices) as Arc<dyn Notifier>,
        );
        Fixture {
            identity,
            store,
            notices,
            service,
        }
    }

    fn admin(id: &UserId) -> Principal {
        Principal {
            id: id.clone(),
            email: "root@x.com".into(),
            name: None,
            role: Some(Role::Admin),
            group_assignments: GroupAssignments::new(),
        }
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.into(),
            password: "secret99".into(),
            name: "Grace".into(),
            role: Role::User,
        }
    }

    #[test]
    fn register_writes_user_profile() {
        let f = fixture();
        let identity = f.service.register("ada@x.com", "secret99", " Ada ").unwrap();
        let profile: UserRecord = f
            .store
            .get(Collection::Users, identity.uid.as_str())
            .unwrap()
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(profile.role, Some(Role::User));
        assert_eq!(profile.name, "Ada");
        assert_eq!(f.identity.current().map(|i| i.uid), Some(identity.uid));
    }

    #[test]
    fn admin_created_user_leaves_primary_session_alone() {
        let f = fixture();
        let me = f.service.register("root@x.com", "secret99", "Root").unwrap();
        let changes = f.identity.primary_changes();

        let created = f.service.create_user(&admin(&me.uid), new_user("grace@x.com")).unwrap();
        assert_ne!(created.uid, me.uid);
        assert_eq!(f.identity.current().map(|i| i.uid), Some(me.uid));
        assert_eq!(f.identity.primary_changes(), changes);
        assert_eq!(f.identity.isolated_sessions_signed_in(), 0);
        assert!(f.store.get(Collection::Users, created.uid.as_str()).unwrap().is_some());
        assert_eq!(f.notices.last().unwrap().message, "User created successfully!");
    }

    #[test]
    fn isolated_session_is_signed_out_when_profile_write_fails() {
        let f = fixture();
        let me = f.service.register("root@x.com", "secret99", "Root").unwrap();
        f.store
            .inject_write_failure(Some(StoreError::Denied("read-only".into())));
        let err = f
            .service
            .create_user(&admin(&me.uid), new_user("grace@x.com"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::WriteRejected);
        assert_eq!(f.identity.isolated_sessions_signed_in(), 0);
        assert_eq!(f.identity.current().map(|i| i.uid), Some(me.uid));
        assert!(f.notices.last().unwrap().message.starts_with("Failed to create user: "));
    }

    #[test]
    fn non_admins_cannot_create_users() {
        let f = fixture();
        let mut user = admin(&UserId::new("u1"));
        user.role = Some(Role::User);
        let err = f.service.create_user(&user, new_user("grace@x.com")).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert!(f.identity.uid_for("grace@x.com").is_none());
    }

    #[test]
    fn auth_failures_surface_as_auth_errors() {
        let f = fixture();
        let err = f.service.sign_in("nobody@x.com", "whatever").unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidCredentials)));
        assert_eq!(f.notices.last().unwrap().code, Some(ErrorCode::AuthFailed));
    }
}
