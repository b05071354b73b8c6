use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

use super::ParseEnumError;
use super::ids::UserId;
use crate::store::{self, Collection, Fields, Record};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            _ => Err(ParseEnumError {
                expected: "role",
                got: s.to_string(),
            }),
        }
    }
}

/// Persisted user profile from the `users` collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub avatar: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcm_token: Option<String>,
    #[serde(
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// Fields for `users/<uid>`, including the redundant `uid` field other
    /// clients read.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized.
    pub fn to_profile_fields(&self) -> Result<Fields, serde_json::Error> {
        let mut fields = store::encode(self)?;
        fields.insert("uid".to_string(), Value::String(self.id.to_string()));
        Ok(fields)
    }
}

impl Record for UserRecord {
    const COLLECTION: Collection = Collection::Users;

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

/// Input for provisioning a new account and its profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcm_token: Option<String>,
}

/// Resolve a user's display name, tolerating dangling references.
#[must_use]
pub fn user_name_or_unknown<'a>(users: &'a [UserRecord], id: Option<&UserId>) -> &'a str {
    id.and_then(|id| users.iter().find(|user| &user.id == id))
        .map_or("Unknown", |user| {
            if user.name.is_empty() {
                user.email.as_str()
            } else {
                user.name.as_str()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_fields_carry_uid_but_not_id() {
        let record = UserRecord {
            id: UserId::new("u1"),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            role: Some(Role::User),
            ..UserRecord::default()
        };
        let fields = record.to_profile_fields().unwrap();
        assert_eq!(fields["uid"], "u1");
        assert_eq!(fields["role"], "user");
        assert!(!fields.contains_key("id"));
    }

    #[test]
    fn profile_without_role_decodes() {
        let record: UserRecord =
            serde_json::from_str(r#"{"id":"u1","email":"x@y.z","uid":"u1"}"#).unwrap();
        assert_eq!(record.role, None);
    }

    #[test]
    fn unknown_users_render_as_unknown() {
        let users = vec![UserRecord {
            id: UserId::new("u1"),
            email: "ada@example.com".into(),
            ..UserRecord::default()
        }];
        assert_eq!(user_name_or_unknown(&users, Some(&UserId::new("u1"))), "ada@example.com");
        assert_eq!(user_name_or_unknown(&users, Some(&UserId::new("u2"))), "Unknown");
        assert_eq!(user_name_or_unknown(&users, None), "Unknown");
    }
}
