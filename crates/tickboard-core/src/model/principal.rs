use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::ids::UserId;
use super::user::Role;

/// A group tag granting visibility into boards with the same name.
///
/// Matching is exact and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupTag(String);

impl GroupTag {
    /// Wildcard tag: every board is visible.
    pub const ALL: &'static str = "ALL";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn all() -> Self {
        Self(Self::ALL.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_all(&self) -> bool {
        self.0 == Self::ALL
    }
}

impl fmt::Display for GroupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Ordered set of group tags held by a principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupAssignments(BTreeSet<GroupTag>);

impl GroupAssignments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: GroupTag) -> bool {
        self.0.insert(tag)
    }

    pub fn extend(&mut self, other: &Self) {
        self.0.extend(other.0.iter().cloned());
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|held| held.as_str() == tag)
    }

    #[must_use]
    pub fn contains_all(&self) -> bool {
        self.contains(GroupTag::ALL)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupTag> {
        self.0.iter()
    }
}

impl FromIterator<GroupTag> for GroupAssignments {
    fn from_iter<I: IntoIterator<Item = GroupTag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for GroupAssignments {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(GroupTag::new).collect())
    }
}

/// The signed-in actor: auth identity merged with its profile.
///
/// Built on sign-in, rebuilt on every profile push, dropped on sign-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: UserId,
    pub email: String,
    pub name: Option<String>,
    /// `None` until a profile record exists.
    pub role: Option<Role>,
    pub group_assignments: GroupAssignments,
}

impl Principal {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Some(Role::Admin)
    }

    /// Admins and holders of the `ALL` group see every document.
    #[must_use]
    pub fn sees_everything(&self) -> bool {
        self.is_admin() || self.group_assignments.contains_all()
    }

    /// Name used for authorship (comments, chat).
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ if !self.email.is_empty() => &self.email,
            _ => "Anonymous",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: Option<Role>, groups: &[&str]) -> Principal {
        Principal {
            id: UserId::new("u1"),
            email: "user1@x.com".into(),
            name: None,
            role,
            group_assignments: groups.iter().copied().collect(),
        }
    }

    #[test]
    fn all_group_sees_everything_without_admin_role() {
        let p = principal(Some(Role::User), &["ALL"]);
        assert!(p.sees_everything());
        assert!(!p.is_admin());
    }

    #[test]
    fn group_matching_is_case_sensitive() {
        let p = principal(None, &["BU"]);
        assert!(p.group_assignments.contains("BU"));
        assert!(!p.group_assignments.contains("bu"));
    }

    #[test]
    fn display_name_falls_back_to_email() {
        let mut p = principal(None, &[]);
        assert_eq!(p.display_name(), "user1@x.com");
        p.name = Some("Ada".into());
        assert_eq!(p.display_name(), "Ada");
        p.name = None;
        p.email.clear();
        assert_eq!(p.display_name(), "Anonymous");
    }
}
