//! Group-assignment policies.
//!
//! A policy maps a signed-in user to the group tags that unlock boards of
//! the same name. The explicit [`GrantTable`] is the default. The
//! [`EmailMarkerPolicy`] reproduces the older email-substring heuristic for
//! deployments that still depend on it; its first matching marker wins.
//!
//! Neither policy grants anything for the admin role; the resolver adds
//! `ALL` for admins on top of whatever the policy returns.

use std::collections::BTreeMap;

use crate::config::{GroupPolicyKind, GroupsConfig};
use crate::model::{GroupAssignments, GroupTag, Role, UserId};

/// What a policy may look at.
#[derive(Debug, Clone, Copy)]
pub struct PolicySubject<'a> {
    pub id: &'a UserId,
    pub email: &'a str,
    pub role: Option<Role>,
}

pub trait GroupPolicy: Send + Sync {
    fn groups_for(&self, subject: &PolicySubject<'_>) -> GroupAssignments;
}

/// Explicit `user → groups` grants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantTable {
    grants: BTreeMap<UserId, GroupAssignments>,
}

impl GrantTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant<I, T>(&mut self, user: UserId, groups: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<GroupTag>,
    {
        let entry = self.grants.entry(user).or_default();
        for group in groups {
            entry.insert(group.into());
        }
    }

    #[must_use]
    pub fn with_grant<I, T>(mut self, user: impl Into<UserId>, groups: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<GroupTag>,
    {
        self.grant(user.into(), groups);
        self
    }
}

impl GroupPolicy for GrantTable {
    fn groups_for(&self, subject: &PolicySubject<'_>) -> GroupAssignments {
        self.grants.get(subject.id).cloned().unwrap_or_default()
    }
}

/// Ordered case-insensitive email markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMarkerPolicy {
    markers: Vec<(String, GroupTag)>,
}

impl Default for EmailMarkerPolicy {
    fn default() -> Self {
        Self::new([
            ("admin", GroupTag::ALL),
            ("user1", "BU"),
            ("user2", "BU"),
            ("user3", "SMD"),
        ])
    }
}

impl EmailMarkerPolicy {
    pub fn new<'a>(markers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            markers: markers
                .into_iter()
                .map(|(marker, group)| (marker.to_ascii_lowercase(), GroupTag::new(group)))
                .collect(),
        }
    }
}

impl GroupPolicy for EmailMarkerPolicy {
    fn groups_for(&self, subject: &PolicySubject<'_>) -> GroupAssignments {
        let email = subject.email.to_ascii_lowercase();
        self.markers
            .iter()
            .find(|(marker, _)| !marker.is_empty() && email.contains(marker.as_str()))
            .map(|(_, group)| std::iter::once(group.clone()).collect())
            .unwrap_or_default()
    }
}

/// Build the configured policy.
#[must_use]
pub fn policy_from_config(config: &GroupsConfig) -> Box<dyn GroupPolicy> {
    match config.policy {
        GroupPolicyKind::Grants => {
            let mut table = GrantTable::new();
            for grant in &config.grants {
                table.grant(grant.user.clone(), grant.groups.iter().map(String::as_str));
            }
            Box::new(table)
        }
        GroupPolicyKind::EmailMarkers if config.markers.is_empty() => {
            Box::new(EmailMarkerPolicy::default())
        }
        GroupPolicyKind::EmailMarkers => Box::new(EmailMarkerPolicy::new(
            config
                .markers
                .iter()
                .map(|m| (m.marker.as_str(), m.group.as_str())),
        )),
    }
}
