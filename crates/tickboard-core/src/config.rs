use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ErrorCode;
use crate::model::UserId;

/// Environment variable overriding `[auth] super_admin_email`.
pub const SUPER_ADMIN_ENV: &str = "TICKBOARD_SUPER_ADMIN";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// The reserved address whose profile is forced back to `admin`.
    /// Unset disables the repair.
    #[serde(default)]
    pub super_admin_email: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupPolicyKind {
    #[default]
    Grants,
    EmailMarkers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantConfig {
    pub user: UserId,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerConfig {
    pub marker: String,
    pub group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupsConfig {
    #[serde(default)]
    pub policy: GroupPolicyKind,
    #[serde(default)]
    pub grants: Vec<GrantConfig>,
    /// Only read by the `email-markers` policy. Empty means the built-in
    /// marker list.
    #[serde(default)]
    pub markers: Vec<MarkerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_typing_idle_ms")]
    pub typing_idle_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_idle_ms: default_typing_idle_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
        }
    }
}

const fn default_page_size() -> usize {
    10
}

const fn default_max_page_size() -> usize {
    100
}

const fn default_typing_idle_ms() -> u64 {
    2_000
}

fn default_key_prefix() -> String {
    "attachments".to_string()
}

impl TrackerConfig {
    /// Reject configurations the services cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        let pagination = &self.pagination;
        if pagination.default_page_size == 0 {
            bail!("pagination.default_page_size must be positive");
        }
        if pagination.max_page_size < pagination.default_page_size {
            bail!(
                "pagination.max_page_size ({}) is below default_page_size ({})",
                pagination.max_page_size,
                pagination.default_page_size
            );
        }
        if self.uploads.key_prefix.trim_matches('/').is_empty() {
            bail!("uploads.key_prefix must not be empty");
        }
        if let Some(grant) = self.groups.grants.iter().find(|g| g.user.is_empty()) {
            bail!("groups.grants entry with groups {:?} has an empty user", grant.groups);
        }
        Ok(())
    }

    /// Apply environment overrides through `lookup` (usually
    /// `|key| std::env::var(key).ok()`).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(email) = lookup(SUPER_ADMIN_ENV) {
            let email = email.trim();
            self.auth.super_admin_email = (!email.is_empty()).then(|| email.to_string());
        }
    }
}

/// Parse a config document.
///
/// # Errors
///
/// Returns an error on malformed TOML or invalid settings. Malformed TOML
/// carries [`ErrorCode::ConfigParseError`] as context, reachable with
/// `downcast_ref::<ErrorCode>()`.
pub fn parse_config(content: &str) -> Result<TrackerConfig> {
    let config: TrackerConfig = toml::from_str(content).context(ErrorCode::ConfigParseError)?;
    config.validate()?;
    Ok(config)
}

/// Load a config file, falling back to defaults when it does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<TrackerConfig> {
    if !path.exists() {
        return Ok(TrackerConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// `<config_dir>/tickboard/config.toml`, when the platform has one.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tickboard/config.toml"))
}

/// Load the per-user config file.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<TrackerConfig> {
    let Some(path) = user_config_path() else {
        return Ok(TrackerConfig::default());
    };
    load_config(&path)
}

/// Explicit path if given, else the per-user file, then env overrides.
///
/// # Errors
///
/// Returns an error if the chosen file cannot be read or parsed.
pub fn resolve_config(explicit: Option<&Path>) -> Result<TrackerConfig> {
    let mut config = match explicit {
        Some(path) => load_config(path)?,
        None => load_user_config()?,
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}
