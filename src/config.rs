//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::groups::{RegistryConfig, Role};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relay domain; the relay URL is `wss://<domain>`.
    pub domain: String,
    /// Directory holding event JSON files.
    pub store_root: PathBuf,
    /// Verify event signatures when loading the store.
    pub verify_sig: bool,
    /// Relay owner public key (hex), trusted with every action.
    pub relay_pubkey: Option<String>,
    /// Cap on history replayed per group.
    pub max_moderation_events: usize,
    /// Seconds a deleted event id stays refused.
    pub deleted_grace_secs: u64,
    /// Live moderation events older than this many seconds are refused.
    pub max_action_age_secs: u64,
    /// Roles every new group starts with.
    pub group_roles: Vec<String>,
    /// Role given to a group's creator.
    pub creator_role: String,
    /// Role given to members added without a known role.
    pub member_role: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let domain = env::var("DOMAIN").context("DOMAIN")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT")?);
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "1".into()) == "1";
        let relay_pubkey = env::var("RELAY_PUBKEY").ok().filter(|s| !s.is_empty());
        let max_moderation_events = number_var("MAX_MODERATION_EVENTS", 500)?;
        let deleted_grace_secs = number_var("DELETED_GRACE_SECS", 60)?;
        let max_action_age_secs = number_var("MAX_ACTION_AGE_SECS", 60)?;
        let group_roles = match env::var("GROUP_ROLES") {
            Ok(s) if !s.trim().is_empty() => csv_strings(s),
            _ => vec!["admin".into(), "moderator".into(), "member".into()],
        };
        let creator_role = env::var("CREATOR_ROLE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "admin".into());
        let member_role = match env::var("MEMBER_ROLE") {
            Ok(s) if s.is_empty() => None,
            Ok(s) => Some(s),
            Err(_) => Some("member".into()),
        };
        Ok(Self {
            domain,
            store_root,
            verify_sig,
            relay_pubkey,
            max_moderation_events,
            deleted_grace_secs,
            max_action_age_secs,
            group_roles,
            creator_role,
            member_role,
        })
    }

    pub fn relay_url(&self) -> String {
        format!("wss://{}", self.domain)
    }

    /// Registry configuration these settings describe.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            relay_url: self.relay_url(),
            roles: self.group_roles.iter().map(Role::new).collect(),
            creator_role: self.creator_role.clone(),
            member_role: self.member_role.clone(),
            max_moderation_events: self.max_moderation_events,
            deleted_grace: Duration::from_secs(self.deleted_grace_secs),
            max_action_age: Duration::from_secs(self.max_action_age_secs),
        }
    }
}

fn number_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be a number, got {s:?}")),
        _ => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
