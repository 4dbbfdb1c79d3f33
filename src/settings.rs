//! Process configuration, read from the environment at startup.

use std::{collections::BTreeMap, time::Duration};

use tracing::warn;

use crate::apply::RetryPolicy;

pub const DEFAULT_AGENT_IMAGE: &str = "agent-deployer/agent:latest";
pub const DEFAULT_AUTH_IMAGE: &str = "agent-deployer/kube-api-auth:latest";
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "agent-deployer-system";
pub const DEFAULT_SETTINGS_CONFIGMAP: &str = "agent-deployer-settings";

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Externally reachable URL agents dial back to, used when the settings ConfigMap has none.
    /// Deployment waits until one of them is set.
    pub server_url: Option<String>,
    /// ConfigMap in the system namespace whose `server-url` key is re-read on every pass
    pub settings_configmap: String,
    pub agent_image: String,
    pub auth_image: String,
    /// Feature flags handed to every agent
    pub agent_features: BTreeMap<String, bool>,
    /// Namespace holding kubeconfig secrets, system accounts and events
    pub system_namespace: String,
    pub apply_retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: None,
            settings_configmap: DEFAULT_SETTINGS_CONFIGMAP.to_string(),
            agent_image: DEFAULT_AGENT_IMAGE.to_string(),
            auth_image: DEFAULT_AUTH_IMAGE.to_string(),
            agent_features: BTreeMap::new(),
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            apply_retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Unset or blank variables keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let max_attempts = get("APPLY_MAX_ATTEMPTS")
            .and_then(|v| parse_or_warn::<u32>("APPLY_MAX_ATTEMPTS", &v))
            .unwrap_or(defaults.apply_retry.max_attempts);
        let delay = get("APPLY_RETRY_DELAY_SECS")
            .and_then(|v| parse_or_warn::<u64>("APPLY_RETRY_DELAY_SECS", &v))
            .map(Duration::from_secs)
            .unwrap_or(defaults.apply_retry.delay);

        Self {
            server_url: get("SERVER_URL"),
            settings_configmap: get("SETTINGS_CONFIGMAP").unwrap_or(defaults.settings_configmap),
            agent_image: get("AGENT_IMAGE").unwrap_or(defaults.agent_image),
            auth_image: get("AUTH_IMAGE").unwrap_or(defaults.auth_image),
            agent_features: get("AGENT_FEATURES")
                .map(|v| parse_features(&v))
                .unwrap_or_default(),
            system_namespace: get("SYSTEM_NAMESPACE").unwrap_or(defaults.system_namespace),
            apply_retry: RetryPolicy {
                max_attempts,
                delay,
            },
        }
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid value '{}' for {}", value, key);
            None
        }
    }
}

/// Parse `name=bool` pairs separated by commas. A bare name means `true`.
pub fn parse_features(raw: &str) -> BTreeMap<String, bool> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let (name, value) = match entry.split_once('=') {
                Some((name, value)) => (name.trim(), value.trim()),
                None => (entry, "true"),
            };
            match value.parse::<bool>() {
                Ok(enabled) if !name.is_empty() => Some((name.to_string(), enabled)),
                _ => {
                    warn!("Ignoring malformed agent feature '{}'", entry);
                    None
                }
            }
        })
        .collect()
}
