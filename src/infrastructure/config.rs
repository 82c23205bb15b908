use crate::infrastructure::error::InfraError;
use std::time::Duration;

const API_URL_KEYS: &[&str] = &["POMODORO_API_URL", "VITE_API_URL"];
const PUSH_URL_KEYS: &[&str] = &["POMODORO_WEBSOCKET_URL", "VITE_WEBSOCKET_URL"];
const REQUEST_TIMEOUT_KEYS: &[&str] = &["POMODORO_REQUEST_TIMEOUT_SECS"];
const HEARTBEAT_KEYS: &[&str] = &["POMODORO_HEARTBEAT_SECS"];
const FOCUS_MINUTES_KEYS: &[&str] = &["POMODORO_FOCUS_MINUTES"];

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;
pub const DEFAULT_FOCUS_MINUTES: u32 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub push_url: String,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub default_focus_minutes: u32,
}

impl SyncConfig {
    pub fn new(api_base_url: impl Into<String>, push_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            push_url: push_url.into(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            default_focus_minutes: DEFAULT_FOCUS_MINUTES,
        }
    }

    pub fn from_env() -> Result<Self, InfraError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, InfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = required_lookup_value(&lookup, API_URL_KEYS, "api base url")?;
        let push_url = required_lookup_value(&lookup, PUSH_URL_KEYS, "push channel url")?;

        let mut config = Self::new(api_base_url, push_url);
        if let Some(seconds) = positive_lookup_value(&lookup, REQUEST_TIMEOUT_KEYS)? {
            config.request_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = positive_lookup_value(&lookup, HEARTBEAT_KEYS)? {
            config.heartbeat_interval = Duration::from_secs(seconds);
        }
        if let Some(minutes) = positive_lookup_value(&lookup, FOCUS_MINUTES_KEYS)? {
            config.default_focus_minutes = u32::try_from(minutes)
                .map_err(|_| invalid_number(FOCUS_MINUTES_KEYS[0], &minutes.to_string()))?;
        }
        Ok(config)
    }
}

fn invalid_number(key: &str, raw: &str) -> InfraError {
    InfraError::InvalidConfig(format!("{key} must be a positive integer, got {raw:?}"))
}

fn required_lookup_value<F>(
    lookup: &F,
    keys: &[&str],
    field_name: &str,
) -> Result<String, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, keys).ok_or_else(|| {
        InfraError::InvalidConfig(format!(
            "missing {} (set one of: {})",
            field_name,
            keys.join(", ")
        ))
    })
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}

fn positive_lookup_value<F>(lookup: &F, keys: &[&str]) -> Result<Option<u64>, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = optional_lookup_value(lookup, keys) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(invalid_number(keys[0], &raw)),
    }
}
