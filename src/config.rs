//! Runtime configuration
//!
//! Configuration is plain data: it can be built in code, parsed from JSON or
//! overridden from `MERCURY_*` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Scheduler tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Floor applied to repeating timers whose delay is below it (ms)
    pub min_interval_ms: u64,
    /// Longest a driver blocks waiting for background completions in one wait (ms)
    pub max_idle_wait_ms: u64,
    /// Upper bound on ticks for `run_until_idle`
    pub max_ticks: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 4,
            max_idle_wait_ms: 50,
            max_ticks: 1_000_000,
        }
    }
}

/// Network tuning for the async bridge and the bundled HTTP transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Maximum redirects followed in `follow` mode
    pub max_redirects: u32,
    /// `User-Agent` sent by the HTTP transport
    pub user_agent: String,
    /// TCP connect timeout (ms)
    pub connect_timeout_ms: u64,
    /// Granularity at which reads poll the cancel context (ms)
    pub read_poll_ms: u64,
    /// Overall read deadline for one response (ms)
    pub read_timeout_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_redirects: 20,
            user_agent: format!("Mercury/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_ms: 10_000,
            read_poll_ms: 25,
            read_timeout_ms: 30_000,
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub net: NetConfig,
    /// URL of the main document, used as the base for relative fetches
    pub document_url: Option<String>,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RuntimeConfig =
            serde_json::from_str(json).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `MERCURY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = RuntimeConfig::default();
        if let Some(v) = lookup("MERCURY_MIN_INTERVAL_MS") {
            config.scheduler.min_interval_ms = parse_u64("MERCURY_MIN_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("MERCURY_MAX_TICKS") {
            config.scheduler.max_ticks = parse_u64("MERCURY_MAX_TICKS", &v)?;
        }
        if let Some(v) = lookup("MERCURY_MAX_REDIRECTS") {
            config.net.max_redirects = parse_u64("MERCURY_MAX_REDIRECTS", &v)?
                .try_into()
                .map_err(|_| Error::config("MERCURY_MAX_REDIRECTS out of range"))?;
        }
        if let Some(v) = lookup("MERCURY_USER_AGENT") {
            config.net.user_agent = v;
        }
        if let Some(v) = lookup("MERCURY_READ_TIMEOUT_MS") {
            config.net.read_timeout_ms = parse_u64("MERCURY_READ_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("MERCURY_DOCUMENT_URL") {
            config.document_url = Some(v);
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_ticks == 0 {
            return Err(Error::config("scheduler.max_ticks must be at least 1"));
        }
        if self.net.read_poll_ms == 0 {
            return Err(Error::config("net.read_poll_ms must be at least 1"));
        }
        if let Some(url) = &self.document_url {
            url::Url::parse(url)
                .map_err(|e| Error::config(format!("document_url '{}': {}", url, e)))?;
        }
        Ok(())
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} must be an unsigned integer, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.scheduler.min_interval_ms, 4);
        assert_eq!(config.net.max_redirects, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json_str(r#"{"net":{"max_redirects":3}}"#).unwrap();
        assert_eq!(config.net.max_redirects, 3);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_invalid_json() {
        let err = RuntimeConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::from_lookup(|key| match key {
            "MERCURY_MIN_INTERVAL_MS" => Some("10".to_string()),
            "MERCURY_USER_AGENT" => Some("test-agent".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.scheduler.min_interval_ms, 10);
        assert_eq!(config.net.user_agent, "test-agent");
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = RuntimeConfig::from_lookup(|key| {
            (key == "MERCURY_MAX_TICKS").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("MERCURY_MAX_TICKS"));
    }

    #[test]
    fn test_bad_document_url() {
        let config = RuntimeConfig {
            document_url: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
