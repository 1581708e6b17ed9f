//! Client configuration, loaded from RON.
//!
//! ```ron
//! (
//!     listener: (
//!         backoff_initial_ms: 250,
//!         backoff_max_ms: 5000,
//!         max_attempts: Some(20),
//!     ),
//!     template_title: "Blank template",
//! )
//! ```
//!
//! Every field is optional; missing ones take the values in [`crate::constants`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use cardtree_replica::DEFAULT_TEMPLATE_TITLE;

/// Change listener retry and buffering policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// 0.0..=1.0, clamped on use.
    pub jitter: f64,
    /// Give up (→ `Closed`) after this many consecutive failed attempts.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub event_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL.as_millis() as u64,
            backoff_max_ms: DEFAULT_BACKOFF_MAX.as_millis() as u64,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_BACKOFF_JITTER,
            max_attempts: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ListenerConfig {
    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exp);
        let ms = (self.backoff_initial_ms as f64 * factor).min(self.backoff_max_ms as f64);
        // `as` saturates, so an infinite product lands on u64::MAX
        Duration::from_millis(ms as u64)
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter.is_finite() || self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = self.jitter.min(1.0);
        let spread = rand::random::<f64>() * 2.0 - 1.0;
        let ms = base.as_millis() as f64 * (1.0 + jitter * spread);
        Duration::from_millis(ms as u64)
    }

    /// Reject values the backoff arithmetic cannot use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub listener: ListenerConfig,
    /// Title given to cards created by duplicate-as-template.
    pub template_title: String,
    /// Transaction descriptions kept by the mutator.
    pub history_limit: usize,
    pub error_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            template_title: DEFAULT_TEMPLATE_TITLE.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Parse and validate a RON config.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(text)?;
        config.listener.validate()?;
        Ok(config)
    }

    /// Read and parse a RON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_ron_str(&text)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ClientConfig::from_ron_str("()").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.template_title, "New Template");
    }

    #[test]
    fn test_partial_listener_override() {
        let config = ClientConfig::from_ron_str(
            "(listener: (backoff_initial_ms: 5, max_attempts: Some(3)), history_limit: 7)",
        )
        .unwrap();
        assert_eq!(config.listener.backoff_initial_ms, 5);
        assert_eq!(config.listener.max_attempts, Some(3));
        assert_eq!(config.listener.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.history_limit, 7);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"(template_title: "Blank")"#).unwrap();
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.template_title, "Blank");
    }

    #[test]
    fn test_bad_ron_is_reported() {
        assert!(matches!(
            ClientConfig::from_ron_str("(listener: 12)"),
            Err(ConfigError::Ron(_))
        ));
        assert!(matches!(
            ClientConfig::load("/nonexistent/cardtree.ron"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let listener = ListenerConfig {
            backoff_initial_ms: 100,
            backoff_max_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(listener.delay_for(1), Duration::from_millis(100));
        assert_eq!(listener.delay_for(2), Duration::from_millis(200));
        assert_eq!(listener.delay_for(4), Duration::from_millis(800));
        assert_eq!(listener.delay_for(5), Duration::from_millis(1000));
        assert_eq!(listener.delay_for(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        for text in [
            "(listener: (jitter: 2.0))",
            "(listener: (backoff_multiplier: 0.5))",
            "(listener: (backoff_initial_ms: 500, backoff_max_ms: 100))",
            "(listener: (max_attempts: Some(0)))",
        ] {
            assert!(
                matches!(ClientConfig::from_ron_str(text), Err(ConfigError::Invalid(_))),
                "{text} accepted"
            );
        }
    }

    #[test]
    fn test_non_finite_values_never_panic() {
        let listener = ListenerConfig {
            jitter: f64::NAN,
            backoff_multiplier: f64::INFINITY,
            backoff_max_ms: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(listener.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(listener.delay_for(1), Duration::from_millis(listener.backoff_initial_ms));
        assert_eq!(listener.delay_for(40), Duration::from_millis(u64::MAX));

        let huge = ListenerConfig {
            jitter: 1.0,
            backoff_initial_ms: u64::MAX,
            backoff_max_ms: u64::MAX,
            ..Default::default()
        };
        assert!(huge.delay_for(3) >= Duration::from_millis(u64::MAX / 2));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let listener = ListenerConfig { jitter: 0.5, ..Default::default() };
        for _ in 0..50 {
            let d = listener.delay_for(1).as_millis() as u64;
            assert!((50..=150).contains(&d), "delay {d} out of band");
        }
    }
}
