//! Pipeline configuration.
//!
//! Every external call the context pipeline makes is bounded by one of these
//! deadlines. The defaults suit most APIs; applications that embed kindle's
//! settings in their own config file can deserialize [`PipelineConfig`]
//! directly (all values in milliseconds, every field optional):
//!
//! ```json
//! { "timeouts": { "context_creation_ms": 2000, "plugin_batch_ms": 1500 } }
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Top-level settings for [`ContextBuilder`](crate::ContextBuilder).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub timeouts: Timeouts,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Per-operation deadlines, stored in milliseconds.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// User context factory.
    pub context_creation_ms: u64,
    /// Request body parsing.
    pub body_parsing_ms: u64,
    /// One whole batch of plugin enhancement.
    pub plugin_batch_ms: u64,
    /// One plugin's proxy setup, jobs proxy creation, or proxied emit.
    pub plugin_proxy_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            context_creation_ms: 5_000,
            body_parsing_ms: 10_000,
            plugin_batch_ms: 3_000,
            plugin_proxy_ms: 1_000,
        }
    }
}

impl Timeouts {
    pub fn context_creation(&self) -> Duration { Duration::from_millis(self.context_creation_ms) }
    pub fn body_parsing(&self) -> Duration { Duration::from_millis(self.body_parsing_ms) }
    pub fn plugin_batch(&self) -> Duration { Duration::from_millis(self.plugin_batch_ms) }
    pub fn plugin_proxy(&self) -> Duration { Duration::from_millis(self.plugin_proxy_ms) }

    pub fn with_context_creation(mut self, d: Duration) -> Self {
        self.context_creation_ms = millis(d);
        self
    }

    pub fn with_body_parsing(mut self, d: Duration) -> Self {
        self.body_parsing_ms = millis(d);
        self
    }

    pub fn with_plugin_batch(mut self, d: Duration) -> Self {
        self.plugin_batch_ms = millis(d);
        self
    }

    pub fn with_plugin_proxy(mut self, d: Duration) -> Self {
        self.plugin_proxy_ms = millis(d);
        self
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_deadlines() {
        let t = Timeouts::default();
        assert_eq!(t.context_creation(), Duration::from_secs(5));
        assert_eq!(t.body_parsing(), Duration::from_secs(10));
        assert_eq!(t.plugin_batch(), Duration::from_secs(3));
        assert_eq!(t.plugin_proxy(), Duration::from_secs(1));
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"timeouts":{"plugin_batch_ms":250}}"#).unwrap();
        assert_eq!(cfg.timeouts.plugin_batch(), Duration::from_millis(250));
        assert_eq!(cfg.timeouts.context_creation_ms, 5_000);
        assert_eq!(cfg.timeouts.plugin_proxy_ms, 1_000);
    }

    #[test]
    fn empty_object_is_default() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn setters_round_to_millis() {
        let t = Timeouts::default().with_plugin_proxy(Duration::from_micros(2_500));
        assert_eq!(t.plugin_proxy_ms, 2);
    }
}
