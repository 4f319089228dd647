// =============================================================================
// Feed Configuration — endpoints and tuning knobs with serde defaults
// =============================================================================
//
// Every field carries `#[serde(default)]` so that loading an older config
// file never breaks when new fields are added. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_ws_url() -> String {
    "wss://stream.binance.com:9443/stream".to_string()
}

fn default_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_depth_limit() -> usize {
    20
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_coalesce_window_ms() -> u64 {
    50
}

fn default_request_timeout_secs() -> u64 {
    10
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Configuration for a [`crate::FeedClient`](crate::client::FeedClient)
/// instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Combined-stream WebSocket endpoint.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// REST base URL for candle and depth snapshot fetches.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Levels retained per order-book side (top-N cap).
    #[serde(default = "default_depth_limit")]
    pub depth_limit: usize,

    /// Reconnection attempts before giving up with a terminal status.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base reconnect delay; the wait before attempt `n` is `base * n`.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// How long classified updates are batched before a flush.
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,

    /// Per-request timeout for REST fetches.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            depth_limit: default_depth_limit(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            coalesce_window_ms: default_coalesce_window_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(path = %path.display(), ws_url = %config.ws_url, "feed config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise feed config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.ws_url, "wss://stream.binance.com:9443/stream");
        assert_eq!(cfg.rest_url, "https://api.binance.com");
        assert_eq!(cfg.depth_limit, 20);
        assert_eq!(cfg.max_reconnect_attempts, 3);
        assert_eq!(cfg.reconnect_base_delay_ms, 1000);
        assert_eq!(cfg.coalesce_window_ms, 50);
        assert_eq!(cfg.request_timeout_secs, 10);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: FeedConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.depth_limit, 20);
        assert_eq!(cfg.max_reconnect_attempts, 3);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "ws_url": "ws://127.0.0.1:9000", "coalesce_window_ms": 10 }"#;
        let cfg: FeedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.ws_url, "ws://127.0.0.1:9000");
        assert_eq!(cfg.coalesce_window_ms, 10);
        assert_eq!(cfg.rest_url, "https://api.binance.com");
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = FeedConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: FeedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.ws_url, cfg2.ws_url);
        assert_eq!(cfg.depth_limit, cfg2.depth_limit);
        assert_eq!(cfg.reconnect_base_delay_ms, cfg2.reconnect_base_delay_ms);
    }
}
