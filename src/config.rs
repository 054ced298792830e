//! Host configuration loaded from an optional JSON file.
//!
//! Every field has a default, so an empty object (or no file at all) is a
//! valid configuration. Command-line flags are applied on top by the binary.

use crate::buffer::{BufferConfig, BufferConfigPatch};
use crate::registry::{
    PluginConfigPatch, PluginRegistry, DEFAULT_ACTIVATION_TIMEOUT, DEFAULT_DEACTIVATION_TIMEOUT,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Buffer settings merged over the built-in defaults
    pub buffer: BufferConfigPatch,
    /// Per-plugin overrides keyed by plugin id
    pub plugins: BTreeMap<String, PluginConfigPatch>,
    pub activation_timeout_ms: u64,
    pub deactivation_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfigPatch::default(),
            plugins: BTreeMap::new(),
            activation_timeout_ms: DEFAULT_ACTIVATION_TIMEOUT.as_millis() as u64,
            deactivation_timeout_ms: DEFAULT_DEACTIVATION_TIMEOUT.as_millis() as u64,
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        if config.buffer.flush_interval_ms == Some(0) {
            anyhow::bail!("buffer.flush_interval_ms must be at least 1");
        }
        Ok(config)
    }

    /// Buffer defaults with the configured overrides applied
    pub fn buffer_defaults(&self) -> BufferConfig {
        let mut config = BufferConfig::default();
        config.merge(&self.buffer);
        config
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }

    pub fn deactivation_timeout(&self) -> Duration {
        Duration::from_millis(self.deactivation_timeout_ms)
    }

    pub fn build_registry(&self) -> PluginRegistry {
        PluginRegistry::new(self.activation_timeout(), self.deactivation_timeout())
    }

    /// Apply plugin overrides to registered plugins. Unknown ids are logged.
    pub fn apply_plugin_configs(&self, registry: &PluginRegistry) -> Result<()> {
        for (id, patch) in &self.plugins {
            if registry.state(id).is_err() {
                warn!("Config references unknown plugin {}", id);
                continue;
            }
            registry
                .configure(id, *patch)
                .with_context(|| format!("Failed to configure plugin {}", id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::builtin_detectors;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HostConfig::parse("{}").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.buffer_defaults(), BufferConfig::default());
        assert_eq!(config.activation_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_partial_overrides() {
        let config = HostConfig::parse(
            r#"{
                "buffer": {"flush_interval_ms": 32, "adaptive_buffering": false},
                "plugins": {"claude": {"confidence_threshold": 0.5}},
                "activation_timeout_ms": 250
            }"#,
        )
        .unwrap();

        let buffer = config.buffer_defaults();
        assert_eq!(buffer.flush_interval_ms, 32);
        assert!(!buffer.adaptive_buffering);
        assert_eq!(buffer.max_buffer_size, BufferConfig::default().max_buffer_size);
        assert_eq!(config.plugins["claude"].confidence_threshold, Some(0.5));
        assert_eq!(config.activation_timeout(), Duration::from_millis(250));
        assert_eq!(config.deactivation_timeout(), DEFAULT_DEACTIVATION_TIMEOUT);
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(HostConfig::parse(r#"{"buffer": {"flush_interval_ms": 0}}"#).is_err());
        assert!(HostConfig::parse("not json").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"buffer": {{"max_buffer_size": 1024}}}}"#).unwrap();

        let config = HostConfig::load(file.path()).unwrap();
        assert_eq!(config.buffer_defaults().max_buffer_size, 1024);

        let missing = HostConfig::load(Path::new("/nonexistent/term-stream.json"));
        assert!(missing.is_err());
    }

    #[test]
    fn test_apply_plugin_configs() {
        let config = HostConfig::parse(
            r#"{"plugins": {"codex": {"enabled": false}, "unknown": {"enabled": false}}}"#,
        )
        .unwrap();
        let registry = config.build_registry();
        for detector in builtin_detectors().unwrap() {
            registry.register(Arc::new(detector)).unwrap();
        }

        config.apply_plugin_configs(&registry).unwrap();
        assert!(!registry.config("codex").unwrap().enabled);
        assert!(registry.config("claude").unwrap().enabled);
    }
}
