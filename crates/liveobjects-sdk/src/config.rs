//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a `LiveObjects` engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectsConfig {
    /// How often the background GC task runs (in milliseconds).
    pub gc_interval_ms: u64,
    /// How long tombstoned objects and map entries are retained (in milliseconds).
    pub gc_grace_period_ms: u64,
    /// Buffer live operations that arrive while a sync is in progress.
    pub buffer_operations_during_sync: bool,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_channel_capacity: usize,
    /// Client id stamped on outbound messages.
    #[serde(default)]
    pub client_id: Option<String>,
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: 5 * 60 * 1000,
            gc_grace_period_ms: 24 * 60 * 60 * 1000,
            buffer_operations_during_sync: true,
            event_channel_capacity: 100,
            client_id: None,
        }
    }
}

impl ObjectsConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn gc_grace_period(&self) -> Duration {
        Duration::from_millis(self.gc_grace_period_ms)
    }
}

/// Builder for engine configuration.
pub struct ObjectsConfigBuilder {
    config: ObjectsConfig,
}

impl ObjectsConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ObjectsConfig::default(),
        }
    }

    pub fn gc_interval(mut self, ms: u64) -> Self {
        self.config.gc_interval_ms = ms;
        self
    }

    pub fn gc_grace_period(mut self, ms: u64) -> Self {
        self.config.gc_grace_period_ms = ms;
        self
    }

    pub fn buffer_operations_during_sync(mut self, enabled: bool) -> Self {
        self.config.buffer_operations_during_sync = enabled;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    pub fn build(self) -> ObjectsConfig {
        self.config
    }
}

impl Default for ObjectsConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ObjectsConfigBuilder::new()
            .gc_interval(1000)
            .gc_grace_period(5000)
            .buffer_operations_during_sync(false)
            .event_channel_capacity(8)
            .client_id("alice")
            .build();

        assert_eq!(config.gc_interval(), Duration::from_secs(1));
        assert_eq!(config.gc_grace_period_ms, 5000);
        assert!(!config.buffer_operations_during_sync);
        assert_eq!(config.event_channel_capacity, 8);
        assert_eq!(config.client_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_config_deserializes_without_client_id() {
        let json = r#"{
            "gc_interval_ms": 10,
            "gc_grace_period_ms": 20,
            "buffer_operations_during_sync": true,
            "event_channel_capacity": 4
        }"#;
        let config: ObjectsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.gc_grace_period(), Duration::from_millis(20));
        assert!(config.client_id.is_none());
    }
}
