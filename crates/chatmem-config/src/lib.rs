use chatmem_core::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub redis: RedisSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_max_messages")]
    pub max_messages_per_conversation: usize,
    #[serde(default = "default_ttl_secs")]
    pub conversation_ttl_secs: u64,
    #[serde(default = "default_context_window")]
    pub context_window_size: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl StoreConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StoreError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: StoreConfig = serde_yaml::from_str(yaml)
            .map_err(|e| StoreError::Config(format!("Failed to parse YAML: {}", e)))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn expand_env_vars(&mut self) {
        if let Ok(url) = env::var("CHATMEM_REDIS_URL") {
            self.redis.url = url;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.store.max_messages_per_conversation == 0 {
            return Err(StoreError::Config(
                "max_messages_per_conversation must be at least 1".into(),
            ));
        }
        if self.store.conversation_ttl_secs == 0 {
            return Err(StoreError::Config(
                "conversation_ttl_secs must be at least 1".into(),
            ));
        }
        if self.store.context_window_size == 0 {
            return Err(StoreError::Config(
                "context_window_size must be at least 1".into(),
            ));
        }
        if self.redis.url.is_empty() {
            return Err(StoreError::Config("Redis URL cannot be empty".into()));
        }
        Ok(())
    }

    pub fn conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.store.conversation_ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.redis.op_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.redis.retry_backoff_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.store.sweep_interval_secs)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_messages_per_conversation: default_max_messages(),
            conversation_ttl_secs: default_ttl_secs(),
            context_window_size: default_context_window(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            op_timeout_ms: default_op_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_max_messages() -> usize { 100 }
fn default_ttl_secs() -> u64 { 86_400 }
fn default_context_window() -> usize { 20 }
fn default_sweep_interval_secs() -> u64 { 60 }
fn default_redis_url() -> String { "redis://127.0.0.1:6379/0".to_string() }
fn default_key_prefix() -> String { "chatmem:conversation:".to_string() }
fn default_op_timeout_ms() -> u64 { 2_000 }
fn default_retry_backoff_ms() -> u64 { 100 }
