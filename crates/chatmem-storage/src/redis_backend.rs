use async_trait::async_trait;
use chatmem_core::{BackendHealth, BackendKind, Conversation, Result, StoreError};
use chatmem_config::RedisSettings;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ConversationBackend;

/// Durable backend: one Redis entry per conversation key, value is the full
/// serialized conversation, expiry handled natively via `SET ... EX`.
pub struct RedisBackend {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisBackend {
    /// Open a connection and verify liveness with a `PING`. Fails fast so
    /// the store can fall back to the in-memory variant at startup.
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let client = Client::open(settings.url.as_str()).map_err(map_redis_err)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(map_redis_err)?;

        let backend = Self {
            manager,
            key_prefix: settings.key_prefix.clone(),
        };

        let mut conn = backend.manager.clone();
        let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.map_err(map_redis_err)?;

        info!("Connected to Redis at {}", settings.url);
        Ok(backend)
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl ConversationBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn get(&self, key: &str) -> Result<Option<Conversation>> {
        let storage_key = self.storage_key(key);
        let mut conn = self.manager.clone();

        let raw: Option<String> = conn.get(&storage_key).await.map_err(map_redis_err)?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match decode_conversation(key, &raw) {
            Some(conversation) => Ok(Some(conversation)),
            None => {
                // Undeserializable data is treated as absence; drop the bad
                // entry so it cannot keep tripping every read.
                let _: RedisResult<i64> = conn.del(&storage_key).await;
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, conversation: &Conversation, ttl: Duration) -> Result<()> {
        let storage_key = self.storage_key(key);
        let payload = serde_json::to_string(conversation)?;
        let ttl_secs = ttl.as_secs().max(1);

        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(&storage_key, payload, ttl_secs)
            .await
            .map_err(map_redis_err)?;

        debug!("Stored conversation {} (ttl {}s)", key, ttl_secs);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let storage_key = self.storage_key(key);
        let mut conn = self.manager.clone();

        let removed: i64 = conn.del(&storage_key).await.map_err(map_redis_err)?;
        Ok(removed > 0)
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        // Cursor-based SCAN so the enumeration never blocks the server the
        // way KEYS would; still a full keyspace walk, administrative only.
        let pattern = format!("{}*", self.key_prefix);
        let mut conn = self.manager.clone();

        let mut storage_keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;

            storage_keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(filter_logical_keys(&self.key_prefix, storage_keys, prefix))
    }

    async fn health(&self) -> BackendHealth {
        let mut conn = self.manager.clone();
        let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => BackendHealth::Ok,
            Err(e) if e.is_timeout() => BackendHealth::Degraded,
            Err(_) => BackendHealth::Unavailable,
        }
    }
}

fn map_redis_err(e: redis::RedisError) -> StoreError {
    if e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
    {
        StoreError::Transient(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

/// Strip the storage prefix off scanned keys and apply the caller's
/// logical-prefix filter.
fn filter_logical_keys(
    key_prefix: &str,
    storage_keys: Vec<String>,
    prefix: Option<&str>,
) -> Vec<String> {
    storage_keys
        .into_iter()
        .map(|key| key.strip_prefix(key_prefix).unwrap_or(&key).to_string())
        .filter(|key| prefix.map_or(true, |p| key.starts_with(p)))
        .collect()
}

/// Decode a stored conversation, treating corrupt payloads as absence.
fn decode_conversation(key: &str, raw: &str) -> Option<Conversation> {
    match serde_json::from_str(raw) {
        Ok(conversation) => Some(conversation),
        Err(e) => {
            warn!("Discarding undeserializable conversation for key {}: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmem_core::Role;

    #[test]
    fn decode_round_trips_valid_payloads() {
        let mut conv = Conversation::new("u1", "c1", "openai", "gpt-4o");
        conv.push_message(Role::User, "hi", Default::default());
        let raw = serde_json::to_string(&conv).unwrap();

        let decoded = decode_conversation(&conv.id, &raw).unwrap();
        assert_eq!(decoded.id, conv.id);
        assert_eq!(decoded.messages.len(), 1);
    }

    #[test]
    fn decode_treats_corrupt_payloads_as_absent() {
        assert!(decode_conversation("u1:c1", "not json at all").is_none());
        assert!(decode_conversation("u1:c1", "{\"id\": 42}").is_none());
    }

    #[test]
    fn scanned_keys_reduce_to_logical_keys() {
        let scanned = vec![
            "chatmem:conversation:u1:c1".to_string(),
            "chatmem:conversation:u2:c2".to_string(),
        ];

        let all = filter_logical_keys("chatmem:conversation:", scanned.clone(), None);
        assert_eq!(all, vec!["u1:c1", "u2:c2"]);

        let filtered = filter_logical_keys("chatmem:conversation:", scanned, Some("u1"));
        assert_eq!(filtered, vec!["u1:c1"]);
    }
}
