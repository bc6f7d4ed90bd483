pub mod memory;
pub mod redis_backend;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use async_trait::async_trait;
use chatmem_core::{BackendHealth, BackendKind, Conversation, Result};
use std::time::Duration;

/// Keyed persistence for conversations. Two variants exist: a durable one
/// backed by Redis with native TTL expiration, and a process-local one with
/// manually tracked expiry. The store manager picks one at startup and
/// never switches afterwards.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Fetch a conversation if it is present and not logically expired.
    /// Implementations must never return an expired conversation, even if
    /// it is still physically stored.
    async fn get(&self, key: &str) -> Result<Option<Conversation>>;

    /// Store or overwrite, resetting the expiry to `now + ttl`.
    /// Last writer wins; there is no merging.
    async fn put(&self, key: &str, conversation: &Conversation, ttl: Duration) -> Result<()>;

    /// Remove if present. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Enumerate live conversation keys, optionally restricted to a logical
    /// key prefix. Administrative use only; on the durable variant this is
    /// a best-effort scan and not cheap at scale.
    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Cheap liveness probe.
    async fn health(&self) -> BackendHealth;
}
