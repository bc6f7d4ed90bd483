use async_trait::async_trait;
use chatmem_core::{BackendHealth, BackendKind, Conversation, Result, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ConversationBackend;

struct StoredConversation {
    conversation: Conversation,
    expires_at: DateTime<Utc>,
}

/// Process-local fallback backend. Expiry is tracked per entry and checked
/// lazily on every read; a background task sweeps expired entries so an
/// idle table does not grow without bound.
pub struct MemoryBackend {
    table: Arc<RwLock<HashMap<String, StoredConversation>>>,
    sweeper: JoinHandle<()>,
}

impl MemoryBackend {
    pub fn new(sweep_interval: Duration) -> Self {
        let table: Arc<RwLock<HashMap<String, StoredConversation>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let sweep_table = table.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let mut table = sweep_table.write().await;
                let before = table.len();
                table.retain(|_, entry| entry.expires_at > now);
                let swept = before - table.len();
                if swept > 0 {
                    debug!("Swept {} expired conversations", swept);
                }
            }
        });

        Self { table, sweeper }
    }

    /// Number of physical entries, including expired ones the sweeper has
    /// not reached yet. Test hook.
    pub async fn entry_count(&self) -> usize {
        self.table.read().await.len()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[async_trait]
impl ConversationBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<Conversation>> {
        let now = Utc::now();

        // Reads of live entries only need the shared lock.
        {
            let table = self.table.read().await;
            match table.get(key) {
                Some(entry) if entry.expires_at > now => {
                    return Ok(Some(entry.conversation.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Logically expired but not yet swept; prune under the write lock,
        // re-checking since the entry may have been replaced in between.
        let mut table = self.table.write().await;
        match table.get(key) {
            Some(entry) if entry.expires_at <= now => {
                table.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.conversation.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, conversation: &Conversation, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| StoreError::InvalidArgument("TTL out of range".into()))?;
        let entry = StoredConversation {
            conversation: conversation.clone(),
            expires_at: Utc::now() + ttl,
        };

        self.table.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.table.write().await.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let now = Utc::now();
        let table = self.table.read().await;

        let keys = table
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, _)| key.clone())
            .filter(|key| prefix.map_or(true, |p| key.starts_with(p)))
            .collect();

        Ok(keys)
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatmem_core::Role;

    fn sample(user: &str, channel: &str) -> Conversation {
        let mut conv = Conversation::new(user, channel, "openai", "gpt-4o");
        conv.push_message(Role::User, "hi", Default::default());
        conv
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let backend = MemoryBackend::new(Duration::from_secs(60));
        let conv = sample("u1", "c1");

        backend.put(&conv.id, &conv, Duration::from_secs(60)).await.unwrap();
        let loaded = backend.get(&conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);

        assert!(backend.delete(&conv.id).await.unwrap());
        assert!(!backend.delete(&conv.id).await.unwrap());
        assert!(backend.get(&conv.id).await.unwrap().is_none());
        assert_eq!(backend.health().await, BackendHealth::Ok);
    }

    #[tokio::test]
    async fn expired_entry_is_absent_at_read_time() {
        // Sweep interval far in the future so only the lazy read check runs.
        let backend = MemoryBackend::new(Duration::from_secs(3600));
        let conv = sample("u1", "c1");

        backend.put(&conv.id, &conv, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(backend.get(&conv.id).await.unwrap().is_none());
        // The expired read also pruned the physical entry.
        assert_eq!(backend.entry_count().await, 0);
    }

    #[tokio::test]
    async fn list_keys_excludes_expired_entries() {
        let backend = MemoryBackend::new(Duration::from_secs(3600));
        let live = sample("u1", "c1");
        let dead = sample("u2", "c2");

        backend.put(&live.id, &live, Duration::from_secs(60)).await.unwrap();
        backend.put(&dead.id, &dead, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let keys = backend.list_keys(None).await.unwrap();
        assert_eq!(keys, vec![live.id.clone()]);

        let filtered = backend.list_keys(Some("u1")).await.unwrap();
        assert_eq!(filtered, vec![live.id]);
    }

    #[tokio::test]
    async fn concurrent_reads_of_an_expired_entry_prune_it_once() {
        let backend = Arc::new(MemoryBackend::new(Duration::from_secs(3600)));
        let conv = sample("u1", "c1");

        backend.put(&conv.id, &conv, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut readers = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            let key = conv.id.clone();
            readers.push(tokio::spawn(async move { backend.get(&key).await }));
        }
        for reader in readers {
            assert!(reader.await.unwrap().unwrap().is_none());
        }

        assert_eq!(backend.entry_count().await, 0);
    }

    #[tokio::test]
    async fn sweeper_prunes_expired_entries() {
        let backend = MemoryBackend::new(Duration::from_millis(20));
        let conv = sample("u1", "c1");

        backend.put(&conv.id, &conv, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(backend.entry_count().await, 0);
    }

    #[tokio::test]
    async fn overwrite_resets_expiry() {
        let backend = MemoryBackend::new(Duration::from_secs(3600));
        let conv = sample("u1", "c1");

        backend.put(&conv.id, &conv, Duration::from_millis(20)).await.unwrap();
        backend.put(&conv.id, &conv, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(backend.get(&conv.id).await.unwrap().is_some());
    }
}
