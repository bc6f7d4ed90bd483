use chatmem_config::StoreConfig;
use chatmem_core::{
    conversation_key, BackendKind, ContextMessage, Conversation, Metadata, Result, Role,
    StoreError,
};
use chatmem_storage::{ConversationBackend, MemoryBackend, RedisBackend};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Aggregate over all live conversations. Observability only.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub active_count: usize,
    pub total_messages: usize,
    pub backend_kind: BackendKind,
    pub oldest_updated_at: Option<DateTime<Utc>>,
    pub newest_updated_at: Option<DateTime<Utc>>,
}

/// Read-only view of the effective store configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub max_messages_per_conversation: usize,
    pub conversation_ttl_secs: u64,
    pub context_window_size: usize,
    pub backend_kind: BackendKind,
}

/// Manages bounded, expiring conversation histories keyed by
/// (user, channel) against whichever storage backend is active.
///
/// The backend is chosen once at construction: Redis if reachable,
/// otherwise the in-memory fallback. Appends for the same pair are
/// serialized through a per-key mutex so concurrent deliveries cannot
/// lose messages; different pairs proceed fully in parallel.
pub struct ConversationStore {
    backend: Arc<dyn ConversationBackend>,
    config: StoreConfig,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    /// Establish the durable backend, falling back to in-memory storage if
    /// Redis cannot be reached within the configured timeout. The decision
    /// is made once per process; there is no per-call fallback.
    pub async fn connect(config: StoreConfig) -> Self {
        let attempt = timeout(config.op_timeout(), RedisBackend::connect(&config.redis)).await;
        match attempt {
            Ok(Ok(backend)) => {
                info!("Conversation store using Redis backend");
                Self::with_backend(Arc::new(backend), config)
            }
            Ok(Err(e)) => {
                warn!("Redis unavailable, falling back to in-memory storage: {}", e);
                Self::fallback(config)
            }
            Err(_) => {
                warn!(
                    "Redis connection timed out after {}ms, falling back to in-memory storage",
                    config.redis.op_timeout_ms
                );
                Self::fallback(config)
            }
        }
    }

    /// Build a store around an explicit backend. This is the seam tests and
    /// embedders use to run against an injected implementation.
    pub fn with_backend(backend: Arc<dyn ConversationBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    fn fallback(config: StoreConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new(config.sweep_interval()));
        info!("Conversation store using in-memory backend");
        Self::with_backend(backend, config)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Look up the conversation for a pair, creating and persisting an
    /// empty one if absent or expired. An existing conversation is returned
    /// untouched; provider and model are only updated on append.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        channel_id: &str,
        provider: &str,
        model: &str,
    ) -> Result<Conversation> {
        let key = conversation_key(user_id, channel_id);

        if let Some(conversation) = self.load(&key).await? {
            return Ok(conversation);
        }

        // The create path writes, so it must hold the pair's append lock:
        // otherwise an empty conversation persisted here could clobber a
        // racing first append. Re-check under the lock before writing.
        let lock = self.append_lock(&key).await;
        let guard = lock.lock().await;

        let conversation = match self.load(&key).await? {
            Some(conversation) => conversation,
            None => {
                let conversation = Conversation::new(user_id, channel_id, provider, model);
                self.persist(&conversation).await?;
                info!("Created conversation {}", conversation.id);
                conversation
            }
        };

        drop(guard);
        self.prune_append_lock(&key, &lock).await;

        Ok(conversation)
    }

    /// Append one message, trimming the oldest entries past the configured
    /// cap, updating provider/model bookkeeping, and writing the whole
    /// conversation back with a fresh TTL. The read-modify-write cycle is
    /// held under the pair's append lock.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_message(
        &self,
        user_id: &str,
        channel_id: &str,
        role: Role,
        content: &str,
        metadata: Metadata,
        provider: &str,
        model: &str,
    ) -> Result<Conversation> {
        let key = conversation_key(user_id, channel_id);
        let lock = self.append_lock(&key).await;
        let guard = lock.lock().await;

        let mut conversation = match self.load(&key).await? {
            Some(conversation) => conversation,
            None => {
                info!("Created conversation {}", key);
                Conversation::new(user_id, channel_id, provider, model)
            }
        };

        conversation.push_message(role, content, metadata);
        let trimmed = conversation.trim_to(self.config.store.max_messages_per_conversation);
        if trimmed > 0 {
            debug!("Trimmed {} oldest messages from conversation {}", trimmed, key);
        }
        conversation.provider = provider.to_string();
        conversation.model = model.to_string();

        // A failed write must surface to the caller; claiming success here
        // would silently drop the message.
        self.persist(&conversation).await?;

        drop(guard);
        self.prune_append_lock(&key, &lock).await;

        Ok(conversation)
    }

    /// The most recent `max_messages` messages (or all, if fewer) in
    /// chronological order, reduced to the `{role, content}` view for the
    /// completion backend. An absent conversation yields an empty vec.
    pub async fn get_context(
        &self,
        user_id: &str,
        channel_id: &str,
        max_messages: Option<usize>,
    ) -> Result<Vec<ContextMessage>> {
        let max = max_messages.unwrap_or(self.config.store.context_window_size);
        if max == 0 {
            return Err(StoreError::InvalidArgument(
                "max_messages must be positive".into(),
            ));
        }

        let key = conversation_key(user_id, channel_id);
        match self.load(&key).await? {
            None => Ok(Vec::new()),
            Some(conversation) => Ok(conversation
                .recent_messages(max)
                .iter()
                .map(ContextMessage::from)
                .collect()),
        }
    }

    /// Delete the conversation for a pair. Returns whether one existed.
    pub async fn clear(&self, user_id: &str, channel_id: &str) -> Result<bool> {
        let key = conversation_key(user_id, channel_id);
        let removed = self.remove(&key).await?;
        if removed {
            info!("Cleared conversation {}", key);
        }
        Ok(removed)
    }

    /// Administrative sweep: keep the `keep_most_recent_n` conversations
    /// with the latest `updated_at`, delete the rest. Returns how many were
    /// removed.
    pub async fn cleanup(&self, keep_most_recent_n: usize) -> Result<usize> {
        let mut conversations = self.load_all().await?;
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut removed = 0;
        for conversation in conversations.iter().skip(keep_most_recent_n) {
            if self.remove(&conversation.id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Cleaned up {} old conversations", removed);
        }
        Ok(removed)
    }

    /// Delete every conversation unconditionally. Returns how many were
    /// removed.
    pub async fn cleanup_all(&self) -> Result<usize> {
        let keys = self.list_keys().await?;

        let mut removed = 0;
        for key in &keys {
            if self.remove(key).await? {
                removed += 1;
            }
        }

        info!("Deleted all {} conversations", removed);
        Ok(removed)
    }

    /// Aggregate over all live conversations.
    pub async fn stats(&self) -> Result<StoreStats> {
        let conversations = self.load_all().await?;

        let total_messages = conversations.iter().map(|c| c.message_count()).sum();
        let oldest_updated_at = conversations.iter().map(|c| c.updated_at).min();
        let newest_updated_at = conversations.iter().map(|c| c.updated_at).max();

        Ok(StoreStats {
            active_count: conversations.len(),
            total_messages,
            backend_kind: self.backend.kind(),
            oldest_updated_at,
            newest_updated_at,
        })
    }

    pub fn config_report(&self) -> ConfigReport {
        ConfigReport {
            max_messages_per_conversation: self.config.store.max_messages_per_conversation,
            conversation_ttl_secs: self.config.store.conversation_ttl_secs,
            context_window_size: self.config.store.context_window_size,
            backend_kind: self.backend.kind(),
        }
    }

    /// Probe the active backend. Cheap; safe to call from health endpoints.
    pub async fn backend_health(&self) -> chatmem_core::BackendHealth {
        self.backend.health().await
    }

    async fn load(&self, key: &str) -> Result<Option<Conversation>> {
        let backend = self.backend.clone();
        let owned_key = key.to_string();
        let loaded = self
            .with_retry("get", move || {
                let backend = backend.clone();
                let key = owned_key.clone();
                async move { backend.get(&key).await }
            })
            .await?;

        let Some(conversation) = loaded else {
            return Ok(None);
        };

        // Backends already hide expired entries; this re-check guards
        // against clock drift between processes sharing the durable
        // backend.
        let ttl = chrono::Duration::from_std(self.config.conversation_ttl())
            .unwrap_or(chrono::Duration::MAX);
        if conversation.is_expired(ttl, Utc::now()) {
            debug!("Ignoring expired conversation {}", key);
            return Ok(None);
        }

        Ok(Some(conversation))
    }

    async fn persist(&self, conversation: &Conversation) -> Result<()> {
        let backend = self.backend.clone();
        let conversation = conversation.clone();
        let ttl = self.config.conversation_ttl();
        self.with_retry("put", move || {
            let backend = backend.clone();
            let conversation = conversation.clone();
            async move { backend.put(&conversation.id, &conversation, ttl).await }
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let backend = self.backend.clone();
        let key = key.to_string();
        self.with_retry("delete", move || {
            let backend = backend.clone();
            let key = key.clone();
            async move { backend.delete(&key).await }
        })
        .await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let backend = self.backend.clone();
        self.with_retry("list_keys", move || {
            let backend = backend.clone();
            async move { backend.list_keys(None).await }
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<Conversation>> {
        let keys = self.list_keys().await?;
        let mut conversations = Vec::with_capacity(keys.len());
        for key in &keys {
            // A key can expire between listing and loading; skip it.
            if let Some(conversation) = self.load(key).await? {
                conversations.push(conversation);
            }
        }
        Ok(conversations)
    }

    /// Run a backend call bounded by the configured timeout, retrying once
    /// after a short backoff on transient failure. Exhausted retries
    /// surface as storage-unavailable.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout_ms = self.config.redis.op_timeout_ms;

        let first_err = match timeout(self.config.op_timeout(), call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() => e,
            Ok(Err(e)) => return Err(e),
            Err(_) => StoreError::Timeout(timeout_ms),
        };

        warn!("Backend {} failed, retrying once: {}", op, first_err);
        tokio::time::sleep(self.config.retry_backoff()).await;

        match timeout(self.config.op_timeout(), call()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_transient() => Err(StoreError::StorageUnavailable(e.to_string())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::StorageUnavailable(format!(
                "{} timed out after {}ms on retry",
                op, timeout_ms
            ))),
        }
    }

    async fn append_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop a pair's lock entry once nobody else is holding or waiting on
    /// it, so the registry does not grow with every pair ever seen.
    async fn prune_append_lock(&self, key: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.append_locks.lock().await;
        // Two strong counts: the registry's and the caller's.
        if Arc::strong_count(lock) <= 2 {
            locks.remove(key);
        }
    }
}
