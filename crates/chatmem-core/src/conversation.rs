use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Free-form per-message or per-conversation metadata. The store never
/// inspects these values; providers and tools shape them as they like.
pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// One turn's content. Immutable once appended to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// The reduced `{role, content}` view handed to the completion backend.
/// Timestamps and metadata are deliberately not forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ContextMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// Bounded, expiring message history for one (user, channel) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
    pub provider: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

impl Conversation {
    pub fn new(
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        let channel_id = channel_id.into();
        let now = Utc::now();

        Self {
            id: conversation_key(&user_id, &channel_id),
            user_id,
            channel_id,
            provider: provider.into(),
            model: model.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Append a message stamped with the current instant and bump
    /// `updated_at`. Timestamps are clamped so they never go backwards
    /// within a conversation.
    pub fn push_message(&mut self, role: Role, content: impl Into<String>, metadata: Metadata) {
        let mut message = Message::new(role, content, metadata);
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        self.updated_at = message.timestamp;
        self.messages.push(message);
    }

    /// Drop oldest messages until at most `max` remain. Returns how many
    /// were removed. Never touches the most recent messages.
    pub fn trim_to(&mut self, max: usize) -> usize {
        if self.messages.len() <= max {
            return 0;
        }
        let excess = self.messages.len() - max;
        self.messages.drain(..excess);
        excess
    }

    /// The last `n` messages in chronological order (all of them if fewer).
    pub fn recent_messages(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// A conversation is expired once `ttl` has elapsed since its last
    /// update, measured against `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.updated_at) > ttl
    }
}

/// Derive the stable storage key for a (user, channel) pair. Components are
/// escaped before joining so no two distinct pairs can produce the same key.
pub fn conversation_key(user_id: &str, channel_id: &str) -> String {
    format!("{}:{}", escape_component(user_id), escape_component(channel_id))
}

fn escape_component(s: &str) -> String {
    s.replace('%', "%25").replace(':', "%3a")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_for_same_pair() {
        assert_eq!(
            conversation_key("u1", "c1"),
            conversation_key("u1", "c1")
        );
    }

    #[test]
    fn key_cannot_collide_across_pairs() {
        // Naive joining would map both of these to "a:b:c".
        assert_ne!(conversation_key("a:b", "c"), conversation_key("a", "b:c"));
        assert_ne!(conversation_key("a%3ab", "c"), conversation_key("a:b", "c"));
    }

    #[test]
    fn push_appends_in_order_and_bumps_updated_at() {
        let mut conv = Conversation::new("u1", "c1", "openai", "gpt-4o");
        let created = conv.created_at;

        conv.push_message(Role::User, "hi", Metadata::new());
        conv.push_message(Role::Assistant, "hello", Metadata::new());

        assert_eq!(conv.message_count(), 2);
        assert_eq!(conv.messages[0].content, "hi");
        assert_eq!(conv.messages[1].content, "hello");
        assert!(conv.created_at <= conv.updated_at);
        assert_eq!(conv.created_at, created);
        assert!(conv.messages[0].timestamp <= conv.messages[1].timestamp);
    }

    #[test]
    fn trim_drops_only_the_oldest() {
        let mut conv = Conversation::new("u1", "c1", "openai", "gpt-4o");
        for i in 0..10 {
            conv.push_message(Role::User, format!("m{i}"), Metadata::new());
        }

        let removed = conv.trim_to(4);
        assert_eq!(removed, 6);
        assert_eq!(conv.message_count(), 4);
        assert_eq!(conv.messages[0].content, "m6");
        assert_eq!(conv.messages[3].content, "m9");
    }

    #[test]
    fn trim_is_noop_under_bound() {
        let mut conv = Conversation::new("u1", "c1", "openai", "gpt-4o");
        conv.push_message(Role::User, "only", Metadata::new());
        assert_eq!(conv.trim_to(5), 0);
        assert_eq!(conv.message_count(), 1);
    }

    #[test]
    fn recent_messages_returns_tail_in_order() {
        let mut conv = Conversation::new("u1", "c1", "openai", "gpt-4o");
        for i in 0..5 {
            conv.push_message(Role::User, format!("m{i}"), Metadata::new());
        }

        let recent: Vec<_> = conv.recent_messages(2).iter().map(|m| m.content.clone()).collect();
        assert_eq!(recent, vec!["m3", "m4"]);

        // Asking for more than exist returns everything.
        assert_eq!(conv.recent_messages(50).len(), 5);
    }

    #[test]
    fn expiry_is_measured_from_last_update() {
        let conv = Conversation::new("u1", "c1", "openai", "gpt-4o");
        let ttl = Duration::hours(24);

        assert!(!conv.is_expired(ttl, Utc::now()));
        assert!(conv.is_expired(ttl, Utc::now() + Duration::hours(25)));
    }

    #[test]
    fn serialized_form_round_trips() {
        let mut conv = Conversation::new("u1", "c1", "ollama", "llama3");
        let mut meta = Metadata::new();
        meta.insert("latency_ms".into(), serde_json::json!(120));
        conv.push_message(Role::Assistant, "hello", meta);

        let json = serde_json::to_string(&conv).unwrap();
        let back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, conv.id);
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.messages[0].metadata["latency_ms"], serde_json::json!(120));
    }
}
