pub mod store;

pub use store::{ConfigReport, ConversationStore, StoreStats};
