//! ChatStore の実装と、ロックで保護された共有ストアハンドル

pub mod inmemory;
pub mod locked;
pub mod sqlite;

pub use inmemory::InMemoryChatStore;
pub use locked::LockedStore;
pub use sqlite::SqliteChatStore;
