//! Domain 層: 値オブジェクト、レコード、永続化ポート

pub mod entity;
pub mod error;
pub mod repository;
pub mod value_object;

pub use entity::{MessageRecord, NewMessage, RoomRecord, UserRecord};
pub use error::{StoreError, ValueObjectError};
pub use repository::ChatStore;
pub use value_object::{
    DisplayName, MessageContent, MessageId, PasswordDigest, RoomId, Timestamp, Username,
};

#[cfg(test)]
pub use repository::MockChatStore;
