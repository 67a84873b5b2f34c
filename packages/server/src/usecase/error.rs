//! アクターが返すエラー
//!
//! 各バリアントの `Display` 文字列が、そのままクライアントへの `e ` 応答になる。

use thiserror::Error;

use crate::domain::{MessageId, RoomId, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("no such user")]
    NoSuchUser,

    #[error("wrong password")]
    WrongPassword,

    #[error("already logged in")]
    AlreadyOnline,

    #[error("log in first")]
    NotSignedIn,

    #[error("username already taken")]
    UsernameTaken,

    #[error("you own at least one chat, delete it first")]
    OwnsChats,

    #[error("no such chat {0}")]
    NoSuchChat(RoomId),

    #[error("wrong chat password")]
    WrongChatPassword,

    #[error("already joined {0}")]
    AlreadyJoined(RoomId),

    #[error("you are the owner of {0}, delete it instead")]
    OwnerCannotLeave(RoomId),

    #[error("not a member of {0}")]
    NotMember(RoomId),

    #[error("chat id already taken")]
    ChatIdTaken,

    #[error("you are not the owner of {0}")]
    NotOwner(RoomId),

    #[error("no such message {0}")]
    NoSuchMessage(MessageId),

    #[error("only the author or the chat owner can delete message {0}")]
    NotAuthor(MessageId),

    #[error("server unavailable")]
    Unavailable,

    #[error("an error occurred")]
    Store(#[from] StoreError),
}

impl ChatError {
    /// ストレージ障害はログに残す。それ以外は想定内の結果
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_hide_details_from_clients() {
        // テスト項目: ストレージエラーの詳細はクライアントに見せない
        // given (前提条件):
        let err = ChatError::from(StoreError::Backend("disk I/O error".to_string()));

        // when (操作):
        let text = err.to_string();

        // then (期待する結果):
        assert_eq!(text, "an error occurred");
        assert!(err.is_internal());
    }

    #[test]
    fn test_domain_errors_name_the_chat() {
        // テスト項目: ドメインエラーには対象のチャット ID が含まれる
        let room_id = RoomId::new("room1".to_string()).unwrap();

        assert_eq!(
            ChatError::AlreadyJoined(room_id.clone()).to_string(),
            "already joined room1"
        );
        assert!(!ChatError::NotOwner(room_id).is_internal());
    }
}
