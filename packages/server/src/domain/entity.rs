//! 永続化ポートとやり取りするレコード

use super::value_object::{
    DisplayName, MessageContent, MessageId, PasswordDigest, RoomId, Timestamp, Username,
};

/// 登録済みユーザー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: Username,
    pub name: DisplayName,
    pub password: PasswordDigest,
    pub created_at: Timestamp,
}

impl UserRecord {
    /// ユーザー名をソルトにパスワードをハッシュ化して新規ユーザーを作成
    pub fn register(
        username: Username,
        name: DisplayName,
        password: &str,
        created_at: Timestamp,
    ) -> Self {
        let password = PasswordDigest::hash(username.as_str(), password);
        Self {
            username,
            name,
            password,
            created_at,
        }
    }

    pub fn verify_password(&self, password: &str) -> bool {
        self.password.verify(self.username.as_str(), password)
    }
}

/// 永続化されたチャットルーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub name: DisplayName,
    pub password: PasswordDigest,
    pub owner: Username,
    pub created_at: Timestamp,
}

impl RoomRecord {
    /// チャット ID をソルトにパスワードをハッシュ化して新規チャットを作成
    pub fn create(
        room_id: RoomId,
        name: DisplayName,
        password: &str,
        owner: Username,
        created_at: Timestamp,
    ) -> Self {
        let password = PasswordDigest::hash(room_id.as_str(), password);
        Self {
            room_id,
            name,
            password,
            owner,
            created_at,
        }
    }

    pub fn verify_password(&self, password: &str) -> bool {
        self.password.verify(self.room_id.as_str(), password)
    }

    pub fn is_owned_by(&self, username: &Username) -> bool {
        &self.owner == username
    }
}

/// 保存前のメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub username: Username,
    pub room_id: RoomId,
    pub content: MessageContent,
    pub date: Timestamp,
}

/// 保存済みメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub username: Username,
    pub room_id: RoomId,
    pub content: MessageContent,
    pub date: Timestamp,
}
