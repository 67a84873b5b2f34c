//! 永続化ポート（Repository trait）
//!
//! アクターはこの trait にのみ依存します。具体的な実装は Infrastructure 層が
//! 提供します（`InMemoryChatStore`, `SqliteChatStore`）。

use async_trait::async_trait;

use super::{
    MessageId, MessageRecord, NewMessage, RoomId, RoomRecord, StoreError, UserRecord, Username,
};

/// ユーザー、チャット、メンバーシップ、メッセージの永続ストア
///
/// 呼び出し側から見て 1 回の呼び出しが 1 ステートメント。
/// アクセスはプロセス全体のストアロック（`LockedStore`）を通して直列化する。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// ユーザー名でユーザーを取得
    async fn get_user(&self, username: &Username) -> Result<UserRecord, StoreError>;

    /// ユーザーを追加。ユーザー名が使用済みなら `Conflict`
    async fn insert_user(&self, user: UserRecord) -> Result<(), StoreError>;

    /// ユーザーとそのメンバーシップを削除し、投稿は `unknown` に付け替える。
    /// チャットを所有していれば `Constraint`。削除したユーザー行数を返す。
    async fn delete_user(&self, username: &Username) -> Result<u64, StoreError>;

    /// 永続化された全チャット（チャット ID 順）
    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError>;

    /// チャット ID でチャットを取得
    async fn get_room(&self, room_id: &RoomId) -> Result<RoomRecord, StoreError>;

    /// チャットを追加。ID が使用済みなら `Conflict`、オーナーが存在しなければ `Constraint`
    async fn insert_room(&self, room: RoomRecord) -> Result<(), StoreError>;

    /// `owner` が所有するチャットを削除（メンバーシップとメッセージも連鎖削除）。
    /// 削除したチャット行数を返す（オーナー不一致なら 0）。
    async fn delete_room(&self, room_id: &RoomId, owner: &Username) -> Result<u64, StoreError>;

    /// 冪等なメンバーシップ追加。参加済みなら 0 を返す
    async fn insert_membership(
        &self,
        username: &Username,
        room_id: &RoomId,
    ) -> Result<u64, StoreError>;

    /// 冪等なメンバーシップ削除。未参加なら 0 を返す
    async fn delete_membership(
        &self,
        username: &Username,
        room_id: &RoomId,
    ) -> Result<u64, StoreError>;

    /// ユーザーが参加しているチャット（チャット ID 順）
    async fn list_memberships_for(&self, username: &Username) -> Result<Vec<RoomId>, StoreError>;

    /// メッセージを保存し、採番された ID 付きで返す
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError>;

    /// チャット内のメッセージを取得
    async fn get_message(
        &self,
        room_id: &RoomId,
        message_id: MessageId,
    ) -> Result<MessageRecord, StoreError>;

    /// チャット内のメッセージを削除し、削除行数を返す
    async fn delete_message(
        &self,
        room_id: &RoomId,
        message_id: MessageId,
    ) -> Result<u64, StoreError>;

    /// `from <= id <= to` のメッセージを昇順で最大 `limit` 件返す
    async fn list_messages(
        &self,
        room_id: &RoomId,
        from: MessageId,
        to: MessageId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError>;
}
