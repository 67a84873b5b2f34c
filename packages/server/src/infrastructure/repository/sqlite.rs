//! SQLite ChatStore 実装（sqlx）
//!
//! ## スキーマ
//!
//! ```text
//! users    (username PK, name, password, created_at)
//! chats    (chat_id PK, chat_name, password, owner -> users ON DELETE RESTRICT, created_at)
//! joined   (username -> users CASCADE, chat_id -> chats CASCADE, joined_at, PK(username, chat_id))
//! messages (id AUTOINCREMENT, username, chat_id -> chats CASCADE, content, date)
//! ```
//!
//! `messages.username` には外部キーを付けない。ユーザー削除時は同じ
//! トランザクション内でメッセージの投稿者を `unknown` に書き換える。

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use crate::domain::{
    ChatStore, DisplayName, MessageContent, MessageId, MessageRecord, NewMessage, PasswordDigest,
    RoomId, RoomRecord, StoreError, Timestamp, UserRecord, Username, ValueObjectError,
    value_object::UNKNOWN_AUTHOR,
};

const MAX_CONNECTIONS: u32 = 8;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        username TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        password TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chats (
        chat_id TEXT PRIMARY KEY NOT NULL,
        chat_name TEXT NOT NULL,
        password TEXT NOT NULL,
        owner TEXT NOT NULL REFERENCES users(username) ON DELETE RESTRICT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS joined (
        username TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
        chat_id TEXT NOT NULL REFERENCES chats(chat_id) ON DELETE CASCADE,
        joined_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER) * 1000),
        PRIMARY KEY (username, chat_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL DEFAULT 'unknown',
        chat_id TEXT NOT NULL REFERENCES chats(chat_id) ON DELETE CASCADE,
        content TEXT NOT NULL,
        date INTEGER NOT NULL
    )
    "#,
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Conflict,
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                StoreError::Constraint(db_err.message().to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

fn corrupt_row(err: ValueObjectError) -> StoreError {
    StoreError::Backend(format!("corrupt row: {err}"))
}

fn stored_username(value: String) -> Result<Username, StoreError> {
    if value == UNKNOWN_AUTHOR {
        return Ok(Username::unknown());
    }
    Username::new(value).map_err(corrupt_row)
}

type UserRow = (String, String, String, i64);
type RoomRow = (String, String, String, String, i64);
type MessageRow = (i64, String, String, String, i64);

fn user_from_row((username, name, password, created_at): UserRow) -> Result<UserRecord, StoreError> {
    Ok(UserRecord {
        username: stored_username(username)?,
        name: DisplayName::new(name).map_err(corrupt_row)?,
        password: PasswordDigest::from_stored(password),
        created_at: Timestamp::new(created_at),
    })
}

fn room_from_row(
    (chat_id, chat_name, password, owner, created_at): RoomRow,
) -> Result<RoomRecord, StoreError> {
    Ok(RoomRecord {
        room_id: RoomId::new(chat_id).map_err(corrupt_row)?,
        name: DisplayName::new(chat_name).map_err(corrupt_row)?,
        password: PasswordDigest::from_stored(password),
        owner: stored_username(owner)?,
        created_at: Timestamp::new(created_at),
    })
}

fn message_from_row(
    (id, username, chat_id, content, date): MessageRow,
) -> Result<MessageRecord, StoreError> {
    Ok(MessageRecord {
        id: MessageId::new(id),
        username: stored_username(username)?,
        room_id: RoomId::new(chat_id).map_err(corrupt_row)?,
        content: MessageContent::new(content).map_err(corrupt_row)?,
        date: Timestamp::new(date),
    })
}

/// SQLite を使ったストア
pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    /// `url` のデータベースを開き（なければ作成）、スキーマを初期化する
    ///
    /// # Errors
    ///
    /// データベースを開けない場合、またはスキーマを作成できない場合
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// 専用のインメモリデータベースを開く（期限切れにならない単一接続のプール）
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::info!("SQLite schema ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn get_user(&self, username: &Username) -> Result<UserRecord, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT username, name, password, created_at FROM users WHERE username = ?",
        )
        .bind(username.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(user_from_row).unwrap_or(Err(StoreError::NotFound))
    }

    async fn insert_user(&self, user: UserRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (username, name, password, created_at) VALUES (?, ?, ?, ?)")
            .bind(user.username.as_str())
            .bind(user.name.as_str())
            .bind(user.password.as_str())
            .bind(user.created_at.value())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_user(&self, username: &Username) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET username = ? WHERE username = ?")
            .bind(UNKNOWN_AUTHOR)
            .bind(username.as_str())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let rows: Vec<RoomRow> = sqlx::query_as(
            "SELECT chat_id, chat_name, password, owner, created_at FROM chats ORDER BY chat_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(room_from_row).collect()
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<RoomRecord, StoreError> {
        let row: Option<RoomRow> = sqlx::query_as(
            "SELECT chat_id, chat_name, password, owner, created_at FROM chats WHERE chat_id = ?",
        )
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(room_from_row).unwrap_or(Err(StoreError::NotFound))
    }

    async fn insert_room(&self, room: RoomRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chats (chat_id, chat_name, password, owner, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(room.room_id.as_str())
        .bind(room.name.as_str())
        .bind(room.password.as_str())
        .bind(room.owner.as_str())
        .bind(room.created_at.value())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_room(&self, room_id: &RoomId, owner: &Username) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM chats WHERE chat_id = ? AND owner = ?")
            .bind(room_id.as_str())
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_membership(
        &self,
        username: &Username,
        room_id: &RoomId,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("INSERT OR IGNORE INTO joined (username, chat_id) VALUES (?, ?)")
            .bind(username.as_str())
            .bind(room_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_membership(
        &self,
        username: &Username,
        room_id: &RoomId,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM joined WHERE username = ? AND chat_id = ?")
            .bind(username.as_str())
            .bind(room_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_memberships_for(&self, username: &Username) -> Result<Vec<RoomId>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT chat_id FROM joined WHERE username = ? ORDER BY chat_id")
                .bind(username.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(chat_id,)| RoomId::new(chat_id).map_err(corrupt_row))
            .collect()
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        let result =
            sqlx::query("INSERT INTO messages (username, chat_id, content, date) VALUES (?, ?, ?, ?)")
                .bind(message.username.as_str())
                .bind(message.room_id.as_str())
                .bind(message.content.as_str())
                .bind(message.date.value())
                .execute(&self.pool)
                .await?;
        Ok(MessageRecord {
            id: MessageId::new(result.last_insert_rowid()),
            username: message.username,
            room_id: message.room_id,
            content: message.content,
            date: message.date,
        })
    }

    async fn get_message(
        &self,
        room_id: &RoomId,
        message_id: MessageId,
    ) -> Result<MessageRecord, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, username, chat_id, content, date FROM messages WHERE chat_id = ? AND id = ?",
        )
        .bind(room_id.as_str())
        .bind(message_id.value())
        .fetch_optional(&self.pool)
        .await?;
        row.map(message_from_row).unwrap_or(Err(StoreError::NotFound))
    }

    async fn delete_message(
        &self,
        room_id: &RoomId,
        message_id: MessageId,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE chat_id = ? AND id = ?")
            .bind(room_id.as_str())
            .bind(message_id.value())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_messages(
        &self,
        room_id: &RoomId,
        from: MessageId,
        to: MessageId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, username, chat_id, content, date FROM messages \
             WHERE chat_id = ? AND id BETWEEN ? AND ? ORDER BY id LIMIT ?",
        )
        .bind(room_id.as_str())
        .bind(from.value())
        .bind(to.value())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn username(value: &str) -> Username {
        Username::new(value.to_string()).unwrap()
    }

    fn room_id(value: &str) -> RoomId {
        RoomId::new(value.to_string()).unwrap()
    }

    async fn seeded_store() -> SqliteChatStore {
        let store = SqliteChatStore::in_memory().await.unwrap();
        store
            .insert_user(UserRecord::register(
                username("alice"),
                DisplayName::new("Alice".to_string()).unwrap(),
                "pass",
                Timestamp::new(1),
            ))
            .await
            .unwrap();
        store
            .insert_room(RoomRecord::create(
                room_id("room1"),
                DisplayName::new("My Room".to_string()).unwrap(),
                "secret",
                username("alice"),
                Timestamp::new(2),
            ))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_user_round_trip_and_not_found() {
        // テスト項目: 登録したユーザーを取得でき、未登録ユーザーは NotFound になる
        // given (前提条件):
        let store = seeded_store().await;

        // when (操作):
        let alice = store.get_user(&username("alice")).await.unwrap();
        let missing = store.get_user(&username("bob")).await;

        // then (期待する結果):
        assert_eq!(alice.name.as_str(), "Alice");
        assert!(alice.verify_password("pass"));
        assert_eq!(missing, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_conflicts() {
        // テスト項目: ユーザー名・チャット ID の重複は Conflict として報告される
        // given (前提条件):
        let store = seeded_store().await;

        // when (操作):
        let user = store
            .insert_user(UserRecord::register(
                username("alice"),
                DisplayName::new("Again".to_string()).unwrap(),
                "x",
                Timestamp::new(3),
            ))
            .await;
        let room = store
            .insert_room(RoomRecord::create(
                room_id("room1"),
                DisplayName::new("Again".to_string()).unwrap(),
                "x",
                username("alice"),
                Timestamp::new(3),
            ))
            .await;

        // then (期待する結果):
        assert_eq!(user, Err(StoreError::Conflict));
        assert_eq!(room, Err(StoreError::Conflict));
    }

    #[tokio::test]
    async fn test_owner_delete_is_restricted_and_membership_idempotent() {
        // テスト項目: オーナー削除は Constraint、membership の追加は冪等
        // given (前提条件):
        let store = seeded_store().await;

        // when (操作):
        let first = store
            .insert_membership(&username("alice"), &room_id("room1"))
            .await
            .unwrap();
        let second = store
            .insert_membership(&username("alice"), &room_id("room1"))
            .await
            .unwrap();
        let delete = store.delete_user(&username("alice")).await;

        // then (期待する結果):
        assert_eq!((first, second), (1, 0));
        assert!(matches!(delete, Err(StoreError::Constraint(_))));
        assert_eq!(
            store.list_memberships_for(&username("alice")).await.unwrap(),
            vec![room_id("room1")]
        );
    }

    #[tokio::test]
    async fn test_delete_room_cascades_messages() {
        // テスト項目: チャット削除でメッセージと membership が連鎖削除される
        // given (前提条件):
        let store = seeded_store().await;
        store
            .insert_membership(&username("alice"), &room_id("room1"))
            .await
            .unwrap();
        let message = store
            .insert_message(NewMessage {
                username: username("alice"),
                room_id: room_id("room1"),
                content: MessageContent::new("hello world".to_string()).unwrap(),
                date: Timestamp::new(10),
            })
            .await
            .unwrap();

        // when (操作):
        let deleted = store
            .delete_room(&room_id("room1"), &username("alice"))
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(deleted, 1);
        assert_eq!(
            store.get_message(&room_id("room1"), message.id).await,
            Err(StoreError::NotFound)
        );
        assert!(
            store
                .list_memberships_for(&username("alice"))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
