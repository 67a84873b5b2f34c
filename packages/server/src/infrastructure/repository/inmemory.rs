//! InMemory ChatStore 実装
//!
//! 全テーブルを 1 つの Mutex の内側の順序付きマップで保持します。
//! SQLite スキーマの制約（オーナーの RESTRICT、メンバーシップとメッセージの
//! CASCADE）を再現し、どちらのストアでもアクターが同じ挙動になるようにします。

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    ChatStore, MessageId, MessageRecord, NewMessage, RoomId, RoomRecord, StoreError, UserRecord,
    Username,
};

#[derive(Default)]
struct Tables {
    users: BTreeMap<Username, UserRecord>,
    rooms: BTreeMap<RoomId, RoomRecord>,
    memberships: BTreeSet<(Username, RoomId)>,
    messages: BTreeMap<MessageId, MessageRecord>,
    next_message_id: i64,
}

/// インメモリストア（テストと `--memory` 起動で使用）
#[derive(Default)]
pub struct InMemoryChatStore {
    tables: Mutex<Tables>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_user(&self, username: &Username) -> Result<UserRecord, StoreError> {
        let tables = self.tables.lock().await;
        tables.users.get(username).cloned().ok_or(StoreError::NotFound)
    }

    async fn insert_user(&self, user: UserRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.users.contains_key(&user.username) {
            return Err(StoreError::Conflict);
        }
        tables.users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn delete_user(&self, username: &Username) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(username) {
            return Ok(0);
        }
        if tables.rooms.values().any(|room| room.is_owned_by(username)) {
            return Err(StoreError::Constraint(format!(
                "{username} owns at least one chat"
            )));
        }

        tables.users.remove(username);
        tables.memberships.retain(|(member, _)| member != username);
        for message in tables.messages.values_mut() {
            if &message.username == username {
                message.username = Username::unknown();
            }
        }
        Ok(1)
    }

    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.rooms.values().cloned().collect())
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<RoomRecord, StoreError> {
        let tables = self.tables.lock().await;
        tables.rooms.get(room_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn insert_room(&self, room: RoomRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.rooms.contains_key(&room.room_id) {
            return Err(StoreError::Conflict);
        }
        if !tables.users.contains_key(&room.owner) {
            return Err(StoreError::Constraint(format!(
                "owner {} does not exist",
                room.owner
            )));
        }
        tables.rooms.insert(room.room_id.clone(), room);
        Ok(())
    }

    async fn delete_room(&self, room_id: &RoomId, owner: &Username) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let owned = tables
            .rooms
            .get(room_id)
            .is_some_and(|room| room.is_owned_by(owner));
        if !owned {
            return Ok(0);
        }

        tables.rooms.remove(room_id);
        tables.memberships.retain(|(_, room)| room != room_id);
        tables
            .messages
            .retain(|_, message| &message.room_id != room_id);
        Ok(1)
    }

    async fn insert_membership(
        &self,
        username: &Username,
        room_id: &RoomId,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(username) || !tables.rooms.contains_key(room_id) {
            return Err(StoreError::Constraint(format!(
                "membership {username}/{room_id} references a missing record"
            )));
        }
        let inserted = tables
            .memberships
            .insert((username.clone(), room_id.clone()));
        Ok(u64::from(inserted))
    }

    async fn delete_membership(
        &self,
        username: &Username,
        room_id: &RoomId,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let removed = tables
            .memberships
            .remove(&(username.clone(), room_id.clone()));
        Ok(u64::from(removed))
    }

    async fn list_memberships_for(&self, username: &Username) -> Result<Vec<RoomId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .memberships
            .iter()
            .filter(|(member, _)| member == username)
            .map(|(_, room_id)| room_id.clone())
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.rooms.contains_key(&message.room_id) {
            return Err(StoreError::Constraint(format!(
                "chat {} does not exist",
                message.room_id
            )));
        }

        tables.next_message_id += 1;
        let record = MessageRecord {
            id: MessageId::new(tables.next_message_id),
            username: message.username,
            room_id: message.room_id,
            content: message.content,
            date: message.date,
        };
        tables.messages.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_message(
        &self,
        room_id: &RoomId,
        message_id: MessageId,
    ) -> Result<MessageRecord, StoreError> {
        let tables = self.tables.lock().await;
        tables
            .messages
            .get(&message_id)
            .filter(|message| &message.room_id == room_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete_message(
        &self,
        room_id: &RoomId,
        message_id: MessageId,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let belongs = tables
            .messages
            .get(&message_id)
            .is_some_and(|message| &message.room_id == room_id);
        if belongs {
            tables.messages.remove(&message_id);
        }
        Ok(u64::from(belongs))
    }

    async fn list_messages(
        &self,
        room_id: &RoomId,
        from: MessageId,
        to: MessageId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .range(from..=to)
            .map(|(_, message)| message)
            .filter(|message| &message.room_id == room_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
