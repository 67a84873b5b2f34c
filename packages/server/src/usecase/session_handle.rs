//! アクターから接続セッションへの参照
//!
//! アクターはセッションの状態を直接変更しません。返信はセッションの
//! [`Outbox`] に積み、状態変更は制御キューで依頼し、セッションが自身の
//! タスクで適用します。

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    domain::{DisplayName, RoomId, Username},
    infrastructure::message_pusher::Outbox,
};

use super::room::RoomHandle;

/// クライアント接続 1 つの ID
pub type SessionId = Uuid;

/// アクターがセッションに適用を依頼する状態変更
#[derive(Debug)]
pub enum SessionUpdate {
    /// ログインまたは登録に成功
    Authenticated {
        username: Username,
        name: DisplayName,
        rooms: Vec<(RoomId, RoomHandle)>,
    },
    /// このチャットへの in-room 要求を転送できるようになった
    Joined { room_id: RoomId, room: RoomHandle },
    /// ユーザーがチャットから退出した
    Left { room_id: RoomId },
    /// オーナーがチャットを削除した
    RoomClosed { room_id: RoomId },
    /// アカウントが削除され、未認証状態に戻る
    SignedOut,
}

/// アクターが保持する、接続中セッションへの複製可能なハンドル
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    outbox: Outbox,
    control: mpsc::UnboundedSender<SessionUpdate>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        outbox: Outbox,
        control: mpsc::UnboundedSender<SessionUpdate>,
    ) -> Self {
        Self {
            id,
            outbox,
            control,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// セッションに状態変更を依頼する。セッションが終了していれば破棄
    pub fn update(&self, update: SessionUpdate) {
        if self.control.send(update).is_err() {
            tracing::debug!("Session {} is gone, dropping update", self.id);
        }
    }
}
