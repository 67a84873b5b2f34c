//! UseCase: ルームアクター
//!
//! チャットごとに 1 タスク。接続中メンバーの表（ユーザー名 → セッション）を
//! 所有し、in-room 要求を到着順に処理します（メッセージの投稿・削除・取得、
//! 接続中メンバーの一覧、オーナーによる削除時の停止）。
//!
//! ## テスト観点
//! - 正常系：送信者以外の全メンバーへのブロードキャスト
//! - 異常系：保存失敗は送信者にのみ通知される
//! - エッジケース：古いセッションからの quit は現在のエントリを消さない、
//!   dc でメンバーが退出しアクターが停止する

use std::{collections::BTreeMap, ops::ControlFlow};

use hiroba_shared::time::timestamp_to_rfc3339;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::domain::{
    MessageContent, MessageId, MessageRecord, NewMessage, RoomId, RoomRecord, StoreError,
    Username,
};

use super::{
    context::ChatContext,
    error::ChatError,
    session_handle::{SessionHandle, SessionId, SessionUpdate},
};

/// ルームアクターが処理する要求
#[derive(Debug)]
pub enum RoomRequest {
    /// 接続中メンバーを登録（マネージャーが送る）
    Attach {
        username: Username,
        session: SessionHandle,
    },
    /// `username` のエントリが `session_id` のものであれば外す
    Quit {
        username: Username,
        session_id: SessionId,
    },
    NewMessage {
        username: Username,
        content: MessageContent,
        session: SessionHandle,
    },
    DeleteMessage {
        username: Username,
        message_id: MessageId,
        session: SessionHandle,
    },
    GetMessages {
        from: MessageId,
        to: MessageId,
        session: SessionHandle,
    },
    GetUsers {
        session: SessionHandle,
    },
    /// ストアとディレクトリから削除済み。メンバーを退出させて停止する
    DeleteChat,
}

/// ルームアクターのキューの送信側
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    sender: mpsc::UnboundedSender<RoomRequest>,
}

impl RoomHandle {
    /// 要求を積む。失敗するのはアクターが停止している場合のみ
    pub fn send(&self, request: RoomRequest) -> Result<(), ChatError> {
        self.sender
            .send(request)
            .map_err(|_| ChatError::NotMember(self.room_id.clone()))
    }

    pub fn attach(&self, username: Username, session: SessionHandle) {
        if self.send(RoomRequest::Attach { username, session }).is_err() {
            tracing::warn!("Room {} stopped before attach", self.room_id);
        }
    }

    pub fn quit(&self, username: Username, session_id: SessionId) {
        if self
            .send(RoomRequest::Quit {
                username,
                session_id,
            })
            .is_err()
        {
            tracing::debug!("Room {} already stopped", self.room_id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub struct RoomActor {
    room_id: RoomId,
    owner: Username,
    ctx: ChatContext,
    members: BTreeMap<Username, SessionHandle>,
    requests: mpsc::UnboundedReceiver<RoomRequest>,
}

impl RoomActor {
    /// 永続化されたチャットのアクターを起動
    pub fn spawn(record: &RoomRecord, ctx: ChatContext) -> (RoomHandle, JoinHandle<()>) {
        let (sender, requests) = mpsc::unbounded_channel();
        let actor = Self {
            room_id: record.room_id.clone(),
            owner: record.owner.clone(),
            ctx,
            members: BTreeMap::new(),
            requests,
        };
        let handle = RoomHandle {
            room_id: record.room_id.clone(),
            sender,
        };
        (handle, tokio::spawn(actor.run()))
    }

    async fn run(mut self) {
        tracing::debug!("Room {} started", self.room_id);
        while let Some(request) = self.requests.recv().await {
            if self.handle(request).await.is_break() {
                break;
            }
        }
        tracing::info!("Room {} stopped", self.room_id);
    }

    async fn handle(&mut self, request: RoomRequest) -> ControlFlow<()> {
        match request {
            RoomRequest::Attach { username, session } => {
                tracing::debug!("{} attached to {}", username, self.room_id);
                self.members.insert(username, session);
            }
            RoomRequest::Quit {
                username,
                session_id,
            } => self.detach(&username, session_id),
            RoomRequest::NewMessage {
                username,
                content,
                session,
            } => self.new_message(username, content, &session).await,
            RoomRequest::DeleteMessage {
                username,
                message_id,
                session,
            } => {
                let result = self.delete_message(&username, message_id).await;
                self.reply(&session, result);
            }
            RoomRequest::GetMessages { from, to, session } => {
                self.get_messages(from, to, &session).await
            }
            RoomRequest::GetUsers { session } => {
                let users: String = self
                    .members
                    .keys()
                    .map(|username| format!(" {username}"))
                    .collect();
                session
                    .outbox()
                    .notify(format!("{} users{}", self.room_id, users));
            }
            RoomRequest::DeleteChat => {
                self.close();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn detach(&mut self, username: &Username, session_id: SessionId) {
        let owned = self
            .members
            .get(username)
            .is_some_and(|session| session.id() == session_id);
        if owned {
            self.members.remove(username);
            tracing::debug!("{} detached from {}", username, self.room_id);
        }
    }

    async fn new_message(
        &mut self,
        username: Username,
        content: MessageContent,
        session: &SessionHandle,
    ) {
        let message = NewMessage {
            username: username.clone(),
            room_id: self.room_id.clone(),
            content,
            date: self.ctx.now(),
        };
        let stored = self.ctx.store.write().await.insert_message(message).await;
        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("Failed to store message in {}: {}", self.room_id, e);
                session.outbox().error(ChatError::from(e).to_string());
                return;
            }
        };

        let line = format!("{} {}: {}", self.room_id, username, stored.content.as_str());
        let mut departed = Vec::new();
        for (member, handle) in &self.members {
            if member == &username {
                continue;
            }
            if handle.outbox().is_closed() {
                departed.push(member.clone());
                continue;
            }
            handle.outbox().notify(line.clone());
        }
        for member in departed {
            tracing::debug!("Evicting departed session of {} from {}", member, self.room_id);
            self.members.remove(&member);
        }

        session
            .outbox()
            .notify(format!("{} sent {}", self.room_id, stored.id));
    }

    async fn delete_message(
        &self,
        username: &Username,
        message_id: MessageId,
    ) -> Result<String, ChatError> {
        let found = self
            .ctx
            .store
            .read()
            .await
            .get_message(&self.room_id, message_id)
            .await;
        let message = match found {
            Ok(message) => message,
            Err(StoreError::NotFound) => return Err(ChatError::NoSuchMessage(message_id)),
            Err(e) => return Err(e.into()),
        };
        if &message.username != username && &self.owner != username {
            return Err(ChatError::NotAuthor(message_id));
        }

        let deleted = self
            .ctx
            .store
            .write()
            .await
            .delete_message(&self.room_id, message_id)
            .await?;
        if deleted == 0 {
            return Err(ChatError::NoSuchMessage(message_id));
        }
        Ok(format!("{} deleted {}", self.room_id, message_id))
    }

    async fn get_messages(&self, from: MessageId, to: MessageId, session: &SessionHandle) {
        let listed = self
            .ctx
            .store
            .read()
            .await
            .list_messages(&self.room_id, from, to, self.ctx.history_limit)
            .await;
        match listed {
            Ok(messages) => {
                for message in &messages {
                    session.outbox().notify(self.history_line(message));
                }
                session
                    .outbox()
                    .notify(format!("{} end of history", self.room_id));
            }
            Err(e) => self.reply(session, Err(e.into())),
        }
    }

    fn history_line(&self, message: &MessageRecord) -> String {
        format!(
            "{} {} {} {}: {}",
            self.room_id,
            message.id,
            timestamp_to_rfc3339(message.date.value()),
            message.username,
            message.content.as_str()
        )
    }

    fn close(&mut self) {
        let notice = format!("{} got deleted", self.room_id);
        for session in self.members.values() {
            session.outbox().notify(notice.clone());
            session.update(SessionUpdate::RoomClosed {
                room_id: self.room_id.clone(),
            });
        }
        self.members.clear();
    }

    fn reply(&self, session: &SessionHandle, result: Result<String, ChatError>) {
        match result {
            Ok(text) => session.outbox().notify(text),
            Err(e) => {
                if e.is_internal() {
                    tracing::error!("Request in {} failed: {:?}", self.room_id, e);
                }
                session.outbox().error(e.to_string());
            }
        }
    }
}
