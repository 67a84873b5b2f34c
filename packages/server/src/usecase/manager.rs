//! UseCase: サーバーマネージャーアクター
//!
//! チャットディレクトリ（チャット ID → ルームアクター）とオンライン表
//! （ユーザー名 → セッション ID）を所有する単一タスク。
//! アカウントとチャットのライフサイクル要求を到着順に処理し、
//! 各要求にちょうど 1 つの返信を返す。
//!
//! ## テスト観点
//! - 正常系：ログイン時の参加チャット復元、nc の自動参加
//! - 異常系：二重ログイン、オーナーの退出・アカウント削除、ストレージ障害
//! - エッジケース：処理中の jo と競合するサインオフ、作成者の参加に失敗した nc

use std::collections::{HashMap, HashSet};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::domain::{DisplayName, RoomId, RoomRecord, StoreError, UserRecord, Username};

use super::{
    context::ChatContext,
    error::ChatError,
    room::{RoomActor, RoomHandle, RoomRequest},
    session_handle::{SessionHandle, SessionId, SessionUpdate},
};

/// マネージャーが処理する要求
#[derive(Debug)]
pub enum ManagerRequest {
    Login {
        username: Username,
        password: String,
        session: SessionHandle,
    },
    NewUser {
        username: Username,
        name: DisplayName,
        password: String,
        session: SessionHandle,
    },
    /// 内部用: セッションのログアウト、終了、切断
    SignOff { session_id: SessionId },
    DeleteUser {
        username: Username,
        password: String,
        session: SessionHandle,
    },
    Join {
        username: Username,
        room_id: RoomId,
        password: String,
        session: SessionHandle,
    },
    Leave {
        username: Username,
        room_id: RoomId,
        session: SessionHandle,
    },
    NewChat {
        username: Username,
        room_id: RoomId,
        name: DisplayName,
        password: String,
        session: SessionHandle,
    },
    DeleteChat {
        username: Username,
        room_id: RoomId,
        password: String,
        session: SessionHandle,
    },
    GetChats {
        username: Username,
        session: SessionHandle,
    },
}

impl ManagerRequest {
    fn session(&self) -> Option<&SessionHandle> {
        match self {
            Self::Login { session, .. }
            | Self::NewUser { session, .. }
            | Self::DeleteUser { session, .. }
            | Self::Join { session, .. }
            | Self::Leave { session, .. }
            | Self::NewChat { session, .. }
            | Self::DeleteChat { session, .. }
            | Self::GetChats { session, .. } => Some(session),
            Self::SignOff { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Envelope {
    request: ManagerRequest,
    done: Option<oneshot::Sender<()>>,
}

/// マネージャーキューの送信側
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    sender: mpsc::UnboundedSender<Envelope>,
}

impl ManagerHandle {
    /// 要求を積む。マネージャーが停止していれば要求元にその旨を返す
    pub fn send(&self, request: ManagerRequest) {
        self.enqueue(request, None);
    }

    /// 要求を積み、マネージャーが処理し終えるまで待つ
    ///
    /// 戻った時点で、その要求に対する返信とセッション更新はキューに積まれている。
    pub async fn call(&self, request: ManagerRequest) {
        let (done, handled) = oneshot::channel();
        if self.enqueue(request, Some(done)) && handled.await.is_err() {
            tracing::warn!("Manager stopped before handling the request");
        }
    }

    fn enqueue(&self, request: ManagerRequest, done: Option<oneshot::Sender<()>>) -> bool {
        match self.sender.send(Envelope { request, done }) {
            Ok(()) => true,
            Err(mpsc::error::SendError(envelope)) => {
                tracing::warn!("Manager stopped, rejecting request");
                if let Some(session) = envelope.request.session() {
                    session.outbox().error(ChatError::Unavailable.to_string());
                }
                false
            }
        }
    }
}

/// 認証済みセッションと、それが接続しているライブなルーム
#[derive(Debug)]
struct Presence {
    username: Username,
    rooms: HashSet<RoomId>,
}

pub struct ServerManager {
    ctx: ChatContext,
    rooms: HashMap<RoomId, RoomHandle>,
    online: HashMap<Username, SessionId>,
    presence: HashMap<SessionId, Presence>,
    requests: mpsc::UnboundedReceiver<Envelope>,
}

impl ServerManager {
    /// 永続化された各チャットのルームアクターを起動し、続いてマネージャー自身を起動
    pub async fn start(ctx: ChatContext) -> Result<(ManagerHandle, JoinHandle<()>), StoreError> {
        let records = ctx.store.read().await.list_rooms().await?;
        let mut rooms = HashMap::with_capacity(records.len());
        for record in &records {
            let (handle, _task) = RoomActor::spawn(record, ctx.clone());
            rooms.insert(record.room_id.clone(), handle);
        }
        tracing::info!("Loaded {} chats", rooms.len());

        let (sender, requests) = mpsc::unbounded_channel();
        let manager = Self {
            ctx,
            rooms,
            online: HashMap::new(),
            presence: HashMap::new(),
            requests,
        };
        Ok((ManagerHandle { sender }, tokio::spawn(manager.run())))
    }

    async fn run(mut self) {
        while let Some(Envelope { request, done }) = self.requests.recv().await {
            self.handle(request).await;
            if let Some(done) = done {
                // 呼び出し元はすでに終了している場合がある
                let _ = done.send(());
            }
        }
        tracing::info!("Manager stopped");
    }

    async fn handle(&mut self, request: ManagerRequest) {
        let (session, result) = match request {
            ManagerRequest::SignOff { session_id } => {
                self.sign_off(session_id);
                return;
            }
            ManagerRequest::Login {
                username,
                password,
                session,
            } => {
                let result = self.login(username, &password, &session).await;
                (session, result)
            }
            ManagerRequest::NewUser {
                username,
                name,
                password,
                session,
            } => {
                let result = self.new_user(username, name, &password, &session).await;
                (session, result)
            }
            ManagerRequest::DeleteUser {
                username,
                password,
                session,
            } => {
                let result = self.delete_user(&username, &password, &session).await;
                (session, result)
            }
            ManagerRequest::Join {
                username,
                room_id,
                password,
                session,
            } => {
                let result = self.join(&username, room_id, &password, &session).await;
                (session, result)
            }
            ManagerRequest::Leave {
                username,
                room_id,
                session,
            } => {
                let result = self.leave(&username, room_id, &session).await;
                (session, result)
            }
            ManagerRequest::NewChat {
                username,
                room_id,
                name,
                password,
                session,
            } => {
                let result = self
                    .new_chat(username, room_id, name, &password, &session)
                    .await;
                (session, result)
            }
            ManagerRequest::DeleteChat {
                username,
                room_id,
                password,
                session,
            } => {
                let result = self
                    .delete_chat(&username, room_id, &password, &session)
                    .await;
                (session, result)
            }
            ManagerRequest::GetChats { username, session } => {
                let result = self.get_chats(&username, &session).await;
                (session, result)
            }
        };

        match result {
            Ok(text) => session.outbox().notify(text),
            Err(e) => {
                if e.is_internal() {
                    tracing::error!("Manager request failed: {:?}", e);
                }
                session.outbox().error(e.to_string());
            }
        }
    }

    async fn login(
        &mut self,
        username: Username,
        password: &str,
        session: &SessionHandle,
    ) -> Result<String, ChatError> {
        let user = self.find_user(&username).await?;
        if !user.verify_password(password) {
            return Err(ChatError::WrongPassword);
        }
        if self.online.contains_key(&username) {
            return Err(ChatError::AlreadyOnline);
        }

        let joined = self
            .ctx
            .store
            .read()
            .await
            .list_memberships_for(&username)
            .await?;
        self.sign_in(&username, session);
        let mut rooms = Vec::with_capacity(joined.len());
        for room_id in joined {
            match self.rooms.get(&room_id).cloned() {
                Some(room) => {
                    self.attach(&room_id, &room, &username, session);
                    rooms.push((room_id, room));
                }
                None => tracing::warn!("{} is a member of unknown chat {}", username, room_id),
            }
        }

        tracing::info!("{} logged in ({} chats)", username, rooms.len());
        session.update(SessionUpdate::Authenticated {
            username,
            name: user.name,
            rooms,
        });
        Ok("connected".to_string())
    }

    async fn new_user(
        &mut self,
        username: Username,
        name: DisplayName,
        password: &str,
        session: &SessionHandle,
    ) -> Result<String, ChatError> {
        let user = UserRecord::register(username.clone(), name.clone(), password, self.ctx.now());
        let inserted = self.ctx.store.write().await.insert_user(user).await;
        match inserted {
            Ok(()) => {}
            Err(StoreError::Conflict) => return Err(ChatError::UsernameTaken),
            Err(e) => return Err(e.into()),
        }

        self.sign_in(&username, session);
        tracing::info!("{} registered", username);
        session.update(SessionUpdate::Authenticated {
            username,
            name,
            rooms: Vec::new(),
        });
        Ok("user created and logged in".to_string())
    }

    fn sign_in(&mut self, username: &Username, session: &SessionHandle) {
        self.online.insert(username.clone(), session.id());
        self.presence.insert(
            session.id(),
            Presence {
                username: username.clone(),
                rooms: HashSet::new(),
            },
        );
    }

    /// オンライン表のエントリを解放し、接続中の全ルームから切り離す
    ///
    /// 未認証のセッションや、すでにサインオフ済みのセッションでは何もしない。
    fn sign_off(&mut self, session_id: SessionId) {
        let Some(presence) = self.presence.remove(&session_id) else {
            return;
        };
        for room_id in &presence.rooms {
            if let Some(room) = self.rooms.get(room_id) {
                room.quit(presence.username.clone(), session_id);
            }
        }
        if self.online.get(&presence.username) == Some(&session_id) {
            self.online.remove(&presence.username);
        }
        tracing::info!("{} signed off", presence.username);
    }

    /// リクエスト元のセッションが `username` としてサインイン中であることを確認
    fn ensure_signed_in(
        &self,
        username: &Username,
        session: &SessionHandle,
    ) -> Result<(), ChatError> {
        match self.presence.get(&session.id()) {
            Some(presence) if &presence.username == username => Ok(()),
            _ => Err(ChatError::NotSignedIn),
        }
    }

    fn attach(
        &mut self,
        room_id: &RoomId,
        room: &RoomHandle,
        username: &Username,
        session: &SessionHandle,
    ) {
        room.attach(username.clone(), session.clone());
        if let Some(presence) = self.presence.get_mut(&session.id()) {
            presence.rooms.insert(room_id.clone());
        }
    }

    fn detach(&mut self, room_id: &RoomId, username: &Username, session_id: SessionId) {
        if let Some(room) = self.rooms.get(room_id) {
            room.quit(username.clone(), session_id);
        }
        if let Some(presence) = self.presence.get_mut(&session_id) {
            presence.rooms.remove(room_id);
        }
    }

    async fn delete_user(
        &mut self,
        username: &Username,
        password: &str,
        session: &SessionHandle,
    ) -> Result<String, ChatError> {
        self.ensure_signed_in(username, session)?;
        let user = self.find_user(username).await?;
        if !user.verify_password(password) {
            return Err(ChatError::WrongPassword);
        }

        let deleted = self.ctx.store.write().await.delete_user(username).await;
        match deleted {
            Ok(0) | Err(StoreError::NotFound) => return Err(ChatError::NoSuchUser),
            Ok(_) => {}
            Err(StoreError::Constraint(_)) => return Err(ChatError::OwnsChats),
            Err(e) => return Err(e.into()),
        }

        self.sign_off(session.id());
        session.update(SessionUpdate::SignedOut);
        tracing::info!("{} deleted their account", username);
        Ok("user deleted".to_string())
    }

    async fn join(
        &mut self,
        username: &Username,
        room_id: RoomId,
        password: &str,
        session: &SessionHandle,
    ) -> Result<String, ChatError> {
        self.ensure_signed_in(username, session)?;
        let room = self.find_room(&room_id).await?;
        if !room.verify_password(password) {
            return Err(ChatError::WrongChatPassword);
        }
        self.add_member(username, &room_id, session).await?;
        Ok(format!("joined {room_id}"))
    }

    /// メンバーシップを永続化し、ライブなルームにセッションを接続
    async fn add_member(
        &mut self,
        username: &Username,
        room_id: &RoomId,
        session: &SessionHandle,
    ) -> Result<(), ChatError> {
        let room = self
            .rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| ChatError::NoSuchChat(room_id.clone()))?;

        let inserted = self
            .ctx
            .store
            .write()
            .await
            .insert_membership(username, room_id)
            .await;
        match inserted {
            Ok(0) => return Err(ChatError::AlreadyJoined(room_id.clone())),
            Ok(_) => {}
            Err(StoreError::Constraint(_)) => return Err(ChatError::NoSuchChat(room_id.clone())),
            Err(e) => return Err(e.into()),
        }

        self.attach(room_id, &room, username, session);
        session.update(SessionUpdate::Joined {
            room_id: room_id.clone(),
            room,
        });
        tracing::info!("{} joined {}", username, room_id);
        Ok(())
    }

    async fn leave(
        &mut self,
        username: &Username,
        room_id: RoomId,
        session: &SessionHandle,
    ) -> Result<String, ChatError> {
        self.ensure_signed_in(username, session)?;
        let room = self.find_room(&room_id).await?;
        if room.is_owned_by(username) {
            return Err(ChatError::OwnerCannotLeave(room_id));
        }

        let deleted = self
            .ctx
            .store
            .write()
            .await
            .delete_membership(username, &room_id)
            .await?;
        if deleted == 0 {
            return Err(ChatError::NotMember(room_id));
        }

        self.detach(&room_id, username, session.id());
        session.update(SessionUpdate::Left {
            room_id: room_id.clone(),
        });
        tracing::info!("{} left {}", username, room_id);
        Ok(format!("left {room_id}"))
    }

    async fn new_chat(
        &mut self,
        username: Username,
        room_id: RoomId,
        name: DisplayName,
        password: &str,
        session: &SessionHandle,
    ) -> Result<String, ChatError> {
        self.ensure_signed_in(&username, session)?;
        let record = RoomRecord::create(
            room_id.clone(),
            name,
            password,
            username.clone(),
            self.ctx.now(),
        );
        let inserted = self.ctx.store.write().await.insert_room(record.clone()).await;
        match inserted {
            Ok(()) => {}
            Err(StoreError::Conflict) => return Err(ChatError::ChatIdTaken),
            Err(StoreError::Constraint(_)) => return Err(ChatError::NoSuchUser),
            Err(e) => return Err(e.into()),
        }

        let (room, _task) = RoomActor::spawn(&record, self.ctx.clone());
        self.rooms.insert(room_id.clone(), room);
        tracing::info!("{} created {}", username, room_id);

        if let Err(e) = self.add_member(&username, &room_id, session).await {
            self.discard_room(&room_id, &username).await;
            return Err(e);
        }
        Ok(format!("created {room_id}"))
    }

    /// 作成者の参加に失敗したチャットを取り消す
    async fn discard_room(&mut self, room_id: &RoomId, owner: &Username) {
        if let Some(room) = self.rooms.remove(room_id) {
            // まだ誰も接続していないので、アクターを停止するだけ
            if room.send(RoomRequest::DeleteChat).is_err() {
                tracing::warn!("Chat {} was already stopped", room_id);
            }
        }
        let deleted = self.ctx.store.write().await.delete_room(room_id, owner).await;
        match deleted {
            Ok(_) => tracing::warn!("Discarded chat {} after a failed join", room_id),
            Err(e) => tracing::error!("Failed to discard chat {}: {:?}", room_id, e),
        }
    }

    async fn delete_chat(
        &mut self,
        username: &Username,
        room_id: RoomId,
        password: &str,
        session: &SessionHandle,
    ) -> Result<String, ChatError> {
        self.ensure_signed_in(username, session)?;
        let room = self.find_room(&room_id).await?;
        if !room.is_owned_by(username) {
            return Err(ChatError::NotOwner(room_id));
        }
        if !room.verify_password(password) {
            return Err(ChatError::WrongChatPassword);
        }

        let deleted = self
            .ctx
            .store
            .write()
            .await
            .delete_room(&room_id, username)
            .await?;
        if deleted == 0 {
            return Err(ChatError::NotOwner(room_id));
        }

        if let Some(room) = self.rooms.remove(&room_id) {
            if room.send(RoomRequest::DeleteChat).is_err() {
                tracing::warn!("Chat {} was already stopped", room_id);
            }
        }
        for presence in self.presence.values_mut() {
            presence.rooms.remove(&room_id);
        }
        tracing::info!("{} deleted {}", username, room_id);
        Ok(format!("deleted {room_id}"))
    }

    async fn get_chats(
        &self,
        username: &Username,
        session: &SessionHandle,
    ) -> Result<String, ChatError> {
        self.ensure_signed_in(username, session)?;
        let joined = self
            .ctx
            .store
            .read()
            .await
            .list_memberships_for(username)
            .await?;
        let ids: String = joined.iter().map(|room_id| format!(" {room_id}")).collect();
        Ok(format!("chats{ids}"))
    }

    async fn find_user(&self, username: &Username) -> Result<UserRecord, ChatError> {
        let found = self.ctx.store.read().await.get_user(username).await;
        match found {
            Ok(user) => Ok(user),
            Err(StoreError::NotFound) => Err(ChatError::NoSuchUser),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_room(&self, room_id: &RoomId) -> Result<RoomRecord, ChatError> {
        let found = self.ctx.store.read().await.get_room(room_id).await;
        match found {
            Ok(room) => Ok(room),
            Err(StoreError::NotFound) => Err(ChatError::NoSuchChat(room_id.clone())),
            Err(e) => Err(e.into()),
        }
    }
}
