//! Connection session: one inbound task and one outbound writer per client.
//!
//! The inbound side reads lines, gates them on the login state and routes the
//! resulting requests to the manager or to a joined room. Manager requests are
//! awaited, so the state changes they cause are already on the control queue
//! and get applied before the next line is read.

use std::{collections::HashMap, ops::ControlFlow};

use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    domain::{DisplayName, RoomId, Username},
    infrastructure::{
        dto::wire::{ClientRequest, Message, Phase, ProtocolError, tokenize},
        message_pusher::outbox,
    },
    usecase::{
        ManagerHandle, ManagerRequest, RoomHandle, RoomRequest, SessionHandle, SessionUpdate,
    },
};

/// Maximum accepted line length in bytes
pub const MAX_LINE_LENGTH: usize = 4096;

/// Why the inbound loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The client sent `qu`
    Quit,
    /// EOF or read error
    Disconnected,
    /// The writer stopped (write error)
    WriterStopped,
}

struct Account {
    username: Username,
    name: DisplayName,
}

struct Session {
    handle: SessionHandle,
    manager: ManagerHandle,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
    account: Option<Account>,
    rooms: HashMap<RoomId, RoomHandle>,
}

/// Serve one client until it quits or disconnects
pub async fn serve_connection<S>(stream: S, manager: ManagerHandle, outbox_capacity: usize)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("session", id = %session_id);
    run_session(session_id, stream, manager, outbox_capacity)
        .instrument(span)
        .await;
}

async fn run_session<S>(session_id: Uuid, stream: S, manager: ManagerHandle, outbox_capacity: usize)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (sink, mut lines) = framed.split();

    let (outbox, outbound) = outbox(outbox_capacity);
    let (control, updates) = mpsc::unbounded_channel();
    let mut session = Session {
        handle: SessionHandle::new(session_id, outbox, control),
        manager,
        updates,
        account: None,
        rooms: HashMap::new(),
    };
    let mut writer = writer_loop(outbound, sink);
    tracing::info!("Session started");

    let exit = tokio::select! {
        exit = session.read_loop(&mut lines) => exit,
        _ = &mut writer => Exit::WriterStopped,
    };

    session.sign_off().await;
    match exit {
        Exit::Quit => {
            session.handle.outbox().deliver(Message::quit("bye"));
            if let Err(e) = writer.await {
                tracing::warn!("Writer task failed: {}", e);
            }
        }
        Exit::Disconnected => writer.abort(),
        Exit::WriterStopped => {}
    }
    tracing::info!("Session ended ({:?})", exit);
}

/// Write queued messages to the socket; stop after `q` or on write error
fn writer_loop<S>(
    mut outbound: mpsc::Receiver<Message>,
    mut sink: SplitSink<Framed<S, LinesCodec>, String>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            while let Some(message) = outbound.recv().await {
                let quit = message.is_quit();
                if let Err(e) = sink.send(message.to_string()).await {
                    tracing::warn!("Failed to write to client: {}", e);
                    break;
                }
                if quit {
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("Failed to close connection: {}", e);
            }
        }
        .in_current_span(),
    )
}

impl Session {
    async fn read_loop<St>(&mut self, lines: &mut St) -> Exit
    where
        St: Stream<Item = Result<String, LinesCodecError>> + Unpin,
    {
        // The codec yields one `None` right after a decode error before resuming
        let mut recovering = false;
        loop {
            tokio::select! {
                biased;

                Some(update) = self.updates.recv() => self.apply(update),
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        recovering = false;
                        if self.dispatch(&line).await.is_break() {
                            return Exit::Quit;
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        recovering = true;
                        self.handle
                            .outbox()
                            .error(format!("line longer than {MAX_LINE_LENGTH} bytes"));
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        tracing::warn!("Read error: {}", e);
                        return Exit::Disconnected;
                    }
                    None if recovering => recovering = false,
                    None => return Exit::Disconnected,
                },
            }
        }
    }

    fn apply(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Authenticated {
                username,
                name,
                rooms,
            } => {
                tracing::info!("Authenticated as {} ({})", username, name.as_str());
                self.account = Some(Account { username, name });
                self.rooms = rooms.into_iter().collect();
            }
            SessionUpdate::Joined { room_id, room } => {
                if self.account.is_some() {
                    self.rooms.insert(room_id, room);
                }
            }
            SessionUpdate::Left { room_id } | SessionUpdate::RoomClosed { room_id } => {
                self.rooms.remove(&room_id);
            }
            SessionUpdate::SignedOut => {
                self.account = None;
                self.rooms.clear();
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> ControlFlow<()> {
        let raw = match tokenize(line) {
            Ok(Some(raw)) => raw,
            Ok(None) => return ControlFlow::Continue(()),
            Err(e) => {
                self.reject(e);
                return ControlFlow::Continue(());
            }
        };

        let gate = match (raw.command.phase(), self.account.is_some()) {
            (Phase::Unauthenticated, true) => Err(ProtocolError::AlreadyLoggedIn),
            (Phase::Authenticated, false) => Err(ProtocolError::NotLoggedIn),
            _ => Ok(()),
        };
        let request = match gate.and_then(|()| raw.into_request()) {
            Ok(request) => request,
            Err(e) => {
                self.reject(e);
                return ControlFlow::Continue(());
            }
        };
        self.route(request).await
    }

    async fn route(&mut self, request: ClientRequest) -> ControlFlow<()> {
        let session = self.handle.clone();
        match request {
            ClientRequest::Quit => return ControlFlow::Break(()),
            ClientRequest::Login { username, password } => {
                self.manager
                    .call(ManagerRequest::Login {
                        username,
                        password,
                        session,
                    })
                    .await;
            }
            ClientRequest::NewUser {
                username,
                name,
                password,
            } => {
                self.manager
                    .call(ManagerRequest::NewUser {
                        username,
                        name,
                        password,
                        session,
                    })
                    .await;
            }
            ClientRequest::Logout => {
                self.sign_off().await;
                self.handle.outbox().notify("logged out");
            }
            other => {
                let Some(username) = self.username() else {
                    self.reject(ProtocolError::NotLoggedIn);
                    return ControlFlow::Continue(());
                };
                self.route_authenticated(username, other, session).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn route_authenticated(
        &mut self,
        username: Username,
        request: ClientRequest,
        session: SessionHandle,
    ) {
        let request = match request {
            ClientRequest::DeleteUser { password } => ManagerRequest::DeleteUser {
                username,
                password,
                session,
            },
            ClientRequest::Join { room_id, password } => ManagerRequest::Join {
                username,
                room_id,
                password,
                session,
            },
            ClientRequest::Leave { room_id } => ManagerRequest::Leave {
                username,
                room_id,
                session,
            },
            ClientRequest::NewChat {
                room_id,
                name,
                password,
            } => ManagerRequest::NewChat {
                username,
                room_id,
                name,
                password,
                session,
            },
            ClientRequest::DeleteChat { room_id, password } => ManagerRequest::DeleteChat {
                username,
                room_id,
                password,
                session,
            },
            ClientRequest::GetChats => ManagerRequest::GetChats { username, session },
            ClientRequest::NewMessage { room_id, content } => {
                let request = RoomRequest::NewMessage {
                    username,
                    content,
                    session,
                };
                self.send_to_room(room_id, request);
                return;
            }
            ClientRequest::DeleteMessage {
                room_id,
                message_id,
            } => {
                let request = RoomRequest::DeleteMessage {
                    username,
                    message_id,
                    session,
                };
                self.send_to_room(room_id, request);
                return;
            }
            ClientRequest::GetMessages { room_id, from, to } => {
                self.send_to_room(room_id, RoomRequest::GetMessages { from, to, session });
                return;
            }
            ClientRequest::GetUsers { room_id } => {
                self.send_to_room(room_id, RoomRequest::GetUsers { session });
                return;
            }
            ClientRequest::Quit
            | ClientRequest::Logout
            | ClientRequest::Login { .. }
            | ClientRequest::NewUser { .. } => return,
        };
        self.manager.call(request).await;
    }

    fn send_to_room(&mut self, room_id: RoomId, request: RoomRequest) {
        let sent = match self.rooms.get(&room_id) {
            Some(room) => room.send(request).is_ok(),
            None => false,
        };
        if !sent {
            self.rooms.remove(&room_id);
            self.reject(ProtocolError::NotJoined(room_id));
        }
    }

    /// Release whatever the manager holds for this connection.
    ///
    /// Sent even when no login is known locally: the manager keys the release
    /// on the session id and detaches it from every room it attached.
    async fn sign_off(&mut self) {
        self.account = None;
        self.rooms.clear();
        self.manager
            .call(ManagerRequest::SignOff {
                session_id: self.handle.id(),
            })
            .await;
    }

    fn username(&self) -> Option<Username> {
        self.account.as_ref().map(|account| account.username.clone())
    }

    fn reject(&self, error: ProtocolError) {
        tracing::debug!("Rejected line: {}", error);
        self.handle.outbox().error(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;
    use crate::{
        infrastructure::repository::InMemoryChatStore,
        usecase::{ChatContext, ServerManager},
    };

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            let mut line = String::new();
            let read = tokio::time::timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a line")
                .unwrap();
            (read > 0).then(|| line.trim_end().to_string())
        }

        async fn request(&mut self, line: &str) -> String {
            self.send(line).await;
            self.recv().await.unwrap()
        }

        /// Write several lines in a single write, without waiting for replies
        async fn pipeline(&mut self, lines: &[&str]) {
            let batch: String = lines.iter().map(|line| format!("{line}\n")).collect();
            self.writer.write_all(batch.as_bytes()).await.unwrap();
        }

        async fn assert_silent(&mut self) {
            let mut line = String::new();
            let waited =
                tokio::time::timeout(Duration::from_millis(200), self.reader.read_line(&mut line))
                    .await;
            assert!(waited.is_err(), "unexpected line: {line:?}");
        }
    }

    async fn connect(manager: &ManagerHandle) -> (Client, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(8 * 1024);
        let task = tokio::spawn(serve_connection(server, manager.clone(), 64));
        let (reader, writer) = tokio::io::split(client);
        (
            Client {
                reader: BufReader::new(reader),
                writer,
            },
            task,
        )
    }

    async fn manager() -> ManagerHandle {
        let ctx = ChatContext::new(Arc::new(InMemoryChatStore::new()));
        let (manager, _task) = ServerManager::start(ctx).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_commands_are_gated_by_login_state() {
        // テスト項目: 未ログイン時とログイン後で受け付けるコマンドが異なる
        // given (前提条件):
        let manager = manager().await;
        let (mut client, _task) = connect(&manager).await;

        // when (操作) / then (期待する結果):
        assert_eq!(client.request("jo lobby pw").await, "e log in first");
        assert_eq!(client.request("xx").await, "e unknown command xx");
        assert_eq!(
            client.request("nu alice Alice Liddell pw").await,
            "n user created and logged in"
        );
        assert_eq!(client.request("li alice pw").await, "e already logged in");
        assert_eq!(client.request("le").await, "e usage: le <chat id>");
    }

    #[tokio::test]
    async fn test_blank_lines_are_ignored() {
        // テスト項目: 空行は無視される
        let manager = manager().await;
        let (mut client, _task) = connect(&manager).await;

        client.send("").await;
        client.send("   ").await;

        assert_eq!(client.request("gc").await, "e log in first");
    }

    #[tokio::test]
    async fn test_in_room_command_requires_joined_room() {
        // テスト項目: 未参加のチャットへの in-room コマンドは not joined になる
        // given (前提条件):
        let manager = manager().await;
        let (mut client, _task) = connect(&manager).await;
        client.request("nu alice Alice pw").await;

        // when (操作):
        let reply = client.request("nm lobby hello").await;

        // then (期待する結果):
        assert_eq!(reply, "e not joined lobby");
    }

    #[tokio::test]
    async fn test_quit_sends_bye_and_closes() {
        // テスト項目: qu で q bye を受け取り接続が閉じる
        // given (前提条件):
        let manager = manager().await;
        let (mut client, task) = connect(&manager).await;
        client.request("nu alice Alice pw").await;

        // when (操作):
        let reply = client.request("qu").await;

        // then (期待する結果):
        assert_eq!(reply, "q bye");
        assert_eq!(client.recv().await, None);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        // then (期待する結果): サインオフ済みなので再ログインできる
        let (mut again, _task) = connect(&manager).await;
        assert_eq!(again.request("li alice pw").await, "n connected");
    }

    #[tokio::test]
    async fn test_logout_returns_to_unauthenticated() {
        // テスト項目: lo の後は未ログイン状態に戻り、再ログインできる
        // given (前提条件):
        let manager = manager().await;
        let (mut client, _task) = connect(&manager).await;
        client.request("nu alice Alice pw").await;
        client.request("nc lobby Lobby chatpw").await;

        // when (操作):
        let reply = client.request("lo").await;

        // then (期待する結果):
        assert_eq!(reply, "n logged out");
        assert_eq!(client.request("gu lobby").await, "e log in first");
        assert_eq!(client.request("li alice pw").await, "n connected");
        assert_eq!(client.request("gu lobby").await, "n lobby users alice");
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected() {
        // テスト項目: 上限を超える行はエラーになり、接続は継続する
        // given (前提条件):
        let manager = manager().await;
        let (mut client, _task) = connect(&manager).await;
        let long = "x".repeat(MAX_LINE_LENGTH + 1);

        // when (操作):
        let reply = client.request(&long).await;

        // then (期待する結果):
        assert_eq!(reply, "e line longer than 4096 bytes");
        assert_eq!(client.request("gc").await, "e log in first");
    }

    #[tokio::test]
    async fn test_pipelined_login_and_quit_releases_login() {
        // テスト項目: li と qu を続けて送っても、ログインは解放され再ログインできる
        // given (前提条件):
        let manager = manager().await;
        let (mut first, task) = connect(&manager).await;
        first.request("nu alice Alice pw").await;
        first.request("lo").await;

        // when (操作):
        first.pipeline(&["li alice pw", "qu"]).await;

        // then (期待する結果):
        assert_eq!(first.recv().await.unwrap(), "n connected");
        assert_eq!(first.recv().await.unwrap(), "q bye");
        assert_eq!(first.recv().await, None);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        let (mut again, _task) = connect(&manager).await;
        assert_eq!(again.request("li alice pw").await, "n connected");
    }

    #[tokio::test]
    async fn test_disconnect_right_after_login_releases_login() {
        // テスト項目: li 直後に切断しても、オンライン表にエントリが残らない
        // given (前提条件):
        let manager = manager().await;
        let (mut first, task) = connect(&manager).await;
        first.request("nu alice Alice pw").await;
        first.request("lo").await;

        // when (操作):
        first.pipeline(&["li alice pw"]).await;
        first.writer.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        // then (期待する結果):
        let (mut again, _task) = connect(&manager).await;
        assert_eq!(again.request("li alice pw").await, "n connected");
    }

    #[tokio::test]
    async fn test_pipelined_join_and_logout_leaves_no_live_entry() {
        // テスト項目: jo と lo を続けて送ると、ログアウト後はルームのメッセージを受け取らない
        // given (前提条件):
        let manager = manager().await;
        let (mut alice, _alice_task) = connect(&manager).await;
        alice.request("nu alice Alice pw").await;
        alice.request("nc lobby Lobby chatpw").await;
        let (mut bob, _bob_task) = connect(&manager).await;
        bob.request("nu bob Bob pw").await;

        // when (操作):
        bob.pipeline(&["jo lobby chatpw", "lo"]).await;

        // then (期待する結果):
        assert_eq!(bob.recv().await.unwrap(), "n joined lobby");
        assert_eq!(bob.recv().await.unwrap(), "n logged out");
        assert_eq!(alice.request("gu lobby").await, "n lobby users alice");
        assert_eq!(alice.request("nm lobby private").await, "n lobby sent 1");
        bob.assert_silent().await;
    }

    #[tokio::test]
    async fn test_pipelined_new_chat_and_message() {
        // テスト項目: nc の直後の nm は作成したチャットに届く
        // given (前提条件):
        let manager = manager().await;
        let (mut client, _task) = connect(&manager).await;

        // when (操作):
        client
            .pipeline(&["nu alice Alice pw", "nc lobby Lobby chatpw", "nm lobby first"])
            .await;

        // then (期待する結果):
        assert_eq!(client.recv().await.unwrap(), "n user created and logged in");
        assert_eq!(client.recv().await.unwrap(), "n created lobby");
        assert_eq!(client.recv().await.unwrap(), "n lobby sent 1");
    }
}
