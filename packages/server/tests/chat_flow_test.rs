//! End-to-end tests over real TCP connections.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use hiroba_server::{
    config::ServerConfig,
    domain::ChatStore,
    infrastructure::repository::{InMemoryChatStore, SqliteChatStore},
    ui::Server,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next line from the server, or `None` once the connection is closed
    async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        (read > 0).then(|| line.trim_end().to_string())
    }

    async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await.unwrap()
    }

    /// Write several lines in one write without waiting for replies
    async fn pipeline(&mut self, lines: &[&str]) {
        let batch: String = lines.iter().map(|line| format!("{line}\n")).collect();
        self.writer.write_all(batch.as_bytes()).await.unwrap();
    }

    /// Assert that nothing arrives within a short window
    async fn assert_silent(&mut self) {
        let mut line = String::new();
        let waited =
            tokio::time::timeout(Duration::from_millis(200), self.reader.read_line(&mut line))
                .await;
        assert!(waited.is_err(), "unexpected line: {line:?}");
    }
}

async fn start_server(store: Arc<dyn ChatStore>) -> SocketAddr {
    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let server = Server::bind(config, store).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run_until(std::future::pending()));
    addr
}

async fn register(addr: SocketAddr, username: &str) -> Client {
    let mut client = Client::connect(addr).await;
    assert_eq!(
        client.request(&format!("nu {username} {username} pw")).await,
        "n user created and logged in"
    );
    client
}

#[tokio::test]
async fn test_message_flow_between_members() {
    // テスト項目: メッセージは他のメンバーに 1 回ずつ届き、送信者には ack のみ返る
    // given (前提条件):
    let addr = start_server(Arc::new(InMemoryChatStore::new())).await;
    let mut alice = register(addr, "alice").await;
    assert_eq!(
        alice.request("nc lobby The Lobby chatpw").await,
        "n created lobby"
    );
    let mut bob = register(addr, "bob").await;
    assert_eq!(bob.request("jo lobby chatpw").await, "n joined lobby");
    let mut carol = register(addr, "carol").await;
    assert_eq!(carol.request("jo lobby chatpw").await, "n joined lobby");

    // when (操作):
    let ack = alice.request("nm lobby hello   everyone").await;

    // then (期待する結果):
    assert_eq!(ack, "n lobby sent 1");
    assert_eq!(bob.recv().await.unwrap(), "n lobby alice: hello everyone");
    assert_eq!(carol.recv().await.unwrap(), "n lobby alice: hello everyone");
    alice.assert_silent().await;
    bob.assert_silent().await;

    assert_eq!(
        bob.request("gu lobby").await,
        "n lobby users alice bob carol"
    );
    assert_eq!(bob.request("gc").await, "n chats lobby");
}

#[tokio::test]
async fn test_history_and_message_deletion() {
    // テスト項目: gm で履歴を取得し、dm で自分のメッセージを削除できる
    // given (前提条件):
    let addr = start_server(Arc::new(InMemoryChatStore::new())).await;
    let mut alice = register(addr, "alice").await;
    alice.request("nc lobby Lobby chatpw").await;
    alice.request("nm lobby first").await;
    alice.request("nm lobby second").await;

    // when (操作):
    let deleted = alice.request("dm lobby 1").await;
    alice.send("gm lobby 1 10").await;

    // then (期待する結果):
    assert_eq!(deleted, "n lobby deleted 1");
    let entry = alice.recv().await.unwrap();
    assert!(entry.starts_with("n lobby 2 "), "{entry}");
    assert!(entry.ends_with(" alice: second"), "{entry}");
    assert_eq!(alice.recv().await.unwrap(), "n lobby end of history");
}

#[tokio::test]
async fn test_delete_chat_evicts_members() {
    // テスト項目: オーナーの dc でメンバーが退出し、以降の nm は not joined になる
    // given (前提条件):
    let addr = start_server(Arc::new(InMemoryChatStore::new())).await;
    let mut alice = register(addr, "alice").await;
    alice.request("nc lobby Lobby chatpw").await;
    let mut bob = register(addr, "bob").await;
    bob.request("jo lobby chatpw").await;

    // when (操作): 非オーナーの dc は拒否される
    let rejected = bob.request("dc lobby chatpw").await;

    // then (期待する結果):
    assert_eq!(rejected, "e you are not the owner of lobby");

    // when (操作):
    alice.send("dc lobby chatpw").await;

    // then (期待する結果):
    let mut replies = vec![alice.recv().await.unwrap(), alice.recv().await.unwrap()];
    replies.sort();
    assert_eq!(replies, vec!["n deleted lobby", "n lobby got deleted"]);
    assert_eq!(bob.recv().await.unwrap(), "n lobby got deleted");
    assert_eq!(bob.request("nm lobby anyone?").await, "e not joined lobby");
    assert_eq!(bob.request("gc").await, "n chats");
}

#[tokio::test]
async fn test_account_deletion_rules() {
    // テスト項目: チャットを所有するユーザーは削除できず、所有しないユーザーは削除できる
    // given (前提条件):
    let addr = start_server(Arc::new(InMemoryChatStore::new())).await;
    let mut alice = register(addr, "alice").await;
    alice.request("nc lobby Lobby chatpw").await;
    let mut bob = register(addr, "bob").await;
    bob.request("jo lobby chatpw").await;
    bob.request("nm lobby so long").await;
    alice.recv().await.unwrap();

    // when (操作):
    let owner = alice.request("du pw").await;
    let wrong = bob.request("du nope").await;
    let member = bob.request("du pw").await;

    // then (期待する結果):
    assert_eq!(owner, "e you own at least one chat, delete it first");
    assert_eq!(wrong, "e wrong password");
    assert_eq!(member, "n user deleted");
    assert_eq!(bob.request("gc").await, "e log in first");
    assert_eq!(bob.request("li bob pw").await, "e no such user");

    alice.send("gm lobby 1 1").await;
    let entry = alice.recv().await.unwrap();
    assert!(entry.ends_with(" unknown: so long"), "{entry}");
    assert_eq!(alice.recv().await.unwrap(), "n lobby end of history");
    assert_eq!(alice.request("gu lobby").await, "n lobby users alice");
}

#[tokio::test]
async fn test_login_restores_memberships_after_restart() {
    // テスト項目: 再起動後のログインで永続化されたメンバーシップが復元される
    // given (前提条件):
    let store: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::in_memory().await.unwrap());
    let first = start_server(store.clone()).await;
    let mut alice = register(first, "alice").await;
    alice.request("nc lobby Lobby chatpw").await;
    alice.request("nc games Games chatpw").await;
    let mut bob = register(first, "bob").await;
    bob.request("jo games chatpw").await;
    assert_eq!(bob.request("qu").await, "q bye");
    assert_eq!(bob.recv().await, None);

    // when (操作): 同じストアで新しいサーバーを起動する
    let second = start_server(store).await;
    let mut bob = Client::connect(second).await;
    let login = bob.request("li bob pw").await;

    // then (期待する結果):
    assert_eq!(login, "n connected");
    assert_eq!(bob.request("gc").await, "n chats games");
    assert_eq!(bob.request("gu games").await, "n games users bob");
    assert_eq!(bob.request("gu lobby").await, "e not joined lobby");
}

#[tokio::test]
async fn test_duplicate_login_is_rejected() {
    // テスト項目: 同じユーザーは 1 つの接続でしかログインできない
    // given (前提条件):
    let addr = start_server(Arc::new(InMemoryChatStore::new())).await;
    let mut alice = register(addr, "alice").await;
    let mut second = Client::connect(addr).await;

    // when (操作):
    let rejected = second.request("li alice pw").await;

    // then (期待する結果):
    assert_eq!(rejected, "e already logged in");

    // when (操作): 最初の接続が切断されると再ログインできる
    alice.writer.shutdown().await.unwrap();
    assert_eq!(alice.recv().await, None);
    let mut accepted = second.request("li alice pw").await;
    for _ in 0..50 {
        if accepted == "n connected" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        accepted = second.request("li alice pw").await;
    }

    // then (期待する結果):
    assert_eq!(accepted, "n connected");
}

#[tokio::test]
async fn test_pipelined_commands_keep_session_state_consistent() {
    // テスト項目: 返信を待たずに送ったコマンドも、送った順に状態へ反映される
    // given (前提条件):
    let addr = start_server(Arc::new(InMemoryChatStore::new())).await;
    let mut alice = register(addr, "alice").await;
    let mut bob = register(addr, "bob").await;

    // when (操作):
    alice
        .pipeline(&["nc lobby Lobby chatpw", "nm lobby first"])
        .await;
    let created = alice.recv().await.unwrap();
    let sent = alice.recv().await.unwrap();
    bob.pipeline(&["jo lobby chatpw", "lo", "li bob pw", "gc", "qu"])
        .await;

    // then (期待する結果):
    assert_eq!(created, "n created lobby");
    assert_eq!(sent, "n lobby sent 1");
    assert_eq!(bob.recv().await.unwrap(), "n joined lobby");
    assert_eq!(bob.recv().await.unwrap(), "n logged out");
    assert_eq!(bob.recv().await.unwrap(), "n connected");
    assert_eq!(bob.recv().await.unwrap(), "n chats lobby");
    assert_eq!(bob.recv().await.unwrap(), "q bye");
    assert_eq!(bob.recv().await, None);

    // then (期待する結果): 切断済みの bob はルームに残らず、再ログインできる
    assert_eq!(alice.request("gu lobby").await, "n lobby users alice");
    alice.assert_silent().await;
    let mut again = Client::connect(addr).await;
    assert_eq!(again.request("li bob pw").await, "n connected");
}
