//! セッションごとの有界な送信キュー
//!
//! アクターはセッションを待たず `try_send` で積む。遅い、または切断済みの
//! クライアントが失うのは自分宛てのメッセージだけ。受信側はセッションの
//! writer タスクが取り出す。

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::infrastructure::dto::wire::Message;

/// セッションごとにバッファするメッセージ数の既定値
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessagePushError {
    /// セッションがキューを十分に速く取り出していない
    #[error("outbox full")]
    Full,

    /// セッションの writer が停止している
    #[error("outbox closed")]
    Closed,
}

/// セッションの送信キューの送信側
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: mpsc::Sender<Message>,
}

/// outbox と、writer タスクが取り出す受信側を作成
pub fn outbox(capacity: usize) -> (Outbox, mpsc::Receiver<Message>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (Outbox { sender }, receiver)
}

impl Outbox {
    /// 待たずにメッセージを積む
    pub fn push(&self, message: Message) -> Result<(), MessagePushError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => MessagePushError::Full,
            TrySendError::Closed(_) => MessagePushError::Closed,
        })
    }

    /// メッセージを積む。受け取れない場合は破棄する
    pub fn deliver(&self, message: Message) {
        match self.push(message) {
            Ok(()) => {}
            Err(MessagePushError::Full) => {
                tracing::warn!("Outbox full, dropping message");
            }
            Err(MessagePushError::Closed) => {
                tracing::debug!("Outbox closed, dropping message");
            }
        }
    }

    pub fn notify(&self, content: impl Into<String>) {
        self.deliver(Message::notify(content));
    }

    pub fn error(&self, content: impl Into<String>) {
        self.deliver(Message::error(content));
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
