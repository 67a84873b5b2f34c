//! 接続中のセッションへのメッセージ配送
//!
//! - `outbox`: セッションごとの有界でブロックしないキュー

pub mod outbox;

pub use outbox::{DEFAULT_OUTBOX_CAPACITY, MessagePushError, Outbox, outbox};
