//! UseCase 層: マネージャーとルームアクター
//!
//! - `manager`: アカウントとチャットのライフサイクル、チャットディレクトリ、オンライン表
//! - `room`: チャットごとのアクター、接続中メンバーとメッセージ
//! - `session_handle`: アクターから接続セッションへの参照

pub mod context;
pub mod error;
pub mod manager;
pub mod room;
pub mod session_handle;

pub use context::{ChatContext, DEFAULT_HISTORY_LIMIT};
pub use error::ChatError;
pub use manager::{ManagerHandle, ManagerRequest, ServerManager};
pub use room::{RoomActor, RoomHandle, RoomRequest};
pub use session_handle::{SessionHandle, SessionId, SessionUpdate};
