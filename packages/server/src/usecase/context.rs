//! マネージャーと全ルームアクターが共有する依存関係

use std::sync::Arc;

use hiroba_shared::time::{Clock, SystemClock};

use crate::{
    domain::{ChatStore, Timestamp},
    infrastructure::repository::LockedStore,
};

/// 1 回の `gm` で返すメッセージ数の既定の上限
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct ChatContext {
    /// プロセス全体の読み書きロックで保護されたストアハンドル
    pub store: LockedStore,
    pub clock: Arc<dyn Clock>,
    pub history_limit: u32,
}

impl ChatContext {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store: LockedStore::new(store),
            clock: Arc::new(SystemClock),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_history_limit(mut self, history_limit: u32) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::new(self.clock.now_millis())
    }
}
