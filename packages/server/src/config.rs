//! Server configuration.

use crate::{
    infrastructure::message_pusher::DEFAULT_OUTBOX_CAPACITY, usecase::DEFAULT_HISTORY_LIMIT,
};

/// Default TCP port
pub const DEFAULT_PORT: u16 = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to bind to; 0 picks a free port
    pub port: u16,
    /// Messages buffered per session before new ones are dropped
    pub outbox_capacity: usize,
    /// Maximum rows returned by one history request
    pub history_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        // テスト項目: デフォルト設定はポート 4000 で待ち受ける
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr(), "127.0.0.1:4000");
        assert_eq!(config.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
    }
}
