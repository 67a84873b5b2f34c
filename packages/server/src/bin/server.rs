//! Hiroba chat server.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin hiroba-server
//! cargo run --bin hiroba-server -- --host 0.0.0.0 --port 4000 --database sqlite://hiroba.db
//! cargo run --bin hiroba-server -- --memory
//! ```

use std::sync::Arc;

use clap::Parser;
use hiroba_server::{
    config::{DEFAULT_PORT, ServerConfig},
    domain::ChatStore,
    infrastructure::{
        message_pusher::DEFAULT_OUTBOX_CAPACITY,
        repository::{InMemoryChatStore, SqliteChatStore},
    },
    ui::Server,
    usecase::DEFAULT_HISTORY_LIMIT,
};
use hiroba_shared::logger::setup_logger;

#[derive(Parser, Debug)]
#[command(name = "hiroba-server")]
#[command(about = "Multi-room TCP chat server", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database URL (created if missing)
    #[arg(short = 'd', long, default_value = "sqlite://hiroba.db")]
    database: String,

    /// Keep everything in memory; nothing survives a restart
    #[arg(long, conflicts_with = "database")]
    memory: bool,

    /// Messages buffered per connection before new ones are dropped
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    outbox_capacity: usize,

    /// Maximum number of messages returned by one history request
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    history_limit: u32,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            outbox_capacity: self.outbox_capacity,
            history_limit: self.history_limit,
        }
    }

    async fn open_store(&self) -> Result<Arc<dyn ChatStore>, Box<dyn std::error::Error>> {
        if self.memory {
            tracing::info!("Using in-memory store");
            return Ok(Arc::new(InMemoryChatStore::new()));
        }
        tracing::info!("Opening database {}", self.database);
        Ok(Arc::new(SqliteChatStore::connect(&self.database).await?))
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let store = args.open_store().await?;
    let server = Server::bind(args.server_config(), store).await?;
    server.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
