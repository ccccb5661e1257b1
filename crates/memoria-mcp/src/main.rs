//! `memoria-mcp`: an MCP server exposing the memoria-core catalog over
//! JSON-RPC stdio.

mod envelope;
mod protocol;
mod server;
mod tools;

use std::sync::Arc;

use clap::Parser;
use memoria_core::{Config, CoreRuntime};
use tracing_subscriber::EnvFilter;

use protocol::stdio::StdioTransport;
use server::McpServer;

#[derive(Parser)]
#[command(name = "memoria-mcp")]
#[command(about = "MCP server exposing a hybrid vector + lexical memory catalog")]
struct Cli {
    /// Override the catalog's SQLite file path (else `MEMORY_DB_PATH`/`MEMORY_DB_DIR`/platform default).
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(db_path) = cli.db_path {
        config.db_path = Some(db_path);
    }

    let runtime = Arc::new(CoreRuntime::open(config)?);
    let server = McpServer::new(runtime.clone());

    tracing::info!("memoria-mcp {} starting over stdio", memoria_core::VERSION);

    let result = StdioTransport::new().run(server).await;

    if let Err(err) = runtime.flush_all_access().await {
        tracing::warn!("failed to flush pending access counts on shutdown: {err}");
    }

    result.map_err(anyhow::Error::from)
}
