use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use kv_repl::config::Config;
use kv_repl::server;

#[tokio::main]
async fn main() -> kv_repl::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();

    let listener = TcpListener::bind(&format!("127.0.0.1:{}", config.port)).await?;

    server::run(listener, config, signal::ctrl_c()).await
}
