mod config;
mod error;
mod gateway;
mod metrics;
mod server;
mod storage;
mod tob;
mod transport;

use clap::Parser;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the runtime config
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Node id, overrides `id` in the config
    #[arg(short, long)]
    id: Option<String>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    let mut runtime_config = config::RuntimeConfig::from_toml(&args.config)?;
    if let Some(id) = args.id {
        runtime_config.id = id;
    }
    config::init(runtime_config);

    let mut server = server::Server::builder()?;
    server.start().await?;
    shutdown_signal().await;
    server.stop();
    Ok(())
}
