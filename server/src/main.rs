//! seekdb server entry point: load configuration, start the server, wait
//! for a shutdown signal and stop gracefully.

use clap::Parser;
use tokio::signal;

use seekdb::config::RuntimeConfig;
use seekdb::server::Server;

/// Waits for Ctrl+C or SIGTERM.
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

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

#[tokio::main]
async fn main() {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = RuntimeConfig::from_toml(&args.config);

    let mut server = match Server::start(config).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("seekdb failed to start: {}", e);
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    server.stop();
}
