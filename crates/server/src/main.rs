use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use strata_api::HttpConfig;
use strata_server::{Server, ServerConfig};
use strata_store::StoreConfig;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Strata object store server")]
struct Cli {
    /// Address for the REST API
    #[arg(long, env = "STRATA_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// SQLite file for committed objects; omit to keep everything in memory
    #[arg(long = "db", env = "STRATA_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Accepted credentials as `token=subject` pairs, comma separated
    #[arg(long, env = "STRATA_AUTH_TOKENS", default_value = "", hide_env_values = true)]
    auth_tokens: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "STRATA_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("STRATA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STRATA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STRATA_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("server: shutdown requested"),
        Err(e) => warn!(error = %e, "server: cannot listen for ctrl-c; running until killed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = ServerConfig {
        listen: cli.listen,
        db_path: cli.db_path,
        auth_tokens: cli.auth_tokens,
        http: HttpConfig { request_timeout: Duration::from_secs(cli.request_timeout_secs) },
    };
    let server = Server::build(config, StoreConfig::from_env()?).await?;
    server.serve(shutdown_signal()).await
}
