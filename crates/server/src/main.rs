//! Bid exchange HTTP server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;

use clap::Parser;
use error_stack::{Report, ResultExt};

use bid_exchange_common::error::BidExchangeError;
use bid_exchange_common::exchange::build_exchange;
use bid_exchange_common::http_client::ReqwestClient;
use bid_exchange_common::metrics;
use bid_exchange_common::settings::Settings;

mod routes;

#[derive(Parser, Debug)]
#[command(name = "bid-exchange")]
#[command(about = "Header bidding exchange server")]
#[command(version)]
struct Args {
    /// Settings file
    #[arg(long, env = "BID_EXCHANGE_CONFIG", default_value = "bid-exchange.toml")]
    config: PathBuf,

    /// Overrides `[logging] level`
    #[arg(long, env = "BID_EXCHANGE_LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long, env = "BID_EXCHANGE_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Report<BidExchangeError>> {
    let args = Args::parse();

    let settings = Settings::from_file(&args.config)?;
    let level = args.log_level.as_deref().unwrap_or(&settings.logging.level);
    init_logger(level)?;
    log::info!("Loaded settings from {}", args.config.display());

    metrics::setup_registry(Some("bid_exchange".to_string()))?;

    let exchange = Arc::new(build_exchange(
        settings,
        Arc::new(ReqwestClient::default()),
    )?);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .change_context(BidExchangeError::Configuration {
            message: format!("Failed to bind {}", args.bind),
        })?;
    log::info!("Listening on {}", args.bind);

    axum::serve(listener, routes::router(exchange))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .change_context(BidExchangeError::Http {
            message: "Server stopped unexpectedly".to_string(),
        })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    log::info!("Shutting down");
}

fn init_logger(level: &str) -> Result<(), Report<BidExchangeError>> {
    let filter = log::LevelFilter::from_str(level).ok();

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}  {} {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                message
            ))
        })
        .level(filter.unwrap_or(log::LevelFilter::Info))
        .chain(std::io::stdout())
        .apply()
        .change_context(BidExchangeError::Configuration {
            message: "Failed to initialize logger".to_string(),
        })?;

    if filter.is_none() {
        log::warn!("Unknown log level '{}', using info", level);
    }
    Ok(())
}
