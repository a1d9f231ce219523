use clap::Parser;
use tracing::info;

use matrix_stream_proxy::cli::Cli;
use matrix_stream_proxy::config::Config;
use matrix_stream_proxy::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);

    info!("starting websocket/eventsource bridge on port {}", config.port);
    info!("upstream homeserver: {}", config.upstream_url);

    let addr = format!("0.0.0.0:{}", config.port);
    let app = build_router(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
