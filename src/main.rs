use salesrelay::main_helper::router;
use salesrelay::redaction_layer::RedactingWriter;
use salesrelay::*;

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "salesrelay=info".into(),
    };

    // File logging goes through the redacting writer
    let _ = std::fs::create_dir_all(&args.log_dir);
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "salesrelay.log");
    let (non_blocking, _guard) =
        tracing_appender::non_blocking(RedactingWriter::new(file_appender));

    let file_layer = if args.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    salesrelay::logging::setup_panic_hook();

    let addr = format!("{}:{}", args.host, args.port);
    let state = match AppState::new(args) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("salesrelay listening on {}", addr);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}
