use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use nutriorder_api::config::{init_tracing, load_config};
use nutriorder_api::db::{ensure_schema, establish_connection};
use nutriorder_api::events::{process_events, EventSender};
use nutriorder_api::notifications::NotificationWorker;
use nutriorder_api::payments::PaymentGateways;
use nutriorder_api::{app_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;
    init_tracing(&config.log_level, config.log_json);

    info!(
        environment = %config.environment,
        "starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let db = establish_connection(&config)
        .await
        .context("failed to connect to the database")?;
    if config.auto_migrate {
        ensure_schema(&db).await.context("schema setup failed")?;
        info!("database schema ensured");
    }

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(1024);
    let event_sender = EventSender::new(event_tx);
    tokio::spawn(process_events(event_rx));

    let gateways =
        PaymentGateways::from_config(&config.payments).context("payment gateway setup failed")?;

    let host = config.host.clone();
    let port = config.port;
    let state = AppState::new(db, config, event_sender.clone(), gateways);

    let worker = NotificationWorker::new(state.db.clone(), event_sender);
    tokio::spawn(worker.run());

    let app = app_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid host/port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received sigterm"),
    }
}
