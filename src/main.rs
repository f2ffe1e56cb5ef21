use std::future::ready;

use axum::routing::get;
use encore::config::{Configuration, config_path};
use encore::telemetry::{setup_logging, setup_metrics_recorder};
use encore::{app, initialize_state};
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() {
    let config = match Configuration::default().path(config_path()).read() {
        Ok(config) => config,
        Err(err) => {
            setup_logging(false);
            tracing::error!(error = %err, "invalid URL on `config.yaml` file");
            std::process::exit(1);
        },
    };
    setup_logging(config.log_json);

    let state = match initialize_state(config).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "cannot start encore");
            std::process::exit(1);
        },
    };

    let address = state.config.address().to_owned();
    let mut router = app(state);

    match setup_metrics_recorder() {
        Ok(recorder) => {
            router = router
                .route("/metrics", get(move || ready(recorder.render())));
        },
        Err(err) => {
            tracing::warn!(error = %err, "prometheus exporter not installed")
        },
    }

    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%address, error = %err, "cannot bind address");
            std::process::exit(1);
        },
    };

    tracing::info!(%address, "server started");

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %err, "server stopped unexpectedly");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to install signal handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
}
