//! Encore registers trading accounts, bills their subscriptions and delivers
//! personalized installers.

#![forbid(unsafe_code)]
pub mod account;
pub mod clock;
pub mod config;
pub mod crypto;
mod database;
pub mod error;
pub mod installer;
pub mod mail;
mod middleware;
pub mod outbox;
pub mod payments;
mod router;
pub mod telemetry;
pub mod token;
pub mod vault;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::clock::{Clock, SystemClock};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    token: Option<&str>,
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request =
            request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub accounts: account::AccountService,
    pub installers: installer::InstallerBuilder,
    pub delivery: installer::DeliveryGateway,
    pub billing: payments::Billing,
    pub tokens: token::TokenManager,
    pub mailer: Arc<dyn mail::Mailer>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(30)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
                .allow_headers(Any)
                .expose_headers([header::CONTENT_DISPOSITION])
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::handler))
        .nest("/auth", router::auth::router(state.clone()))
        .nest("/installer", router::installer::router(state.clone()))
        .nest("/email", router::email::router(state.clone()))
        .nest("/payments", router::payments::router(state.clone()))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let secrets = config::Secrets::from_env(config.vault.key_version)?;

    let Some(postgres) = &config.postgres else {
        return Err("missing `postgres` entry on `config.yaml` file".into());
    };
    let db = database::Database::new(
        &postgres.address,
        postgres
            .username
            .as_deref()
            .unwrap_or(database::DEFAULT_CREDENTIALS),
        postgres
            .password
            .as_deref()
            .unwrap_or(database::DEFAULT_CREDENTIALS),
        postgres
            .database
            .as_deref()
            .unwrap_or(database::DEFAULT_DATABASE_NAME),
        postgres.pool_size.unwrap_or(database::DEFAULT_POOL_SIZE),
    )
    .await?;

    // execute migrations scripts on start.
    db.migrate().await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let crypto = Arc::new(crypto::Crypto::new(config.argon2.clone())?);
    let vault = Arc::new(vault::Vault::from_secrets(
        config.vault.key_version,
        &secrets.key,
        &secrets.salt,
        &secrets.retired_keys,
    )?);

    let audience = config.token.audience.as_deref().unwrap_or(&config.url);
    let tokens = token::TokenManager::new(
        &secrets.token_secret,
        &config.token.issuer,
        audience,
        Arc::clone(&clock),
    );

    let accounts = account::AccountService::new(
        Arc::new(database::postgres::PgAccounts::new(db.postgres.clone())),
        crypto,
        vault,
        tokens.clone(),
        Arc::clone(&clock),
        &config.installer_page_url(),
        &config.installer.product_name,
    )?;

    let template = installer::InstallerBuilder::load_template(&config.installer)?;
    let installers = installer::InstallerBuilder::new(
        accounts.clone(),
        tokens.clone(),
        Arc::clone(&clock),
        &template,
        &config.installer,
    );
    let delivery = installer::DeliveryGateway::new(
        Arc::new(database::postgres::PgArtifacts::new(db.postgres.clone())),
        config.installer.storage_path.clone(),
        Arc::clone(&clock),
    );

    // handle third-party providers.
    let mailer = mail::from_config(&config.mail, secrets.sendgrid_api_key);
    let provider = payments::from_config(
        &config.payments,
        secrets.stripe_secret_key,
        secrets.stripe_webhook_secret,
        Arc::clone(&clock),
    );
    let billing = payments::Billing::new(
        provider,
        accounts.clone(),
        clock,
        &config.payments.currency,
    );

    Ok(AppState {
        config,
        accounts,
        installers,
        delivery,
        billing,
        tokens,
        mailer,
    })
}
