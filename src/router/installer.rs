//! Installer generation, download and history.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::installer::{ArtifactSummary, AuditAction, Published};
use crate::middleware::{Session, auth};
use crate::router::{Valid, owned_account};

const OCTET_STREAM: &str = "application/octet-stream";

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // Authorization required.
        .route("/status/{account_id}", get(status))
        .route_layer(middleware::from_fn_with_state(state, auth))
        .route("/generate", post(generate))
        .route("/download/{download_token}", get(download))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    #[serde(alias = "userId")]
    account_id: Uuid,
    #[validate(length(min = 1))]
    installer_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub success: bool,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

async fn build_and_publish(
    state: &AppState,
    account_id: Uuid,
    installer_token: &str,
) -> Result<Published> {
    let installer = state.installers.build(account_id, installer_token).await?;
    state
        .delivery
        .publish(account_id, installer.content.as_bytes(), &installer.file_name)
        .await
}

/// Handler to render an installer and mint its download link.
pub async fn generate(
    State(state): State<AppState>,
    Valid(body): Valid<GenerateBody>,
) -> Result<Json<GenerateResponse>> {
    let outcome =
        build_and_publish(&state, body.account_id, &body.installer_token).await;
    state
        .delivery
        .audit(Some(body.account_id), AuditAction::GenerateInstaller, &outcome)
        .await;
    let published = outcome?;

    Ok(Json(GenerateResponse {
        success: true,
        download_url: state.config.download_url(&published.download_token),
        expires_at: published.expires_at,
    }))
}

/// Serve an artifact as an attachment.
pub async fn download(
    State(state): State<AppState>,
    Path(download_token): Path<String>,
) -> Result<impl IntoResponse> {
    let outcome = state.delivery.fetch(&download_token).await;
    let account_id = outcome.as_ref().ok().map(|download| download.account_id);
    state
        .delivery
        .audit(account_id, AuditAction::DownloadInstaller, &outcome)
        .await;
    let download = outcome?;

    tracing::info!(account_id = %download.account_id, "installer downloaded");

    Ok((
        [
            (header::CONTENT_TYPE, OCTET_STREAM.to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download.file_name),
            ),
        ],
        download.bytes,
    ))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    success: bool,
    installers: Vec<ArtifactSummary>,
}

/// Latest installers of an account.
pub async fn status(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(raw_id): Path<String>,
) -> Result<Json<StatusResponse>> {
    let id = owned_account(&session, &raw_id)?;

    Ok(Json(StatusResponse {
        success: true,
        installers: state.delivery.list_for_account(id).await?,
    }))
}
