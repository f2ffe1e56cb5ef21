//! Best-effort email delivery.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::mail::{Email, reminder, welcome};
use crate::middleware::auth;
use crate::router::Valid;

const NOT_SENT: &str = "Email could not be sent, please retry later.";

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/send", post(send))
        .route("/welcome", post(send_welcome))
        .route("/installer-reminder", post(send_reminder))
        // Authorization required.
        .route_layer(middleware::from_fn_with_state(state, auth))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendBody {
    #[validate(email(message = "Email must be formatted."))]
    to: String,
    #[validate(length(max = 200))]
    to_name: Option<String>,
    #[validate(length(min = 1, max = 255))]
    subject: String,
    #[validate(length(min = 1))]
    html_content: String,
    text_content: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeBody {
    #[serde(alias = "userEmail")]
    #[validate(email(message = "Email must be formatted."))]
    email: String,
    #[serde(alias = "userName")]
    #[validate(length(min = 1, max = 200))]
    name: String,
    #[serde(alias = "installerDownloadUrl")]
    #[validate(url(message = "Download URL must be an URL."))]
    download_url: String,
    #[validate(length(min = 1, max = 50))]
    plan: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReminderBody {
    #[serde(alias = "userEmail")]
    #[validate(email(message = "Email must be formatted."))]
    email: String,
    #[serde(alias = "userName")]
    #[validate(length(min = 1, max = 200))]
    name: String,
    #[validate(url(message = "Download URL must be an URL."))]
    download_url: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Failures are reported in the body, never as an error status.
async fn deliver(state: &AppState, email: Email) -> Json<SendResponse> {
    match state.mailer.send(&email).await {
        Ok(sent) => Json(SendResponse {
            success: true,
            message_id: Some(sent.message_id),
            error: None,
        }),
        Err(err) => {
            tracing::warn!(error = %err, to = %email.to, "email not sent");
            Json(SendResponse {
                success: false,
                message_id: None,
                error: Some(NOT_SENT.to_owned()),
            })
        },
    }
}

pub async fn send(
    State(state): State<AppState>,
    Valid(body): Valid<SendBody>,
) -> Result<Json<SendResponse>> {
    let email = Email {
        to: body.to,
        to_name: body.to_name,
        subject: body.subject,
        html: body.html_content,
        text: body.text_content,
    };

    Ok(deliver(&state, email).await)
}

pub async fn send_welcome(
    State(state): State<AppState>,
    Valid(body): Valid<WelcomeBody>,
) -> Result<Json<SendResponse>> {
    let email = welcome(
        &body.email,
        &body.name,
        &body.plan,
        &body.download_url,
        &state.config.installer.product_name,
    );

    Ok(deliver(&state, email).await)
}

pub async fn send_reminder(
    State(state): State<AppState>,
    Valid(body): Valid<ReminderBody>,
) -> Result<Json<SendResponse>> {
    let email = reminder(
        &body.email,
        &body.name,
        &body.download_url,
        &state.config.installer.product_name,
    );

    Ok(deliver(&state, email).await)
}
