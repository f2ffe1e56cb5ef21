//! Error handler for encore.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::{ValidationError, ValidationErrors};

use crate::crypto::CryptoError;
use crate::payments::PaymentError;
use crate::token::TokenError;
use crate::vault::VaultError;

pub type Result<T> = std::result::Result<T, ServerError>;

const AUTH_FAILED: &str = "Invalid credentials or token.";
const RETRY_LATER: &str = "Something went wrong, please retry later.";

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error("email is already registered")]
    EmailTaken,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid, expired or misused token")]
    Unauthorized,

    #[error("resource not found")]
    NotFound,

    #[error("account profile is incomplete")]
    IncompleteProfile,

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ServerError {
    /// Wrap a dependency failure, keeping its source for logs.
    pub fn internal<E>(details: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            details: details.into(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<TokenError> for ServerError {
    fn from(err: TokenError) -> Self {
        tracing::debug!(reason = %err, "token rejected");
        ServerError::Unauthorized
    }
}

impl From<VaultError> for ServerError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::EmptySecret => {
                let mut errors = ValidationErrors::new();
                errors.add(
                    "brokerSecret",
                    ValidationError::new("empty_secret")
                        .with_message("Broker password must not be empty.".into()),
                );
                ServerError::Validation(errors)
            },
            err => ServerError::internal("credential vault failure", err),
        }
    }
}

impl From<CryptoError> for ServerError {
    fn from(err: CryptoError) -> Self {
        ServerError::internal("cryptographic failure", err)
    }
}

impl From<PaymentError> for ServerError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Signature(reason) => {
                tracing::warn!(%reason, "webhook signature rejected");
                ServerError::Unauthorized
            },
            PaymentError::Payload(_) | PaymentError::Metadata(_) => {
                let mut errors = ValidationErrors::new();
                errors.add(
                    "payload",
                    ValidationError::new("invalid_event")
                        .with_message(err.to_string().into()),
                );
                ServerError::Validation(errors)
            },
            err => ServerError::internal("payment provider failure", err),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::internal("artifact storage failure", err)
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    success: bool,
    error: String,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update user-facing `error` message.
    pub fn error(mut self, message: &str) -> Self {
        self.error = message.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = Some(description.into());
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(self) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            success: false,
            error: RETRY_LATER.to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| issue.code.to_string()),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .error("There were validation errors with your request.")
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::Axum(rejection) => response
                .error("Malformed request body.")
                .details(&rejection.body_text())
                .status(rejection.status()),

            ServerError::EmailTaken => response
                .error("Email is already registered.")
                .status(StatusCode::CONFLICT),

            ServerError::InvalidCredentials | ServerError::Unauthorized => {
                response.error(AUTH_FAILED).status(StatusCode::UNAUTHORIZED)
            },

            ServerError::NotFound => response
                .error("Not found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::IncompleteProfile => response
                .error("Account profile is incomplete.")
                .status(StatusCode::UNPROCESSABLE_ENTITY),

            ServerError::Sql(err) => {
                tracing::error!(error = %err, "database request failed");
                ResponseError::default()
            },

            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");
                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "success": false,
                "error": RETRY_LATER,
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new(RETRY_LATER.into()))
}
