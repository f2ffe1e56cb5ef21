//! Middlewares for routes.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::token::Purpose;

const BEARER: &str = "Bearer ";

/// Account authenticated by a session token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub account_id: Uuid,
    pub email: Option<String>,
}

impl Session {
    /// Reject access to another account than the authenticated one.
    pub fn owns(&self, account_id: Uuid) -> Result<()> {
        if self.account_id == account_id {
            Ok(())
        } else {
            tracing::debug!(
                session = %self.account_id,
                requested = %account_id,
                "session used on another account"
            );
            Err(ServerError::Unauthorized)
        }
    }
}

/// Custom middleware for authentification.
pub async fn auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix(BEARER))
        .ok_or(ServerError::Unauthorized)?;

    let verified = state.tokens.verify(token.trim(), Purpose::Session)?;

    req.extensions_mut().insert(Session {
        account_id: verified.account_id,
        email: verified.email,
    });
    Ok(next.run(req).await)
}
