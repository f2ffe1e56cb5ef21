//! HTTP handlers.

pub mod auth;
pub mod email;
pub mod installer;
pub mod payments;
pub mod status;

use axum::Json;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;
use uuid::Uuid;
use validator::Validate;

use crate::error::{Result, ServerError};
use crate::middleware::Session;

/// JSON body checked against its validation rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<S, T> FromRequest<S> for Valid<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Turn a missing resource into `None`.
pub fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ServerError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Account ID from a path segment, which must be the session's own.
///
/// A malformed ID is never the session's subject, so it is rejected like any
/// other account.
pub fn owned_account(session: &Session, raw: &str) -> Result<Uuid> {
    let Ok(id) = Uuid::parse_str(raw) else {
        tracing::debug!(session = %session.account_id, "malformed account id");
        return Err(ServerError::Unauthorized);
    };
    session.owns(id)?;

    Ok(id)
}
