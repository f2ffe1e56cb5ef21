//! Registration, sessions and account data.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Extension, Json, Router, middleware};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::account::{
    Account, CredentialSummary, ProfileUpdate, Registration, Subscription,
};
use crate::error::Result;
use crate::middleware::{Session, auth};
use crate::router::{Valid, found, owned_account};

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // Authorization required.
        .route("/profile/{account_id}", get(profile))
        .route("/subscription/{account_id}", get(subscription))
        .route("/credentials/{account_id}", get(credentials))
        .route("/profile", patch(update_profile))
        .route("/account", delete(deactivate))
        .route_layer(middleware::from_fn_with_state(state, auth))
        .route("/register", post(register))
        .route("/login", post(login))
        // Installer token required, internal use only.
        .route("/reveal-secret", post(reveal_secret))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub account_id: Uuid,
    pub installer_token: String,
}

/// Handler to open an account.
pub async fn register(
    State(state): State<AppState>,
    Valid(body): Valid<Registration>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let registered = state.accounts.register(body).await?;

    // Committed; the welcome email may now fail on its own.
    registered.outbox.dispatch(Arc::clone(&state.mailer));

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            success: true,
            account_id: registered.account_id,
            installer_token: registered.installer_token,
        }),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginBody {
    #[validate(length(min = 1, max = 255))]
    email: String,
    #[validate(length(min = 1, max = 255))]
    password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    success: bool,
    token: String,
    account: Account,
}

pub async fn login(
    State(state): State<AppState>,
    Valid(body): Valid<LoginBody>,
) -> Result<Json<LoginResponse>> {
    let (token, account) = state.accounts.login(&body.email, &body.password).await?;

    Ok(Json(LoginResponse {
        success: true,
        token,
        account,
    }))
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    success: bool,
    account: Option<Account>,
}

pub async fn profile(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(raw_id): Path<String>,
) -> Result<Json<ProfileResponse>> {
    let id = owned_account(&session, &raw_id)?;

    Ok(Json(ProfileResponse {
        success: true,
        account: found(state.accounts.get_profile(id).await)?,
    }))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    success: bool,
    subscription: Option<Subscription>,
}

pub async fn subscription(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(raw_id): Path<String>,
) -> Result<Json<SubscriptionResponse>> {
    let id = owned_account(&session, &raw_id)?;

    Ok(Json(SubscriptionResponse {
        success: true,
        subscription: found(state.accounts.current_subscription(id).await)?,
    }))
}

#[derive(Debug, Serialize)]
pub struct CredentialsResponse {
    success: bool,
    credentials: Option<CredentialSummary>,
}

pub async fn credentials(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(raw_id): Path<String>,
) -> Result<Json<CredentialsResponse>> {
    let id = owned_account(&session, &raw_id)?;

    Ok(Json(CredentialsResponse {
        success: true,
        credentials: found(state.accounts.credential_summary(id).await)?,
    }))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RevealBody {
    #[serde(alias = "userId")]
    account_id: Uuid,
    #[validate(length(min = 1))]
    installer_token: String,
}

#[derive(Serialize)]
struct RevealResponse<'a> {
    success: bool,
    secret: Option<&'a str>,
}

/// Decrypt a broker secret for the installer flow.
pub async fn reveal_secret(
    State(state): State<AppState>,
    Valid(body): Valid<RevealBody>,
) -> Result<Response> {
    let secret = found(
        state
            .accounts
            .reveal_secret(body.account_id, &body.installer_token)
            .await,
    )?;

    // Serialized right away, the plaintext is wiped when `secret` drops.
    Ok(Json(RevealResponse {
        success: true,
        secret: secret.as_ref().map(|secret| secret.as_str()),
    })
    .into_response())
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Valid(body): Valid<ProfileUpdate>,
) -> Result<Json<ProfileResponse>> {
    let account = state.accounts.update_profile(session.account_id, body).await?;

    Ok(Json(ProfileResponse {
        success: true,
        account: Some(account),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct DeactivateBody {
    #[validate(length(min = 1, max = 255))]
    password: String,
}

pub async fn deactivate(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Valid(body): Valid<DeactivateBody>,
) -> Result<StatusCode> {
    state
        .accounts
        .deactivate(session.account_id, &body.password)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use serde_json::json;

    use super::*;
    use crate::router::testing::{json, state};
    use crate::{app, make_request};

    fn register_body(email: &str, plan: &str) -> String {
        json!({
            "firstName": "Ada",
            "lastName": "Lovelace",
            "email": email,
            "password": "p",
            "plan": plan,
            "brokerLogin": "5001234",
            "brokerServer": "Broker-Demo",
            "brokerName": "Broker Ltd",
            "accountKind": "demo",
            "brokerSecret": "br0ker-S3cret",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_register_handler() {
        let test = state();
        let app = app(test.state.clone());

        let response = make_request(
            None,
            app,
            Method::POST,
            "/auth/register",
            register_body("a@x.com", "free-trial"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let body: RegisterResponse =
            serde_json::from_value(json(response).await).unwrap();
        assert!(body.success);
        assert!(
            test.state
                .tokens
                .verify_for(
                    &body.installer_token,
                    crate::token::Purpose::Installer,
                    body.account_id
                )
                .is_ok()
        );
        assert_eq!(test.accounts.counts(), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_register_twice() {
        let test = state();

        let first = make_request(
            None,
            app(test.state.clone()),
            Method::POST,
            "/auth/register",
            register_body("a@x.com", "professional"),
        )
        .await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = make_request(
            None,
            app(test.state.clone()),
            Method::POST,
            "/auth/register",
            register_body("A@x.com", "professional"),
        )
        .await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(json(second).await["success"], false);
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_email() {
        let test = state();

        let response = make_request(
            None,
            app(test.state.clone()),
            Method::POST,
            "/auth/register",
            register_body("not-an-email", "free-trial"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["errors"][0]["field"], "email");
        assert_eq!(test.accounts.counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_login_handler() {
        let test = state();
        test.signed_up("a@x.com").await;

        let response = make_request(
            None,
            app(test.state.clone()),
            Method::POST,
            "/auth/login",
            json!({ "email": "a@x.com", "password": "p" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["account"]["email"], "a@x.com");
        assert!(body["account"].get("passwordDigest").is_none());

        let token = body["token"].as_str().unwrap();
        assert!(
            test.state
                .tokens
                .verify(token, crate::token::Purpose::Session)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_login_with_wrong_password() {
        let test = state();
        test.signed_up("a@x.com").await;

        let response = make_request(
            None,
            app(test.state.clone()),
            Method::POST,
            "/auth/login",
            json!({ "email": "a@x.com", "password": "wrong" }).to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json(response).await;
        assert!(body.get("token").is_none());
    }

    #[tokio::test]
    async fn test_profile_requires_own_session() {
        let test = state();
        let (registered, session) = test.signed_up("a@x.com").await;
        let path = format!("/auth/profile/{}", registered.account_id);

        let anonymous =
            make_request(None, app(test.state.clone()), Method::GET, &path, String::new())
                .await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let foreign = make_request(
            Some(&test.foreign_session()),
            app(test.state.clone()),
            Method::GET,
            &path,
            String::new(),
        )
        .await;
        assert_eq!(foreign.status(), StatusCode::UNAUTHORIZED);

        // An installer token is not a session.
        let installer = make_request(
            Some(&registered.installer_token),
            app(test.state.clone()),
            Method::GET,
            &path,
            String::new(),
        )
        .await;
        assert_eq!(installer.status(), StatusCode::UNAUTHORIZED);

        let malformed = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::GET,
            "/auth/profile/not-a-uuid",
            String::new(),
        )
        .await;
        assert_eq!(malformed.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(malformed).await, json(foreign).await);

        let owner = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::GET,
            &path,
            String::new(),
        )
        .await;
        assert_eq!(owner.status(), StatusCode::OK);
        assert_eq!(json(owner).await["account"]["firstName"], "Ada");
    }

    #[tokio::test]
    async fn test_subscription_and_credentials() {
        let test = state();
        let (registered, session) = test.signed_up("a@x.com").await;

        let response = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::GET,
            &format!("/auth/subscription/{}", registered.account_id),
            String::new(),
        )
        .await;
        let body = json(response).await;
        assert_eq!(body["subscription"]["plan"], "free-trial");
        assert_eq!(body["subscription"]["status"], "active");

        let response = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::GET,
            &format!("/auth/credentials/{}", registered.account_id),
            String::new(),
        )
        .await;
        let body = json(response).await;
        assert_eq!(body["credentials"]["brokerLogin"], "5001234");
        assert!(!body.to_string().contains("br0ker-S3cret"));
        assert!(body["credentials"].get("encryptedSecret").is_none());
    }

    #[tokio::test]
    async fn test_reveal_secret_handler() {
        let test = state();
        let (registered, session) = test.signed_up("a@x.com").await;

        let response = make_request(
            None,
            app(test.state.clone()),
            Method::POST,
            "/auth/reveal-secret",
            json!({
                "accountId": registered.account_id,
                "installerToken": registered.installer_token,
            })
            .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["secret"], "br0ker-S3cret");

        let response = make_request(
            None,
            app(test.state.clone()),
            Method::POST,
            "/auth/reveal-secret",
            json!({
                "accountId": registered.account_id,
                "installerToken": session,
            })
            .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_update_profile_and_deactivate() {
        let test = state();
        let (registered, session) = test.signed_up("a@x.com").await;

        let response = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::PATCH,
            "/auth/profile",
            json!({ "lastName": "Byron" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["account"]["lastName"], "Byron");

        let response = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::DELETE,
            "/auth/account",
            json!({ "password": "wrong" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::DELETE,
            "/auth/account",
            json!({ "password": "p" }).to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::GET,
            &format!("/auth/profile/{}", registered.account_id),
            String::new(),
        )
        .await;
        assert_eq!(json(response).await["account"], serde_json::Value::Null);
    }
}
