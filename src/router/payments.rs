//! Billing endpoints.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::account::{BillingCycle, Plan};
use crate::error::Result;
use crate::middleware::{Session, auth};
use crate::payments::{IntentCreated, SubscriptionView};
use crate::router::{Valid, owned_account};

const STRIPE_SIGNATURE: &str = "Stripe-Signature";

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // Authorization required.
        .route("/create-intent", post(create_intent))
        .route("/subscription/{account_id}", get(subscription))
        .route_layer(middleware::from_fn_with_state(state, auth))
        // Authenticated by its signature.
        .route("/stripe-webhook", post(webhook))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IntentBody {
    #[serde(alias = "userId")]
    account_id: Uuid,
    plan: Plan,
    #[serde(default)]
    billing_cycle: BillingCycle,
}

#[derive(Debug, Serialize)]
pub struct IntentResponse {
    success: bool,
    #[serde(flatten)]
    intent: IntentCreated,
}

pub async fn create_intent(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Valid(body): Valid<IntentBody>,
) -> Result<Json<IntentResponse>> {
    session.owns(body.account_id)?;

    let intent = state
        .billing
        .create_intent(body.account_id, body.plan, body.billing_cycle)
        .await?;

    Ok(Json(IntentResponse {
        success: true,
        intent,
    }))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    success: bool,
    #[serde(flatten)]
    subscription: SubscriptionView,
}

pub async fn subscription(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(raw_id): Path<String>,
) -> Result<Json<SubscriptionResponse>> {
    let id = owned_account(&session, &raw_id)?;

    Ok(Json(SubscriptionResponse {
        success: true,
        subscription: state.billing.subscription_status(id).await?,
    }))
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    success: bool,
    processed: bool,
}

/// Provider callback. The raw body is needed to check its signature.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<Json<WebhookResponse>> {
    let signature = headers
        .get(STRIPE_SIGNATURE)
        .and_then(|value| value.to_str().ok());

    let processed = state.billing.handle_webhook(&payload, signature).await?;

    Ok(Json(WebhookResponse {
        success: true,
        processed,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use super::*;
    use crate::router::testing::{json, state};
    use crate::{app, make_request};

    #[tokio::test]
    async fn test_create_intent_handler() {
        let test = state();
        let (registered, session) = test.signed_up("a@x.com").await;

        let response = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::POST,
            "/payments/create-intent",
            json!({
                "userId": registered.account_id,
                "plan": "enterprise",
                "billingCycle": "yearly",
            })
            .to_string(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["amount"], 285_120);
        assert_eq!(body["currency"], "eur");
        assert!(body["clientSecret"].as_str().unwrap().starts_with("pi_mock_"));
    }

    #[tokio::test]
    async fn test_create_intent_for_another_account() {
        let test = state();
        let (registered, _) = test.signed_up("a@x.com").await;

        let response = make_request(
            Some(&test.foreign_session()),
            app(test.state.clone()),
            Method::POST,
            "/payments/create-intent",
            json!({ "accountId": registered.account_id, "plan": "professional" })
                .to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_subscription_handler() {
        let test = state();
        let (registered, session) = test.signed_up("a@x.com").await;

        let response = make_request(
            Some(&session),
            app(test.state.clone()),
            Method::GET,
            &format!("/payments/subscription/{}", registered.account_id),
            String::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["accountId"], registered.account_id.to_string());
        assert_eq!(body["plan"], "free-trial");
        assert_eq!(body["status"], "active");
        assert_eq!(body["cancelAtPeriodEnd"], false);
    }

    #[tokio::test]
    async fn test_mock_webhook_is_acknowledged() {
        let test = state();

        let response = make_request(
            None,
            app(test.state.clone()),
            Method::POST,
            "/payments/stripe-webhook",
            json!({ "type": "payment_intent.succeeded" }).to_string(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processed"], false);
    }
}
