use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::account::{BillingCycle, Plan, SubscriptionStatus};
use crate::clock::Clock;
use crate::payments::{
    IntentRequest, PaymentError, PaymentIntent, PaymentProvider, WebhookEvent,
};

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_URL: &str = "https://api.stripe.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Maximum age of a webhook timestamp, in seconds.
const WEBHOOK_TOLERANCE_SECS: i64 = 300;
/// Accepted clock skew for timestamps from the future, in seconds.
const WEBHOOK_FUTURE_SKEW_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentResponse {
    id: String,
    client_secret: String,
}

/// Stripe webhook event, `object` is parsed based on `type`.
#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    customer: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    customer: String,
    status: String,
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    customer: Option<String>,
}

/// Stripe REST client.
pub struct StripeClient {
    client: Client,
    secret_key: String,
    webhook_secret: String,
    endpoint: String,
    clock: Arc<dyn Clock>,
}

impl StripeClient {
    /// Create a new [`StripeClient`].
    pub fn new(
        secret_key: String,
        webhook_secret: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            secret_key,
            webhook_secret,
            endpoint: STRIPE_API_URL.to_owned(),
            clock,
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, PaymentError> {
        let response = self
            .client
            .post(format!("{}{path}", self.endpoint))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    /// Check a `Stripe-Signature` header (`t=<timestamp>,v1=<hex hmac>`).
    pub fn verify_signature(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<(), PaymentError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in signature.split(',') {
            if let Some(t) = part.trim().strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(s) = part.trim().strip_prefix("v1=") {
                signatures.push(s);
            }
        }

        let timestamp_str = timestamp.ok_or(PaymentError::Signature(
            "missing timestamp",
        ))?;
        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| PaymentError::Signature("invalid timestamp"))?;

        let age = self.clock.now().timestamp() - timestamp;
        if age > WEBHOOK_TOLERANCE_SECS {
            return Err(PaymentError::Signature("timestamp too old"));
        }
        if age < -WEBHOOK_FUTURE_SKEW_SECS {
            return Err(PaymentError::Signature("timestamp in the future"));
        }

        let valid = signatures.iter().any(|candidate| {
            let Ok(candidate) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) =
                HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            else {
                return false;
            };
            mac.update(timestamp_str.as_bytes());
            mac.update(b".");
            mac.update(payload);
            // Constant-time comparison.
            mac.verify_slice(&candidate).is_ok()
        });

        if valid {
            Ok(())
        } else {
            Err(PaymentError::Signature("no matching signature"))
        }
    }
}

fn subscription_status(stripe_status: &str) -> SubscriptionStatus {
    match stripe_status {
        "active" | "trialing" => SubscriptionStatus::Active,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        "canceled" | "incomplete_expired" => SubscriptionStatus::Cancelled,
        _ => SubscriptionStatus::Inactive,
    }
}

/// Turn a verified payload into a typed event.
fn parse_event(payload: &[u8]) -> Result<WebhookEvent, PaymentError> {
    let event: StripeEvent = serde_json::from_slice(payload)?;
    let object = event.data.object;

    let parsed = match event.event_type.as_str() {
        "payment_intent.succeeded" => {
            let intent: StripePaymentIntent = serde_json::from_value(object)?;
            let metadata = |key: &'static str| {
                intent
                    .metadata
                    .get(key)
                    .ok_or(PaymentError::Metadata(key))
            };

            WebhookEvent::PaymentSucceeded {
                payment_intent_id: intent.id.clone(),
                account_id: Uuid::parse_str(metadata("account_id")?)
                    .map_err(|_| PaymentError::Metadata("account_id"))?,
                plan: metadata("plan")?
                    .parse::<Plan>()
                    .map_err(|_| PaymentError::Metadata("plan"))?,
                billing_cycle: metadata("billing_cycle")?
                    .parse::<BillingCycle>()
                    .map_err(|_| PaymentError::Metadata("billing_cycle"))?,
                customer_id: intent.customer,
            }
        },
        "customer.subscription.created" | "customer.subscription.updated" => {
            let subscription: StripeSubscription =
                serde_json::from_value(object)?;

            WebhookEvent::SubscriptionChanged {
                customer_id: subscription.customer,
                subscription_id: subscription.id,
                status: subscription_status(&subscription.status),
                current_period_end: subscription
                    .current_period_end
                    .and_then(|end| DateTime::from_timestamp(end, 0)),
            }
        },
        "customer.subscription.deleted" => {
            let subscription: StripeSubscription =
                serde_json::from_value(object)?;

            WebhookEvent::SubscriptionChanged {
                customer_id: subscription.customer,
                subscription_id: subscription.id,
                status: SubscriptionStatus::Cancelled,
                current_period_end: None,
            }
        },
        "invoice.payment_failed" => {
            let invoice: StripeInvoice = serde_json::from_value(object)?;
            match invoice.customer {
                Some(customer_id) => WebhookEvent::PaymentFailed { customer_id },
                None => WebhookEvent::Ignored(event.event_type.clone()),
            }
        },
        _ => WebhookEvent::Ignored(event.event_type.clone()),
    };

    Ok(parsed)
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_customer(
        &self,
        email: &str,
        name: &str,
        account_id: Uuid,
    ) -> Result<String, PaymentError> {
        let account_id = account_id.to_string();
        let customer: CustomerResponse = self
            .post(
                "/customers",
                &[
                    ("email", email),
                    ("name", name),
                    ("metadata[account_id]", account_id.as_str()),
                ],
            )
            .await?;

        tracing::info!(%account_id, customer_id = %customer.id, "stripe customer created");

        Ok(customer.id)
    }

    async fn create_intent(
        &self,
        request: &IntentRequest<'_>,
    ) -> Result<PaymentIntent, PaymentError> {
        let amount = request.amount.to_string();
        let account_id = request.account_id.to_string();
        let mut form = vec![
            ("amount", amount.as_str()),
            ("currency", request.currency),
            ("automatic_payment_methods[enabled]", "true"),
            ("metadata[account_id]", account_id.as_str()),
            ("metadata[plan]", request.plan.as_ref()),
            ("metadata[billing_cycle]", request.billing_cycle.as_ref()),
            ("metadata[source]", "encore"),
        ];
        if let Some(customer_id) = request.customer_id {
            form.push(("customer", customer_id));
        }

        let intent: PaymentIntentResponse =
            self.post("/payment_intents", &form).await?;

        Ok(PaymentIntent {
            id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    fn uses_customers(&self) -> bool {
        true
    }

    fn parse_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<Option<WebhookEvent>, PaymentError> {
        let signature =
            signature.ok_or(PaymentError::Signature("missing header"))?;
        self.verify_signature(payload, signature)?;

        parse_event(payload).map(Some)
    }
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
