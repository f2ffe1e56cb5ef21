//! Billing: payment intents, subscription status and provider webhooks.
//!
//! Two providers share the [`PaymentProvider`] port:
//! 1. Stripe REST API,
//! 2. a mock returning fake identifiers and ignoring webhooks.

pub mod stripe;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{ValidationError, ValidationErrors};

use crate::account::{
    AccountRepository, AccountService, BillingCycle, Plan, Subscription,
    SubscriptionStatus,
};
use crate::clock::Clock;
use crate::config::{PaymentProvider as ProviderKind, Payments as PaymentsConfig};
use crate::error::{Result, ServerError};

#[derive(thiserror::Error, Debug)]
pub enum PaymentError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("provider answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid webhook signature: {0}")]
    Signature(&'static str),
    #[error("invalid webhook payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("missing or invalid `{0}` metadata")]
    Metadata(&'static str),
}

/// Price of a paid plan, in cents.
pub fn price_cents(plan: Plan, billing_cycle: BillingCycle) -> Option<i64> {
    match (plan, billing_cycle) {
        (Plan::FreeTrial, _) => None,
        (Plan::Professional, BillingCycle::Monthly) => Some(9_700),
        (Plan::Professional, BillingCycle::Yearly) => Some(93_600),
        (Plan::Enterprise, BillingCycle::Monthly) => Some(29_700),
        (Plan::Enterprise, BillingCycle::Yearly) => Some(285_120),
    }
}

/// Parameters of a payment intent.
#[derive(Clone, Debug, PartialEq)]
pub struct IntentRequest<'a> {
    pub account_id: Uuid,
    pub plan: Plan,
    pub billing_cycle: BillingCycle,
    pub amount: i64,
    pub currency: &'a str,
    pub customer_id: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

/// Billing events we act upon.
#[derive(Clone, Debug, PartialEq)]
pub enum WebhookEvent {
    PaymentSucceeded {
        payment_intent_id: String,
        account_id: Uuid,
        plan: Plan,
        billing_cycle: BillingCycle,
        customer_id: Option<String>,
    },
    SubscriptionChanged {
        customer_id: String,
        subscription_id: String,
        status: SubscriptionStatus,
        current_period_end: Option<DateTime<Utc>>,
    },
    PaymentFailed {
        customer_id: String,
    },
    Ignored(String),
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_customer(
        &self,
        email: &str,
        name: &str,
        account_id: Uuid,
    ) -> std::result::Result<String, PaymentError>;

    async fn create_intent(
        &self,
        request: &IntentRequest<'_>,
    ) -> std::result::Result<PaymentIntent, PaymentError>;

    /// Whether intents are attached to a stored customer.
    fn uses_customers(&self) -> bool;

    /// Verify and decode a webhook. `None` means it was only acknowledged.
    fn parse_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> std::result::Result<Option<WebhookEvent>, PaymentError>;
}

/// Provider returning fake identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockPayments;

#[async_trait]
impl PaymentProvider for MockPayments {
    async fn create_customer(
        &self,
        email: &str,
        _name: &str,
        _account_id: Uuid,
    ) -> std::result::Result<String, PaymentError> {
        tracing::info!(%email, "mock customer created");
        Ok(format!("cus_mock_{}", Uuid::new_v4().simple()))
    }

    async fn create_intent(
        &self,
        request: &IntentRequest<'_>,
    ) -> std::result::Result<PaymentIntent, PaymentError> {
        let id = format!("pi_mock_{}", Uuid::new_v4().simple());
        tracing::info!(
            account_id = %request.account_id,
            amount = request.amount,
            currency = request.currency,
            "mock payment intent created"
        );

        Ok(PaymentIntent {
            client_secret: format!("{id}_secret_mock"),
            id,
        })
    }

    fn uses_customers(&self) -> bool {
        false
    }

    fn parse_webhook(
        &self,
        _payload: &[u8],
        _signature: Option<&str>,
    ) -> std::result::Result<Option<WebhookEvent>, PaymentError> {
        tracing::debug!("mock mode, webhook acknowledged without processing");
        Ok(None)
    }
}

/// Build the provider selected in configuration.
pub fn from_config(
    config: &PaymentsConfig,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn PaymentProvider> {
    match (config.provider, secret_key, webhook_secret) {
        (ProviderKind::Stripe, Some(secret_key), Some(webhook_secret)) => Arc::new(
            stripe::StripeClient::new(secret_key, webhook_secret, clock),
        ),
        (ProviderKind::Stripe, _, _) => {
            tracing::warn!(
                "missing `STRIPE_SECRET_KEY` or `STRIPE_WEBHOOK_SECRET` environnement variable, payments are mocked"
            );
            Arc::new(MockPayments)
        },
        (ProviderKind::Mock, _, _) => Arc::new(MockPayments),
    }
}

/// Created intent, as answered to the client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentCreated {
    pub client_secret: String,
    pub payment_intent_id: String,
    pub amount: i64,
    pub currency: String,
}

/// Billing view of the current subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub account_id: Uuid,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionView {
    fn new(subscription: Subscription, now: DateTime<Utc>) -> Self {
        Self {
            account_id: subscription.account_id,
            plan: subscription.plan,
            status: subscription.status,
            current_period_end: subscription.expires_at,
            // Cancelled but still paid for.
            cancel_at_period_end: subscription.status
                == SubscriptionStatus::Cancelled
                && subscription.expires_at.is_some_and(|end| end > now),
        }
    }
}

/// Billing manager.
#[derive(Clone)]
pub struct Billing {
    provider: Arc<dyn PaymentProvider>,
    accounts: AccountService,
    repo: Arc<dyn AccountRepository>,
    clock: Arc<dyn Clock>,
    currency: String,
}

impl Billing {
    /// Create a new [`Billing`].
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        accounts: AccountService,
        clock: Arc<dyn Clock>,
        currency: &str,
    ) -> Self {
        Self {
            provider,
            repo: Arc::clone(accounts.repository()),
            accounts,
            clock,
            currency: currency.to_lowercase(),
        }
    }

    /// Start paying for `plan`.
    pub async fn create_intent(
        &self,
        account_id: Uuid,
        plan: Plan,
        billing_cycle: BillingCycle,
    ) -> Result<IntentCreated> {
        let Some(amount) = price_cents(plan, billing_cycle) else {
            let mut errors = ValidationErrors::new();
            errors.add(
                "plan",
                ValidationError::new("not_payable")
                    .with_message("The free trial cannot be paid for.".into()),
            );
            return Err(ServerError::Validation(errors));
        };

        let account = self.accounts.get_profile(account_id).await?;

        let customer_id = if self.provider.uses_customers() {
            Some(self.customer_of(account_id, &account.email, &account.first_name, &account.last_name).await?)
        } else {
            None
        };

        let intent = self
            .provider
            .create_intent(&IntentRequest {
                account_id,
                plan,
                billing_cycle,
                amount,
                currency: &self.currency,
                customer_id: customer_id.as_deref(),
            })
            .await?;

        tracing::info!(%account_id, payment_intent_id = %intent.id, amount, "payment intent created");

        Ok(IntentCreated {
            client_secret: intent.client_secret,
            payment_intent_id: intent.id,
            amount,
            currency: self.currency.clone(),
        })
    }

    /// Stored customer of the current subscription, created on first use.
    async fn customer_of(
        &self,
        account_id: Uuid,
        email: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<String> {
        let subscription = self.accounts.current_subscription(account_id).await?;
        if let Some(customer_id) = subscription.stripe_customer_id {
            return Ok(customer_id);
        }

        let customer_id = self
            .provider
            .create_customer(email, &format!("{first_name} {last_name}"), account_id)
            .await?;
        self.repo.set_customer_id(subscription.id, &customer_id).await?;

        Ok(customer_id)
    }

    pub async fn subscription_status(&self, account_id: Uuid) -> Result<SubscriptionView> {
        let subscription = self.accounts.current_subscription(account_id).await?;
        Ok(SubscriptionView::new(subscription, self.clock.now()))
    }

    /// Verify and apply a provider webhook.
    ///
    /// Returns whether the event changed anything.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<bool> {
        let Some(event) = self.provider.parse_webhook(payload, signature)? else {
            return Ok(false);
        };

        let now = self.clock.now().trunc_subsecs(6);
        match event {
            WebhookEvent::PaymentSucceeded {
                payment_intent_id,
                account_id,
                plan,
                billing_cycle,
                customer_id,
            } => {
                match self.accounts.get_profile(account_id).await {
                    Ok(_) => {},
                    Err(ServerError::NotFound) => {
                        tracing::warn!(%account_id, "payment for unknown account");
                        return Ok(false);
                    },
                    Err(err) => return Err(err),
                }

                let subscription = Subscription {
                    id: Uuid::new_v4(),
                    account_id,
                    plan,
                    status: SubscriptionStatus::Active,
                    billing_cycle,
                    expires_at: Some(now + billing_cycle.period()),
                    stripe_customer_id: customer_id,
                    stripe_subscription_id: None,
                    stripe_payment_intent_id: Some(payment_intent_id.clone()),
                    created_at: now,
                    updated_at: now,
                };
                if !self.repo.insert_subscription(&subscription).await? {
                    tracing::info!(%account_id, %payment_intent_id, "payment already applied");
                    return Ok(false);
                }

                tracing::info!(%account_id, plan = plan.as_ref(), "paid subscription activated");
                Ok(true)
            },
            WebhookEvent::SubscriptionChanged {
                customer_id,
                subscription_id,
                status,
                current_period_end,
            } => {
                self.update_by_customer(
                    &customer_id,
                    status,
                    current_period_end,
                    Some(&subscription_id),
                    now,
                )
                .await
            },
            WebhookEvent::PaymentFailed { customer_id } => {
                self.update_by_customer(
                    &customer_id,
                    SubscriptionStatus::PastDue,
                    None,
                    None,
                    now,
                )
                .await
            },
            WebhookEvent::Ignored(kind) => {
                tracing::debug!(%kind, "webhook event ignored");
                Ok(false)
            },
        }
    }

    async fn update_by_customer(
        &self,
        customer_id: &str,
        status: SubscriptionStatus,
        expires_at: Option<DateTime<Utc>>,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(subscription) =
            self.repo.find_subscription_by_customer(customer_id).await?
        else {
            tracing::warn!(%customer_id, "webhook for unknown customer");
            return Ok(false);
        };

        self.repo
            .update_subscription(subscription.id, status, expires_at, external_id, now)
            .await?;

        tracing::info!(
            account_id = %subscription.account_id,
            status = status.as_ref(),
            "subscription updated"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::account::testing::{Fixture, fixture, registration};
    use crate::clock::FixedClock;

    /// Stripe-like provider recording calls, webhooks parsed from JSON.
    #[derive(Default)]
    struct FakeStripe {
        customers: Mutex<Vec<String>>,
        intents: Mutex<Vec<(i64, Option<String>)>>,
    }

    #[async_trait]
    impl PaymentProvider for FakeStripe {
        async fn create_customer(
            &self,
            email: &str,
            _name: &str,
            _account_id: Uuid,
        ) -> std::result::Result<String, PaymentError> {
            self.customers.lock().unwrap().push(email.to_owned());
            Ok(format!("cus_{}", self.customers.lock().unwrap().len()))
        }

        async fn create_intent(
            &self,
            request: &IntentRequest<'_>,
        ) -> std::result::Result<PaymentIntent, PaymentError> {
            self.intents
                .lock()
                .unwrap()
                .push((request.amount, request.customer_id.map(ToOwned::to_owned)));
            Ok(PaymentIntent {
                id: "pi_1".into(),
                client_secret: "pi_1_secret".into(),
            })
        }

        fn uses_customers(&self) -> bool {
            true
        }

        fn parse_webhook(
            &self,
            payload: &[u8],
            _signature: Option<&str>,
        ) -> std::result::Result<Option<WebhookEvent>, PaymentError> {
            let event: serde_json::Value = serde_json::from_slice(payload)?;
            let customer_id = event["customer"].as_str().unwrap_or_default().to_owned();

            Ok(Some(match event["kind"].as_str() {
                Some("paid") => WebhookEvent::PaymentSucceeded {
                    payment_intent_id: event["intent"].as_str().unwrap_or("pi_1").to_owned(),
                    account_id: event["account"].as_str().unwrap().parse().unwrap(),
                    plan: Plan::Enterprise,
                    billing_cycle: BillingCycle::Yearly,
                    customer_id: Some(customer_id),
                },
                Some("failed") => WebhookEvent::PaymentFailed { customer_id },
                Some("deleted") => WebhookEvent::SubscriptionChanged {
                    customer_id,
                    subscription_id: "sub_1".into(),
                    status: SubscriptionStatus::Cancelled,
                    current_period_end: None,
                },
                _ => WebhookEvent::Ignored("other".into()),
            }))
        }
    }

    fn billing(fx: &Fixture, provider: Arc<dyn PaymentProvider>) -> Billing {
        Billing::new(provider, fx.service.clone(), fx.clock.clone(), "EUR")
    }

    #[test]
    fn test_pricing() {
        assert_eq!(price_cents(Plan::Professional, BillingCycle::Monthly), Some(9_700));
        assert_eq!(price_cents(Plan::Enterprise, BillingCycle::Yearly), Some(285_120));
        assert_eq!(price_cents(Plan::FreeTrial, BillingCycle::Monthly), None);
    }

    #[tokio::test]
    async fn test_mock_intent() {
        let fx = fixture();
        let registered = fx
            .service
            .register(registration("a@x.com", Plan::FreeTrial))
            .await
            .unwrap();

        let created = billing(&fx, Arc::new(MockPayments))
            .create_intent(registered.account_id, Plan::Professional, BillingCycle::Yearly)
            .await
            .unwrap();

        assert!(created.payment_intent_id.starts_with("pi_mock_"));
        assert_eq!(created.amount, 93_600);
        assert_eq!(created.currency, "eur");
    }

    #[tokio::test]
    async fn test_trial_is_not_payable() {
        let fx = fixture();
        let registered = fx
            .service
            .register(registration("a@x.com", Plan::FreeTrial))
            .await
            .unwrap();

        assert!(matches!(
            billing(&fx, Arc::new(MockPayments))
                .create_intent(registered.account_id, Plan::FreeTrial, BillingCycle::Monthly)
                .await,
            Err(ServerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_customer_is_created_once() {
        let fx = fixture();
        let registered = fx
            .service
            .register(registration("a@x.com", Plan::FreeTrial))
            .await
            .unwrap();
        let provider = Arc::new(FakeStripe::default());
        let billing = billing(&fx, provider.clone());

        for _ in 0..2 {
            billing
                .create_intent(registered.account_id, Plan::Enterprise, BillingCycle::Monthly)
                .await
                .unwrap();
        }

        assert_eq!(provider.customers.lock().unwrap().len(), 1);
        assert_eq!(
            *provider.intents.lock().unwrap(),
            vec![(29_700, Some("cus_1".into())), (29_700, Some("cus_1".into()))]
        );
    }

    #[tokio::test]
    async fn test_webhook_lifecycle() {
        let fx = fixture();
        let registered = fx
            .service
            .register(registration("a@x.com", Plan::FreeTrial))
            .await
            .unwrap();
        let billing = billing(&fx, Arc::new(FakeStripe::default()));
        fx.clock.advance(chrono::Duration::hours(1));

        let paid = serde_json::json!({
            "kind": "paid", "customer": "cus_9", "account": registered.account_id.to_string()
        });
        assert!(billing.handle_webhook(paid.to_string().as_bytes(), None).await.unwrap());

        let view = billing.subscription_status(registered.account_id).await.unwrap();
        assert_eq!(view.plan, Plan::Enterprise);
        assert_eq!(view.status, SubscriptionStatus::Active);
        assert_eq!(
            view.current_period_end,
            Some(fx.clock.now() + chrono::Duration::days(365))
        );

        // Redelivered event changes nothing.
        fx.clock.advance(chrono::Duration::hours(1));
        assert!(!billing.handle_webhook(paid.to_string().as_bytes(), None).await.unwrap());
        let (_, subscriptions, _) = fx.repo.counts();
        assert_eq!(subscriptions, 2);
        assert_eq!(
            billing
                .subscription_status(registered.account_id)
                .await
                .unwrap()
                .current_period_end,
            view.current_period_end
        );

        let failed = serde_json::json!({ "kind": "failed", "customer": "cus_9" });
        assert!(billing.handle_webhook(failed.to_string().as_bytes(), None).await.unwrap());
        assert_eq!(
            billing.subscription_status(registered.account_id).await.unwrap().status,
            SubscriptionStatus::PastDue
        );

        let deleted = serde_json::json!({ "kind": "deleted", "customer": "cus_9" });
        assert!(billing.handle_webhook(deleted.to_string().as_bytes(), None).await.unwrap());
        let view = billing.subscription_status(registered.account_id).await.unwrap();
        assert_eq!(view.status, SubscriptionStatus::Cancelled);
        assert!(view.cancel_at_period_end);

        let unknown = serde_json::json!({ "kind": "failed", "customer": "cus_unknown" });
        assert!(!billing.handle_webhook(unknown.to_string().as_bytes(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_ignores_webhooks() {
        let fx = fixture();
        let billing = billing(&fx, Arc::new(MockPayments));

        assert!(!billing.handle_webhook(b"not even json", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_stripe_webhook_signature_is_enforced() {
        let fx = fixture();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::default_instant());
        let stripe = Arc::new(stripe::StripeClient::new(
            "sk_test".into(),
            "whsec_test".into(),
            clock.clone(),
        ));
        let billing = billing(&fx, stripe);
        let payload = br#"{"type":"charge.refunded","data":{"object":{}}}"#;

        assert!(matches!(
            billing.handle_webhook(payload, Some("t=1,v1=00")).await,
            Err(ServerError::Unauthorized)
        ));

        let header = stripe::sign("whsec_test", clock.now().timestamp(), payload);
        assert!(!billing.handle_webhook(payload, Some(&header)).await.unwrap());
    }
}
