//! Accounts, their subscriptions and their broker credentials.

mod repository;
mod service;

pub use repository::*;
pub use service::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use uuid::Uuid;
use validator::Validate;

/// Subscription tier.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Plan {
    #[serde(alias = "trial")]
    #[strum(to_string = "free-trial", serialize = "trial")]
    FreeTrial,
    Professional,
    Enterprise,
}

impl Plan {
    /// Trials always expire 7 days after creation.
    pub const TRIAL_DAYS: i64 = 7;

    pub fn is_trial(self) -> bool {
        self == Plan::FreeTrial
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    PastDue,
    Cancelled,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Yearly,
}

impl BillingCycle {
    /// Length of one paid period.
    pub fn period(self) -> chrono::Duration {
        match self {
            BillingCycle::Monthly => chrono::Duration::days(30),
            BillingCycle::Yearly => chrono::Duration::days(365),
        }
    }
}

/// Broker account kind.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccountKind {
    Demo,
    Live,
}

// Enums are stored as TEXT columns.
macro_rules! text_column {
    ($($ty:ty),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = strum::ParseError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    )*};
}

text_column!(Plan, SubscriptionStatus, BillingCycle, AccountKind);

/// Account as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    #[serde(skip)]
    pub password_digest: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Subscription as saved on database.
///
/// An account accumulates rows over time; the latest one is current.
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: Uuid,
    #[sqlx(try_from = "String")]
    pub plan: Plan,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    #[sqlx(try_from = "String")]
    pub billing_cycle: BillingCycle,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub stripe_customer_id: Option<String>,
    #[serde(skip)]
    pub stripe_subscription_id: Option<String>,
    /// Payment which opened this subscription, if paid.
    #[serde(skip)]
    pub stripe_payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Broker credential as saved on database.
///
/// Never serialized: use [`CredentialSummary`] for responses.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Credential {
    pub id: Uuid,
    pub account_id: Uuid,
    pub broker_login: String,
    pub broker_server: String,
    pub broker_name: String,
    #[sqlx(try_from = "String")]
    pub account_kind: AccountKind,
    /// Vault envelope.
    pub encrypted_secret: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Credential without its secret.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: Uuid,
    pub broker_login: String,
    pub broker_server: String,
    pub broker_name: String,
    pub account_kind: AccountKind,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Credential> for CredentialSummary {
    fn from(credential: Credential) -> Self {
        Self {
            id: credential.id,
            broker_login: credential.broker_login,
            broker_server: credential.broker_server,
            broker_name: credential.broker_name,
            account_kind: credential.account_kind,
            is_active: credential.is_active,
            created_at: credential.created_at,
        }
    }
}

/// Everything needed to open an account.
#[derive(Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    #[validate(email, length(max = 255))]
    pub email: String,
    #[validate(length(min = 1, max = 255))]
    pub password: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    pub plan: Plan,
    pub billing_cycle: Option<BillingCycle>,
    #[validate(length(min = 1, max = 64))]
    pub broker_login: String,
    #[validate(length(min = 1, max = 255))]
    pub broker_server: String,
    #[validate(length(min = 1, max = 255))]
    pub broker_name: String,
    pub account_kind: AccountKind,
    /// Plaintext; sealed by the vault before anything is stored.
    pub broker_secret: String,
}

/// Editable profile fields. Missing fields are left untouched.
#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[validate(length(min = 1, max = 100))]
    pub first_name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub last_name: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}
