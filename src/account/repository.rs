//! Storage port for accounts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::account::{
    Account, Credential, ProfileUpdate, Subscription, SubscriptionStatus,
};
use crate::error::Result;

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn email_exists(&self, email: &str) -> Result<bool>;

    /// Insert the three rows of a registration as one unit.
    ///
    /// Fails with [`crate::error::ServerError::EmailTaken`] when another
    /// account won the race for the same email.
    async fn create(
        &self,
        account: &Account,
        subscription: &Subscription,
        credential: &Credential,
    ) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>>;

    /// Latest subscription of an account.
    async fn current_subscription(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Subscription>>;

    /// Latest active credential of an account.
    async fn current_credential(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Credential>>;

    async fn update_profile(
        &self,
        id: Uuid,
        update: &ProfileUpdate,
        at: DateTime<Utc>,
    ) -> Result<Option<Account>>;

    /// Soft-delete an account with its credentials and active subscriptions.
    async fn deactivate(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Insert a paid subscription.
    ///
    /// Returns `false` when its payment intent was already recorded.
    async fn insert_subscription(&self, subscription: &Subscription)
    -> Result<bool>;

    async fn set_customer_id(
        &self,
        subscription_id: Uuid,
        customer_id: &str,
    ) -> Result<()>;

    /// Latest subscription carrying this external customer reference.
    async fn find_subscription_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Subscription>>;

    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
        expires_at: Option<DateTime<Utc>>,
        external_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;
}
