//! PostgreSQL repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::account::{
    Account, AccountRepository, Credential, ProfileUpdate, Subscription,
    SubscriptionStatus,
};
use crate::error::{Result, ServerError};
use crate::installer::{ArtifactRepository, AuditEntry, GeneratedArtifact};

const ACCOUNT_COLUMNS: &str = "id, first_name, last_name, email, phone, password_digest, is_active, is_verified, created_at, updated_at";
const SUBSCRIPTION_COLUMNS: &str = "id, account_id, plan, status, billing_cycle, expires_at, stripe_customer_id, stripe_subscription_id, stripe_payment_intent_id, created_at, updated_at";
const CREDENTIAL_COLUMNS: &str = "id, account_id, broker_login, broker_server, broker_name, account_kind, encrypted_secret, is_active, created_at";
const ARTIFACT_COLUMNS: &str = "id, account_id, file_name, file_path, download_token, expires_at, created_at, download_count";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

/// Accounts, subscriptions and credentials tables.
#[derive(Clone)]
pub struct PgAccounts {
    pool: PgPool,
}

impl PgAccounts {
    /// Create a new [`PgAccounts`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PgAccounts {
    async fn email_exists(&self, email: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE email = $1)",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn create(
        &self,
        account: &Account,
        subscription: &Subscription,
        credential: &Credential,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"INSERT INTO accounts (id, first_name, last_name, email, phone, password_digest, is_active, is_verified, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(account.id)
        .bind(&account.first_name)
        .bind(&account.last_name)
        .bind(&account.email)
        .bind(&account.phone)
        .bind(&account.password_digest)
        .bind(account.is_active)
        .bind(account.is_verified)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {},
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                return Err(ServerError::EmailTaken);
            },
            Err(err) => return Err(err.into()),
        }

        sqlx::query(
            r#"INSERT INTO subscriptions (id, account_id, plan, status, billing_cycle, expires_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(subscription.id)
        .bind(subscription.account_id)
        .bind(subscription.plan.as_ref())
        .bind(subscription.status.as_ref())
        .bind(subscription.billing_cycle.as_ref())
        .bind(subscription.expires_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO credentials (id, account_id, broker_login, broker_server, broker_name, account_kind, encrypted_secret, is_active, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(credential.id)
        .bind(credential.account_id)
        .bind(&credential.broker_login)
        .bind(&credential.broker_server)
        .bind(&credential.broker_name)
        .bind(credential.account_kind.as_ref())
        .bind(&credential.encrypted_secret)
        .bind(credential.is_active)
        .bind(credential.created_at)
        .execute(&mut *tx)
        .await?;

        // Dropping `tx` on any early return above rolls everything back.
        tx.commit().await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");

        Ok(sqlx::query_as::<_, Account>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let query =
            format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = $1");

        Ok(sqlx::query_as::<_, Account>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn current_subscription(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Subscription>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE account_id = $1 ORDER BY created_at DESC LIMIT 1"
        );

        Ok(sqlx::query_as::<_, Subscription>(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn current_credential(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Credential>> {
        let query = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE account_id = $1 AND is_active = TRUE ORDER BY created_at DESC LIMIT 1"
        );

        Ok(sqlx::query_as::<_, Credential>(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: &ProfileUpdate,
        at: DateTime<Utc>,
    ) -> Result<Option<Account>> {
        let query = format!(
            r#"UPDATE accounts SET
                first_name = COALESCE($2, first_name),
                last_name = COALESCE($3, last_name),
                phone = CASE WHEN $4::TEXT IS NULL THEN phone ELSE NULLIF($4, '') END,
                updated_at = $5
            WHERE id = $1
            RETURNING {ACCOUNT_COLUMNS}"#
        );

        Ok(sqlx::query_as::<_, Account>(&query)
            .bind(id)
            .bind(&update.first_name)
            .bind(&update.last_name)
            .bind(&update.phone)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn deactivate(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE accounts SET is_active = FALSE, updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE credentials SET is_active = FALSE WHERE account_id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE subscriptions SET status = $2, updated_at = $3 WHERE account_id = $1 AND status = $4",
        )
        .bind(id)
        .bind(SubscriptionStatus::Inactive.as_ref())
        .bind(at)
        .bind(SubscriptionStatus::Active.as_ref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<bool> {
        // A replayed payment hits the payment intent unique index.
        let inserted = sqlx::query(
            r#"INSERT INTO subscriptions (id, account_id, plan, status, billing_cycle, expires_at, stripe_customer_id, stripe_subscription_id, stripe_payment_intent_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (stripe_payment_intent_id) DO NOTHING"#,
        )
        .bind(subscription.id)
        .bind(subscription.account_id)
        .bind(subscription.plan.as_ref())
        .bind(subscription.status.as_ref())
        .bind(subscription.billing_cycle.as_ref())
        .bind(subscription.expires_at)
        .bind(&subscription.stripe_customer_id)
        .bind(&subscription.stripe_subscription_id)
        .bind(&subscription.stripe_payment_intent_id)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn set_customer_id(
        &self,
        subscription_id: Uuid,
        customer_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET stripe_customer_id = $2 WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_subscription_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Subscription>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_customer_id = $1 ORDER BY created_at DESC LIMIT 1"
        );

        Ok(sqlx::query_as::<_, Subscription>(&query)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
        expires_at: Option<DateTime<Utc>>,
        external_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE subscriptions SET
                status = $2,
                expires_at = COALESCE($3, expires_at),
                stripe_subscription_id = COALESCE($4, stripe_subscription_id),
                updated_at = $5
            WHERE id = $1"#,
        )
        .bind(subscription_id)
        .bind(status.as_ref())
        .bind(expires_at)
        .bind(external_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Generated artifacts and installer audit log tables.
#[derive(Clone)]
pub struct PgArtifacts {
    pool: PgPool,
}

impl PgArtifacts {
    /// Create a new [`PgArtifacts`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactRepository for PgArtifacts {
    async fn insert(&self, artifact: &GeneratedArtifact) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO generated_artifacts (id, account_id, file_name, file_path, download_token, expires_at, created_at, download_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(artifact.id)
        .bind(artifact.account_id)
        .bind(&artifact.file_name)
        .bind(&artifact.file_path)
        .bind(&artifact.download_token)
        .bind(artifact.expires_at)
        .bind(artifact.created_at)
        .bind(artifact.download_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim(
        &self,
        download_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GeneratedArtifact>> {
        let query = format!(
            r#"UPDATE generated_artifacts SET download_count = download_count + 1
            WHERE download_token = $1 AND expires_at > $2
            RETURNING {ARTIFACT_COLUMNS}"#
        );

        Ok(sqlx::query_as::<_, GeneratedArtifact>(&query)
            .bind(download_token)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<GeneratedArtifact>> {
        let query = format!(
            "SELECT {ARTIFACT_COLUMNS} FROM generated_artifacts WHERE account_id = $1 ORDER BY created_at DESC LIMIT $2"
        );

        Ok(sqlx::query_as::<_, GeneratedArtifact>(&query)
            .bind(account_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn audit(&self, entry: &AuditEntry) -> Result<()> {
        // Attempts on unknown accounts are kept, unattributed.
        sqlx::query(
            r#"INSERT INTO installer_audit_log (account_id, action, success, error_message, created_at)
                VALUES ((SELECT id FROM accounts WHERE id = $1), $2, $3, $4, $5)"#,
        )
        .bind(entry.account_id)
        .bind(entry.action.as_ref())
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
