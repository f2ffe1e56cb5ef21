//! In-memory repositories backing unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::account::{
    Account, AccountRepository, Credential, ProfileUpdate, Subscription,
    SubscriptionStatus,
};
use crate::error::{Result, ServerError};
use crate::installer::{ArtifactRepository, AuditEntry, GeneratedArtifact};

fn injected() -> ServerError {
    ServerError::internal("injected failure", std::io::Error::other("insert failed"))
}

#[derive(Default)]
struct Tables {
    accounts: Vec<Account>,
    subscriptions: Vec<Subscription>,
    credentials: Vec<Credential>,
}

#[derive(Default)]
pub struct MemoryAccounts {
    tables: Mutex<Tables>,
    fail_credential_insert: AtomicBool,
}

impl MemoryAccounts {
    /// Make the credential part of the next registrations fail.
    pub fn fail_credential_insert(&self, fail: bool) {
        self.fail_credential_insert.store(fail, Ordering::SeqCst);
    }

    /// Number of accounts, subscriptions and credentials.
    pub fn counts(&self) -> (usize, usize, usize) {
        let tables = self.tables.lock().unwrap();
        (
            tables.accounts.len(),
            tables.subscriptions.len(),
            tables.credentials.len(),
        )
    }

    pub fn credential_of(&self, account_id: Uuid) -> Option<Credential> {
        let tables = self.tables.lock().unwrap();
        tables
            .credentials
            .iter()
            .find(|c| c.account_id == account_id)
            .cloned()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccounts {
    async fn email_exists(&self, email: &str) -> Result<bool> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.accounts.iter().any(|a| a.email == email))
    }

    async fn create(
        &self,
        account: &Account,
        subscription: &Subscription,
        credential: &Credential,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();

        // Every check happens before the first write.
        if tables.accounts.iter().any(|a| a.email == account.email) {
            return Err(ServerError::EmailTaken);
        }
        if self.fail_credential_insert.load(Ordering::SeqCst) {
            return Err(injected());
        }

        tables.accounts.push(account.clone());
        tables.subscriptions.push(subscription.clone());
        tables.credentials.push(credential.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.accounts.iter().find(|a| a.email == email).cloned())
    }

    async fn current_subscription(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Subscription>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .subscriptions
            .iter()
            .filter(|s| s.account_id == account_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn current_credential(
        &self,
        account_id: Uuid,
    ) -> Result<Option<Credential>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .credentials
            .iter()
            .filter(|c| c.account_id == account_id && c.is_active)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn update_profile(
        &self,
        id: Uuid,
        update: &ProfileUpdate,
        at: DateTime<Utc>,
    ) -> Result<Option<Account>> {
        let mut tables = self.tables.lock().unwrap();
        let Some(account) = tables.accounts.iter_mut().find(|a| a.id == id)
        else {
            return Ok(None);
        };

        if let Some(first_name) = &update.first_name {
            account.first_name = first_name.clone();
        }
        if let Some(last_name) = &update.last_name {
            account.last_name = last_name.clone();
        }
        if let Some(phone) = &update.phone {
            account.phone = (!phone.is_empty()).then(|| phone.clone());
        }
        account.updated_at = at;

        Ok(Some(account.clone()))
    }

    async fn deactivate(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();

        for account in tables.accounts.iter_mut().filter(|a| a.id == id) {
            account.is_active = false;
            account.updated_at = at;
        }
        for credential in
            tables.credentials.iter_mut().filter(|c| c.account_id == id)
        {
            credential.is_active = false;
        }
        for subscription in tables.subscriptions.iter_mut().filter(|s| {
            s.account_id == id && s.status == SubscriptionStatus::Active
        }) {
            subscription.status = SubscriptionStatus::Inactive;
            subscription.updated_at = at;
        }

        Ok(())
    }

    async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        let replayed = subscription.stripe_payment_intent_id.is_some()
            && tables.subscriptions.iter().any(|known| {
                known.stripe_payment_intent_id
                    == subscription.stripe_payment_intent_id
            });
        if replayed {
            return Ok(false);
        }

        tables.subscriptions.push(subscription.clone());
        Ok(true)
    }

    async fn set_customer_id(
        &self,
        subscription_id: Uuid,
        customer_id: &str,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        for subscription in tables
            .subscriptions
            .iter_mut()
            .filter(|s| s.id == subscription_id)
        {
            subscription.stripe_customer_id = Some(customer_id.to_owned());
        }
        Ok(())
    }

    async fn find_subscription_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Subscription>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .subscriptions
            .iter()
            .filter(|s| s.stripe_customer_id.as_deref() == Some(customer_id))
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn update_subscription(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
        expires_at: Option<DateTime<Utc>>,
        external_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        for subscription in tables
            .subscriptions
            .iter_mut()
            .filter(|s| s.id == subscription_id)
        {
            subscription.status = status;
            if expires_at.is_some() {
                subscription.expires_at = expires_at;
            }
            if let Some(external_id) = external_id {
                subscription.stripe_subscription_id = Some(external_id.to_owned());
            }
            subscription.updated_at = at;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryArtifacts {
    artifacts: Mutex<Vec<GeneratedArtifact>>,
    audit: Mutex<Vec<AuditEntry>>,
    fail_inserts: AtomicBool,
}

impl MemoryArtifacts {
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }
}

#[async_trait]
impl ArtifactRepository for MemoryArtifacts {
    async fn insert(&self, artifact: &GeneratedArtifact) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(injected());
        }

        self.artifacts.lock().unwrap().push(artifact.clone());
        Ok(())
    }

    async fn claim(
        &self,
        download_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GeneratedArtifact>> {
        let mut artifacts = self.artifacts.lock().unwrap();
        Ok(artifacts
            .iter_mut()
            .find(|a| a.download_token == download_token && a.expires_at > now)
            .map(|artifact| {
                artifact.download_count += 1;
                artifact.clone()
            }))
    }

    async fn list_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<GeneratedArtifact>> {
        let artifacts = self.artifacts.lock().unwrap();
        let mut listed: Vec<_> = artifacts
            .iter()
            .rev()
            .filter(|a| a.account_id == account_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listed.truncate(usize::try_from(limit).unwrap_or_default());
        Ok(listed)
    }

    async fn audit(&self, entry: &AuditEntry) -> Result<()> {
        self.audit.lock().unwrap().push(entry.clone());
        Ok(())
    }
}
