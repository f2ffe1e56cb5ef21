use std::sync::Arc;

use chrono::SubsecRound;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::account::{
    Account, AccountRepository, Credential, CredentialSummary, Plan,
    ProfileUpdate, Registration, Subscription, SubscriptionStatus,
};
use crate::clock::Clock;
use crate::crypto::Crypto;
use crate::error::{Result, ServerError};
use crate::mail;
use crate::outbox::{Effect, Outbox};
use crate::token::{Purpose, TokenManager};
use crate::vault::Vault;

/// Outcome of a successful registration.
#[derive(Debug)]
pub struct Registered {
    pub account_id: Uuid,
    pub installer_token: String,
    /// Welcome notification, to dispatch by the caller.
    pub outbox: Outbox,
}

/// Account manager.
#[derive(Clone)]
pub struct AccountService {
    repo: Arc<dyn AccountRepository>,
    crypto: Arc<Crypto>,
    vault: Arc<Vault>,
    tokens: TokenManager,
    clock: Arc<dyn Clock>,
    installer_page_url: String,
    product_name: String,
    /// Verified against when the email is unknown, so both failures cost
    /// the same.
    dummy_digest: Arc<String>,
}

impl AccountService {
    /// Create a new [`AccountService`].
    pub fn new(
        repo: Arc<dyn AccountRepository>,
        crypto: Arc<Crypto>,
        vault: Arc<Vault>,
        tokens: TokenManager,
        clock: Arc<dyn Clock>,
        installer_page_url: &str,
        product_name: &str,
    ) -> Result<Self> {
        let dummy_digest = Arc::new(crypto.pwd.hash_password("dummy")?);

        Ok(Self {
            repo,
            crypto,
            vault,
            tokens,
            clock,
            installer_page_url: installer_page_url.trim_end_matches('/').into(),
            product_name: product_name.to_owned(),
            dummy_digest,
        })
    }

    pub fn repository(&self) -> &Arc<dyn AccountRepository> {
        &self.repo
    }

    /// Open an account with its subscription and broker credential.
    pub async fn register(&self, registration: Registration) -> Result<Registered> {
        let email = normalize_email(&registration.email);

        if self.repo.email_exists(&email).await? {
            return Err(ServerError::EmailTaken);
        }

        let encrypted_secret = self.vault.encrypt(&registration.broker_secret)?;
        let password_digest = self.crypto.pwd.hash_password(&registration.password)?;

        // Postgres keeps microseconds.
        let now = self.clock.now().trunc_subsecs(6);
        let account = Account {
            id: Uuid::new_v4(),
            first_name: registration.first_name,
            last_name: registration.last_name,
            email,
            phone: registration.phone.filter(|phone| !phone.is_empty()),
            password_digest,
            is_active: true,
            is_verified: false,
            created_at: now,
            updated_at: now,
        };
        let subscription = Subscription {
            id: Uuid::new_v4(),
            account_id: account.id,
            plan: registration.plan,
            status: SubscriptionStatus::Active,
            billing_cycle: registration.billing_cycle.unwrap_or_default(),
            expires_at: registration
                .plan
                .is_trial()
                .then(|| now + chrono::Duration::days(Plan::TRIAL_DAYS)),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            stripe_payment_intent_id: None,
            created_at: now,
            updated_at: now,
        };
        let credential = Credential {
            id: Uuid::new_v4(),
            account_id: account.id,
            broker_login: registration.broker_login,
            broker_server: registration.broker_server,
            broker_name: registration.broker_name,
            account_kind: registration.account_kind,
            encrypted_secret,
            is_active: true,
            created_at: now,
        };

        self.repo.create(&account, &subscription, &credential).await?;

        metrics::counter!("accounts_registered_total", "plan" => subscription.plan.as_ref().to_owned())
            .increment(1);
        tracing::info!(account_id = %account.id, plan = subscription.plan.as_ref(), "account registered");

        let installer_token = self.tokens.issue(
            account.id,
            Purpose::Installer,
            Purpose::Installer.ttl(),
        )?;

        let mut outbox = Outbox::default();
        outbox.push(Effect::SendEmail(mail::welcome_for_plan(
            &account.email,
            &account.first_name,
            subscription.plan,
            &format!(
                "{}/{}?token={installer_token}",
                self.installer_page_url, account.id
            ),
            &self.product_name,
        )));

        Ok(Registered {
            account_id: account.id,
            installer_token,
            outbox,
        })
    }

    /// Check an email/password pair.
    ///
    /// Unknown email, inactive account and wrong password all fail the same way.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Account> {
        let account = self.repo.find_by_email(&normalize_email(email)).await?;

        let digest = account
            .as_ref()
            .map(|account| account.password_digest.as_str())
            .unwrap_or(self.dummy_digest.as_str());
        let valid = self.crypto.pwd.verify_password(password, digest);

        match account {
            Some(account) if valid && account.is_active => Ok(account),
            _ => Err(ServerError::InvalidCredentials),
        }
    }

    /// Authenticate and mint a session token.
    pub async fn login(&self, email: &str, password: &str) -> Result<(String, Account)> {
        let account = self.authenticate(email, password).await?;
        let token = self.tokens.issue_session(account.id, &account.email)?;

        tracing::debug!(account_id = %account.id, "session opened");

        Ok((token, account))
    }

    pub async fn get_profile(&self, account_id: Uuid) -> Result<Account> {
        self.repo
            .find_by_id(account_id)
            .await?
            .filter(|account| account.is_active)
            .ok_or(ServerError::NotFound)
    }

    pub async fn current_subscription(&self, account_id: Uuid) -> Result<Subscription> {
        self.repo
            .current_subscription(account_id)
            .await?
            .ok_or(ServerError::NotFound)
    }

    pub async fn credential_summary(&self, account_id: Uuid) -> Result<CredentialSummary> {
        self.repo
            .current_credential(account_id)
            .await?
            .map(CredentialSummary::from)
            .ok_or(ServerError::NotFound)
    }

    /// Decrypt the broker secret of an account.
    ///
    /// The only path returning a plaintext secret. `installer_token` must be
    /// an installer token issued to `account_id`.
    pub async fn reveal_secret(
        &self,
        account_id: Uuid,
        installer_token: &str,
    ) -> Result<Zeroizing<String>> {
        self.tokens
            .verify_for(installer_token, Purpose::Installer, account_id)?;

        let credential = self
            .repo
            .current_credential(account_id)
            .await?
            .ok_or(ServerError::NotFound)?;

        Ok(self.vault.decrypt(&credential.encrypted_secret)?)
    }

    pub async fn update_profile(
        &self,
        account_id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Account> {
        self.get_profile(account_id).await?;

        let now = self.clock.now().trunc_subsecs(6);
        let account = self
            .repo
            .update_profile(account_id, &update, now)
            .await?
            .ok_or(ServerError::NotFound)?;

        tracing::info!(account_id = %account_id, "profile updated");

        Ok(account)
    }

    /// Soft-delete an account after checking its password.
    pub async fn deactivate(&self, account_id: Uuid, password: &str) -> Result<()> {
        let account = self.get_profile(account_id).await?;
        if !self
            .crypto
            .pwd
            .verify_password(password, &account.password_digest)
        {
            return Err(ServerError::InvalidCredentials);
        }

        self.repo
            .deactivate(account_id, self.clock.now().trunc_subsecs(6))
            .await?;

        tracing::info!(account_id = %account_id, "account deactivated");

        Ok(())
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
