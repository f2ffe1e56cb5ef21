//! Assemble a personalized installer from account data.
//!
//! Substitution is literal find-and-replace on `{{NAME}}` placeholders.

use std::sync::Arc;

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::account::AccountService;
use crate::clock::Clock;
use crate::config::Installer as InstallerConfig;
use crate::error::{Result, ServerError};
use crate::token::{Purpose, TokenManager};

const BUILTIN_TEMPLATE: &str = include_str!("../../templates/installer.bat");

/// A rendered installer. Holds a plaintext secret, wiped on drop.
pub struct Installer {
    pub file_name: String,
    pub content: Zeroizing<String>,
}

/// Installer generator.
#[derive(Clone)]
pub struct InstallerBuilder {
    accounts: AccountService,
    tokens: TokenManager,
    clock: Arc<dyn Clock>,
    template: Arc<str>,
    product_name: String,
    market_data_api_key: String,
}

impl InstallerBuilder {
    /// Create a new [`InstallerBuilder`] using `template`.
    pub fn new(
        accounts: AccountService,
        tokens: TokenManager,
        clock: Arc<dyn Clock>,
        template: &str,
        config: &InstallerConfig,
    ) -> Self {
        Self {
            accounts,
            tokens,
            clock,
            template: Arc::from(template),
            product_name: config.product_name.clone(),
            market_data_api_key: config
                .market_data_api_key
                .clone()
                .unwrap_or_default(),
        }
    }

    /// Read the configured template, or fall back on the built-in one.
    pub fn load_template(config: &InstallerConfig) -> std::io::Result<String> {
        match &config.template_path {
            Some(path) => {
                let template = std::fs::read_to_string(path)?;
                tracing::info!(path = %path.display(), "installer template loaded");
                Ok(template)
            },
            None => Ok(BUILTIN_TEMPLATE.to_owned()),
        }
    }

    /// Render the installer of `account_id`.
    pub async fn build(
        &self,
        account_id: Uuid,
        installer_token: &str,
    ) -> Result<Installer> {
        self.tokens
            .verify_for(installer_token, Purpose::Installer, account_id)?;

        let incomplete = |err: ServerError| match err {
            ServerError::NotFound => ServerError::IncompleteProfile,
            err => err,
        };
        let account = self
            .accounts
            .get_profile(account_id)
            .await
            .map_err(incomplete)?;
        let subscription = self
            .accounts
            .current_subscription(account_id)
            .await
            .map_err(incomplete)?;
        let credential = self
            .accounts
            .credential_summary(account_id)
            .await
            .map_err(incomplete)?;
        let secret = self
            .accounts
            .reveal_secret(account_id, installer_token)
            .await
            .map_err(incomplete)?;

        let now = self.clock.now();
        let id = account.id.to_string();
        let plan = subscription.plan.as_ref().to_uppercase();
        let kind = credential.account_kind.as_ref().to_uppercase();
        let generated_at = now.format("%Y-%m-%d %H:%M:%S UTC").to_string();
        let install_dir = format!(
            "C:\\{}-{}-{}",
            self.product_name, account.first_name, account.id
        );

        let content = render(
            &self.template,
            &[
                ("ACCOUNT_ID", &id),
                ("FIRST_NAME", &account.first_name),
                ("LAST_NAME", &account.last_name),
                ("EMAIL", &account.email),
                ("PLAN", &plan),
                ("BROKER_LOGIN", &credential.broker_login),
                ("BROKER_SECRET", secret.as_str()),
                ("BROKER_SERVER", &credential.broker_server),
                ("BROKER_NAME", &credential.broker_name),
                ("ACCOUNT_KIND", &kind),
                ("MARKET_DATA_API_KEY", &self.market_data_api_key),
                ("GENERATED_AT", &generated_at),
                ("INSTALL_DIR", &install_dir),
            ],
        );

        Ok(Installer {
            file_name: file_name(&self.product_name, &account.email, account.id, now),
            content,
        })
    }
}

/// Replace every `{{KEY}}` by its value in one pass over `template`.
///
/// Inserted values are never scanned again, and unknown placeholders stay
/// as they are.
pub fn render(template: &str, values: &[(&str, &str)]) -> Zeroizing<String> {
    let capacity = template.len()
        + values.iter().map(|(_, value)| value.len()).sum::<usize>();
    let mut out = Zeroizing::new(String::with_capacity(capacity));

    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let found = after.find("}}").and_then(|end| {
            values
                .iter()
                .find(|(key, _)| *key == &after[..end])
                .map(|(_, value)| (*value, end))
        });
        match found {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            },
            None => {
                out.push_str("{{");
                rest = after;
            },
        }
    }
    out.push_str(rest);

    out
}

/// `<product>-Installer-<email>-<id>-<YYYY-MM-DD>.bat`, email reduced to
/// ASCII alphanumerics.
pub fn file_name(
    product_name: &str,
    email: &str,
    account_id: Uuid,
    now: chrono::DateTime<chrono::Utc>,
) -> String {
    let sanitized: String = email
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    format!(
        "{product_name}-Installer-{sanitized}-{account_id}-{}.bat",
        now.format("%Y-%m-%d")
    )
}
