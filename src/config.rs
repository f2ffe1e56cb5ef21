//! Configuration manager for encore.
//!
//! Non-secret settings live in `config.yaml`. Keys and provider credentials
//! are only ever read from the environment, see [`Secrets`].

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_STORAGE_PATH: &str = "./generated_installers";
const DEFAULT_PRODUCT_NAME: &str = "AI-ENCORE";
const DEFAULT_ISSUER: &str = "encore";
const DEFAULT_CURRENCY: &str = "eur";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public base URL of current instance.
    pub url: String,
    /// Socket address to bind, `0.0.0.0:8080` if missing.
    pub address: Option<String>,
    /// Emit JSON log lines instead of human-readable ones.
    pub log_json: bool,
    #[serde(skip)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to JsonWebToken configuration.
    #[serde(skip_serializing)]
    pub token: Token,
    /// Related to broker credential encryption.
    #[serde(skip_serializing)]
    pub vault: Vault,
    /// Related to installer generation and delivery.
    #[serde(skip_serializing)]
    pub installer: Installer,
    /// Related to transactional emails.
    #[serde(skip_serializing)]
    pub mail: Mail,
    /// Related to billing.
    #[serde(skip_serializing)]
    pub payments: Payments,
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// Json Web Token configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    /// `iss` claim.
    pub issuer: String,
    /// `aud` claim, defaults to the instance URL.
    pub audience: Option<String>,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.into(),
            audience: None,
        }
    }
}

/// Credential vault configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vault {
    /// Version tag written next to every new ciphertext.
    /// `KEY`/`SALT` are this version; older ones come from `RETIRED_KEY_<n>`.
    pub key_version: u8,
}

impl Default for Vault {
    fn default() -> Self {
        Self { key_version: 1 }
    }
}

/// Installer configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Installer {
    /// Directory where generated artifacts are written.
    pub storage_path: PathBuf,
    /// Optional template replacing the built-in one.
    pub template_path: Option<PathBuf>,
    /// Product name used in file names and install directory.
    pub product_name: String,
    /// Injected into `{{MARKET_DATA_API_KEY}}`.
    pub market_data_api_key: Option<String>,
    /// Front-end page receiving installer tokens, `{url}/installer` if missing.
    pub page_url: Option<String>,
}

impl Default for Installer {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            template_path: None,
            product_name: DEFAULT_PRODUCT_NAME.into(),
            market_data_api_key: None,
            page_url: None,
        }
    }
}

/// Which implementation backs a third-party integration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    #[default]
    Mock,
    Sendgrid,
}

/// Transactional mail configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mail {
    pub provider: MailProvider,
    pub from_email: String,
    pub from_name: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    #[default]
    Mock,
    Stripe,
}

/// Billing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payments {
    pub provider: PaymentProvider,
    /// ISO 4217 currency, lowercase.
    pub currency: String,
}

impl Default for Payments {
    fn default() -> Self {
        Self {
            provider: PaymentProvider::default(),
            currency: DEFAULT_CURRENCY.into(),
        }
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Address the HTTP server binds to.
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(DEFAULT_ADDRESS)
    }

    /// Front-end page where a freshly registered user lands with an
    /// installer token.
    pub fn installer_page_url(&self) -> String {
        self.installer.page_url.clone().unwrap_or_else(|| {
            format!("{}/installer", self.url.trim_end_matches('/'))
        })
    }

    /// Public URL of a download token.
    pub fn download_url(&self, download_token: &str) -> String {
        format!(
            "{}/installer/download/{download_token}",
            self.url.trim_end_matches('/')
        )
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Ok(Arc::new(self.error(err)));
                        },
                    };

                // set app version.
                config.version = VERSION.to_owned();

                // normalize URLs.
                if !config.url.is_empty() {
                    config.url = self.normalize_url(&config.url)?;
                }
                config.installer.page_url = config
                    .installer
                    .page_url
                    .map(|p| self.normalize_url(&p))
                    .transpose()?;

                Ok(Arc::new(config))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}

/// `CONFIG_PATH`, or empty to use `config.yaml`.
pub fn config_path() -> PathBuf {
    std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_default()
}

/// Secrets read from the environment, never from `config.yaml`.
pub struct Secrets {
    /// Current vault master key.
    pub key: String,
    /// Salt for the vault key derivation.
    pub salt: String,
    /// Older vault keys, by version.
    pub retired_keys: Vec<(u8, String)>,
    /// HMAC key signing every JWT.
    pub token_secret: String,
    pub sendgrid_api_key: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("missing `{0}` environnement variable")]
pub struct MissingSecret(pub &'static str);

impl Secrets {
    /// Read every secret, failing on the first mandatory one missing.
    pub fn from_env(current_version: u8) -> Result<Self, MissingSecret> {
        let required = |name: &'static str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .ok_or(MissingSecret(name))
        };
        let optional = |name: &str| {
            std::env::var(name).ok().filter(|value| !value.is_empty())
        };

        let retired_keys = (1..current_version)
            .filter_map(|version| {
                optional(&format!("RETIRED_KEY_{version}"))
                    .map(|key| (version, key))
            })
            .collect();

        Ok(Self {
            key: required("KEY")?,
            salt: required("SALT")?,
            retired_keys,
            token_secret: required("TOKEN_SECRET")?,
            sendgrid_api_key: optional("SENDGRID_API_KEY"),
            stripe_secret_key: optional("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),
        })
    }
}
