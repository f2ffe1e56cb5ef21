//! Send transactional emails.
//!
//! Two providers share the [`Mailer`] port:
//! 1. SendGrid v3 API,
//! 2. a mock which only logs the message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::account::Plan;
use crate::config::{Mail, MailProvider};

const SENDGRID_API_URL: &str = "https://api.sendgrid.com/v3/mail/send";
const MESSAGE_ID_HEADER: &str = "X-Message-Id";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum MailError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("provider answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A message ready to be sent.
#[derive(Clone, Debug, PartialEq)]
pub struct Email {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

/// Provider receipt.
#[derive(Clone, Debug, PartialEq)]
pub struct Sent {
    pub message_id: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<Sent, MailError>;
}

/// Build the mailer selected in configuration.
pub fn from_config(
    config: &Mail,
    api_key: Option<String>,
) -> Arc<dyn Mailer> {
    match (config.provider, api_key) {
        (MailProvider::Sendgrid, Some(api_key)) => Arc::new(
            SendGridMailer::new(api_key, &config.from_email, &config.from_name),
        ),
        (MailProvider::Sendgrid, None) => {
            tracing::warn!(
                "missing `SENDGRID_API_KEY` environnement variable, emails are mocked"
            );
            Arc::new(MockMailer)
        },
        (MailProvider::Mock, _) => Arc::new(MockMailer),
    }
}

/// Log-only mailer.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockMailer;

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, email: &Email) -> Result<Sent, MailError> {
        let message_id = format!("mock_{}", uuid::Uuid::new_v4().simple());
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            %message_id,
            "mock email sent"
        );

        Ok(Sent { message_id })
    }
}

#[derive(Serialize)]
struct SendGridAddress<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct SendGridPersonalization<'a> {
    to: Vec<SendGridAddress<'a>>,
}

#[derive(Serialize)]
struct SendGridContent<'a> {
    r#type: &'static str,
    value: &'a str,
}

#[derive(Serialize)]
struct SendGridRequest<'a> {
    personalizations: Vec<SendGridPersonalization<'a>>,
    from: SendGridAddress<'a>,
    subject: &'a str,
    content: Vec<SendGridContent<'a>>,
}

/// SendGrid v3 API mailer.
pub struct SendGridMailer {
    client: Client,
    api_key: String,
    from_email: String,
    from_name: String,
    endpoint: String,
}

impl SendGridMailer {
    /// Create a new [`SendGridMailer`].
    pub fn new(api_key: String, from_email: &str, from_name: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            from_email: from_email.to_owned(),
            from_name: from_name.to_owned(),
            endpoint: SENDGRID_API_URL.to_owned(),
        }
    }

    fn body<'a>(&'a self, email: &'a Email) -> SendGridRequest<'a> {
        // text/plain must come before text/html.
        let mut content = Vec::with_capacity(2);
        if let Some(text) = &email.text {
            content.push(SendGridContent {
                r#type: "text/plain",
                value: text,
            });
        }
        content.push(SendGridContent {
            r#type: "text/html",
            value: &email.html,
        });

        SendGridRequest {
            personalizations: vec![SendGridPersonalization {
                to: vec![SendGridAddress {
                    email: &email.to,
                    name: email.to_name.as_deref(),
                }],
            }],
            from: SendGridAddress {
                email: &self.from_email,
                name: Some(&self.from_name),
            },
            subject: &email.subject,
            content,
        }
    }
}

#[async_trait]
impl Mailer for SendGridMailer {
    async fn send(&self, email: &Email) -> Result<Sent, MailError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.body(email))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let message_id = response
            .headers()
            .get(MESSAGE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("sg_{}", uuid::Uuid::new_v4().simple()));

        tracing::info!(to = %email.to, %message_id, "email sent");

        Ok(Sent { message_id })
    }
}

fn plan_label(plan: Plan) -> &'static str {
    match plan {
        Plan::FreeTrial => "Free Trial (7 days)",
        Plan::Professional => "Professional",
        Plan::Enterprise => "Enterprise",
    }
}

/// Escape text interpolated into an HTML body.
fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Welcome message pointing at the installer page.
pub fn welcome(
    to: &str,
    name: &str,
    plan: &str,
    download_url: &str,
    product_name: &str,
) -> Email {
    let subject = format!("Welcome to {product_name}, your installer is ready");
    let html = format!(
        "<h1>Welcome {}!</h1>\
         <p>Your <strong>{}</strong> subscription is active.</p>\
         <p><a href=\"{}\">Download your personalized installer</a></p>\
         <p>This link is valid for 24 hours.</p>",
        escape_html(name),
        escape_html(plan),
        escape_html(download_url),
    );
    let text = format!(
        "Welcome {name}!\n\n\
         Your {plan} subscription is active.\n\
         Download your personalized installer: {download_url}\n\
         This link is valid for 24 hours.\n"
    );

    Email {
        to: to.to_owned(),
        to_name: Some(name.to_owned()),
        subject,
        html,
        text: Some(text),
    }
}

/// Nudge for users who have not downloaded their installer yet.
pub fn reminder(
    to: &str,
    name: &str,
    download_url: &str,
    product_name: &str,
) -> Email {
    let subject = format!("Reminder: download your {product_name} installer");
    let html = format!(
        "<h2>Don't forget your installer!</h2>\
         <p>Hi <strong>{}</strong>,</p>\
         <p>You have not downloaded your personalized {} installer yet.</p>\
         <p><a href=\"{}\">Download now</a></p>\
         <p>The link expires in a few hours.</p>",
        escape_html(name),
        escape_html(product_name),
        escape_html(download_url),
    );
    let text = format!(
        "Don't forget your {product_name} installer!\n\n\
         Hi {name},\n\n\
         You have not downloaded your personalized installer yet.\n\
         Download now: {download_url}\n\
         The link expires in a few hours.\n"
    );

    Email {
        to: to.to_owned(),
        to_name: Some(name.to_owned()),
        subject,
        html,
        text: Some(text),
    }
}

/// Welcome message sent after a registration.
pub fn welcome_for_plan(
    to: &str,
    name: &str,
    plan: Plan,
    download_url: &str,
    product_name: &str,
) -> Email {
    welcome(to, name, plan_label(plan), download_url, product_name)
}
