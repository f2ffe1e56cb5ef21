//! Personalized installer generation and time-boxed delivery.

mod builder;
mod delivery;
mod repository;

pub use builder::*;
pub use delivery::*;
pub use repository::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::AsRefStr;
use uuid::Uuid;

/// How long a download link stays valid.
pub const ARTIFACT_TTL_HOURS: i64 = 24;
/// Maximum artifacts listed per account.
pub const STATUS_LIMIT: i64 = 10;

/// Generated installer as saved on database.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct GeneratedArtifact {
    pub id: Uuid,
    pub account_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub download_token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub download_count: i32,
}

/// Artifact metadata shown to its owner.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub id: Uuid,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub download_count: i32,
    /// Derived at read time, never stored.
    pub expired: bool,
}

impl ArtifactSummary {
    pub fn new(artifact: GeneratedArtifact, now: DateTime<Utc>) -> Self {
        Self {
            id: artifact.id,
            expired: artifact.expires_at <= now,
            file_name: artifact.file_name,
            created_at: artifact.created_at,
            expires_at: artifact.expires_at,
            download_count: artifact.download_count,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    GenerateInstaller,
    DownloadInstaller,
}

/// One generate or download attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEntry {
    /// Unknown when a download token matched nothing.
    pub account_id: Option<Uuid>,
    pub action: AuditAction,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
