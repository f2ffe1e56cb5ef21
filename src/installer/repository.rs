//! Storage port for generated installers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::installer::{AuditEntry, GeneratedArtifact};

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    async fn insert(&self, artifact: &GeneratedArtifact) -> Result<()>;

    /// Find an artifact still valid at `now` and count one download.
    async fn claim(
        &self,
        download_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GeneratedArtifact>>;

    /// Most recent artifacts first.
    async fn list_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<GeneratedArtifact>>;

    async fn audit(&self, entry: &AuditEntry) -> Result<()>;
}
