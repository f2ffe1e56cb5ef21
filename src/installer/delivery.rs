//! One-time download links for generated installers.
//!
//! Links are opaque random tokens, reusable until they expire. Unknown and
//! expired tokens are indistinguishable to callers.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::crypto::random_token;
use crate::error::{Result, ServerError};
use crate::installer::{
    ARTIFACT_TTL_HOURS, ArtifactRepository, ArtifactSummary, AuditAction,
    AuditEntry, GeneratedArtifact, STATUS_LIMIT,
};

/// Download link of a freshly stored artifact.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub download_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Artifact served to a download.
#[derive(Debug)]
pub struct Download {
    pub account_id: Uuid,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Artifact storage and download links.
#[derive(Clone)]
pub struct DeliveryGateway {
    repo: Arc<dyn ArtifactRepository>,
    storage: PathBuf,
    clock: Arc<dyn Clock>,
}

impl DeliveryGateway {
    /// Create a new [`DeliveryGateway`] writing under `storage`.
    pub fn new(
        repo: Arc<dyn ArtifactRepository>,
        storage: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            storage: storage.into(),
            clock,
        }
    }

    /// Store an artifact and mint its download link.
    pub async fn publish(
        &self,
        account_id: Uuid,
        content: &[u8],
        file_name: &str,
    ) -> Result<Published> {
        tokio::fs::create_dir_all(&self.storage).await?;

        let now = self.clock.now().trunc_subsecs(6);
        let id = Uuid::new_v4();
        // Several artifacts of a day share their file name.
        let path = self.storage.join(format!("{id}-{file_name}"));
        tokio::fs::write(&path, content).await?;

        let artifact = GeneratedArtifact {
            id,
            account_id,
            file_name: file_name.to_owned(),
            file_path: path.to_string_lossy().into_owned(),
            download_token: random_token(),
            expires_at: now + Duration::hours(ARTIFACT_TTL_HOURS),
            created_at: now,
            download_count: 0,
        };

        if let Err(err) = self.repo.insert(&artifact).await {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(error = %err, path = %path.display(), "orphan artifact left on disk");
            }
            return Err(err);
        }

        metrics::counter!("installers_generated_total").increment(1);
        tracing::info!(%account_id, artifact_id = %id, "installer published");

        Ok(Published {
            download_token: artifact.download_token,
            expires_at: artifact.expires_at,
        })
    }

    /// Serve the artifact behind `download_token` and count the download.
    pub async fn fetch(&self, download_token: &str) -> Result<Download> {
        let artifact = self
            .repo
            .claim(download_token, self.clock.now())
            .await?
            .ok_or(ServerError::NotFound)?;

        let bytes = match tokio::fs::read(&artifact.file_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(artifact_id = %artifact.id, "artifact missing from storage");
                return Err(ServerError::NotFound);
            },
            Err(err) => return Err(err.into()),
        };

        metrics::counter!("installer_downloads_total").increment(1);

        Ok(Download {
            account_id: artifact.account_id,
            file_name: artifact.file_name,
            bytes,
        })
    }

    /// Latest artifacts of an account, most recent first.
    pub async fn list_for_account(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<ArtifactSummary>> {
        let now = self.clock.now();
        Ok(self
            .repo
            .list_for_account(account_id, STATUS_LIMIT)
            .await?
            .into_iter()
            .map(|artifact| ArtifactSummary::new(artifact, now))
            .collect())
    }

    /// Record an attempt. Never fails the request.
    pub async fn audit<T>(
        &self,
        account_id: Option<Uuid>,
        action: AuditAction,
        outcome: &Result<T>,
    ) {
        let entry = AuditEntry {
            account_id,
            action,
            success: outcome.is_ok(),
            error_message: outcome.as_ref().err().map(ToString::to_string),
            created_at: self.clock.now().trunc_subsecs(6),
        };

        if let Err(err) = self.repo.audit(&entry).await {
            tracing::warn!(error = %err, action = action.as_ref(), "audit entry dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::database::memory::MemoryArtifacts;

    struct Fixture {
        gateway: DeliveryGateway,
        repo: Arc<MemoryArtifacts>,
        clock: Arc<FixedClock>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(MemoryArtifacts::default());
        let clock = Arc::new(FixedClock::default_instant());

        Fixture {
            gateway: DeliveryGateway::new(
                repo.clone(),
                dir.path().join("installers"),
                clock.clone(),
            ),
            repo,
            clock,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let fx = fixture();
        let account_id = Uuid::new_v4();

        let published = fx
            .gateway
            .publish(account_id, b"@echo off", "setup.bat")
            .await
            .unwrap();
        assert_eq!(published.download_token.len(), 64);
        assert_eq!(published.expires_at, fx.clock.now() + Duration::hours(24));

        let download = fx.gateway.fetch(&published.download_token).await.unwrap();
        assert_eq!(download.account_id, account_id);
        assert_eq!(download.file_name, "setup.bat");
        assert_eq!(download.bytes, b"@echo off");

        // Reusable within the window, every download counted.
        fx.gateway.fetch(&published.download_token).await.unwrap();
        let listed = fx.gateway.list_for_account(account_id).await.unwrap();
        assert_eq!(listed[0].download_count, 2);
        assert!(!listed[0].expired);
    }

    #[tokio::test]
    async fn test_expired_looks_unknown() {
        let fx = fixture();
        let published = fx
            .gateway
            .publish(Uuid::new_v4(), b"x", "setup.bat")
            .await
            .unwrap();

        fx.clock.advance(Duration::hours(24));

        assert!(matches!(
            fx.gateway.fetch(&published.download_token).await,
            Err(ServerError::NotFound)
        ));
        assert!(matches!(
            fx.gateway.fetch("deadbeef").await,
            Err(ServerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_tokens_are_distinct() {
        let fx = fixture();
        let id = Uuid::new_v4();

        let first = fx.gateway.publish(id, b"a", "same.bat").await.unwrap();
        let second = fx.gateway.publish(id, b"b", "same.bat").await.unwrap();
        assert_ne!(first.download_token, second.download_token);

        // Same file name, distinct contents.
        assert_eq!(fx.gateway.fetch(&first.download_token).await.unwrap().bytes, b"a");
        assert_eq!(fx.gateway.fetch(&second.download_token).await.unwrap().bytes, b"b");
    }

    #[tokio::test]
    async fn test_list_is_bounded_and_ordered() {
        let fx = fixture();
        let id = Uuid::new_v4();

        for i in 0..12 {
            fx.gateway
                .publish(id, b"x", &format!("{i}.bat"))
                .await
                .unwrap();
            fx.clock.advance(Duration::minutes(1));
        }
        fx.gateway.publish(Uuid::new_v4(), b"x", "other.bat").await.unwrap();

        let listed = fx.gateway.list_for_account(id).await.unwrap();
        assert_eq!(listed.len(), 10);
        assert_eq!(listed[0].file_name, "11.bat");
        assert_eq!(listed[9].file_name, "2.bat");
    }

    #[tokio::test]
    async fn test_failed_insert_removes_file() {
        let fx = fixture();
        fx.repo.fail_inserts(true);

        assert!(fx.gateway.publish(Uuid::new_v4(), b"x", "a.bat").await.is_err());

        let mut entries = tokio::fs::read_dir(&fx.gateway.storage).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_audit() {
        let fx = fixture();
        let id = Uuid::new_v4();

        fx.gateway
            .audit(Some(id), AuditAction::GenerateInstaller, &Ok::<_, ServerError>(()))
            .await;
        fx.gateway
            .audit::<()>(None, AuditAction::DownloadInstaller, &Err(ServerError::NotFound))
            .await;

        let entries = fx.repo.audit_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].success);
        assert_eq!(entries[0].account_id, Some(id));
        assert!(!entries[1].success);
        assert_eq!(entries[1].error_message.as_deref(), Some("resource not found"));
    }
}
