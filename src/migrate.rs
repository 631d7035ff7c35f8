//! the auth migration trigger
//!
//! flips existing identities in the downstream application over to
//! directory-backed authentication and asks it to refresh its cached view
//! of the directory, per-user failures are counted rather than fatal

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::instrument;
use url::Url;

use crate::descriptor::DirectoryGroup;

/// default request timeout in seconds
fn default_timeout_secs() -> u64 {
    30
}

/// where the downstream application's admin API lives
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamSettings {
    /// base URL of the admin API
    pub base_url: String,
    /// bearer token for the admin API
    pub api_token: String,
    /// request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// error which can happen while talking to the downstream application
#[derive(Debug, Error)]
pub enum MigrateError {
    /// an error in the reqwest HTTP client
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    /// the configured base URL does not parse
    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),
    /// the downstream application rejected a request
    #[error("downstream application rejected {operation} with status {status}")]
    Rejected {
        /// the rejected operation
        operation: &'static str,
        /// the HTTP status code
        status: u16,
    },
}

/// an identity as the downstream application knows it
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityRef {
    /// the downstream identity id
    pub id: String,
    /// the username, the correlation key between directory and downstream
    pub username: String,
}

/// the seam to the downstream identity-aware application
///
/// the crate ships [DownstreamClient] as the HTTP-backed implementation,
/// tests substitute an in-memory one
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// resolve an existing identity by username, None when the identity
    /// does not exist downstream yet
    async fn find_identity(&self, username: &str) -> Result<Option<IdentityRef>, MigrateError>;

    /// point the identity's authentication method at the directory, keyed
    /// by username
    async fn point_identity_at_directory(
        &self,
        identity: &IdentityRef,
    ) -> Result<(), MigrateError>;

    /// request a re-read of directory-backed identities
    async fn refresh_directory_view(&self) -> Result<(), MigrateError>;

    /// link a converged group to the downstream application's own group
    /// registry
    async fn register_group(&self, group: &DirectoryGroup) -> Result<(), MigrateError>;
}

/// HTTP client for the downstream application's admin API
#[derive(Debug)]
pub struct DownstreamClient {
    /// normalized base URL without a trailing slash
    base_url: String,
    /// bearer token
    api_token: String,
    /// the reqwest client
    client: reqwest::Client,
}

impl DownstreamClient {
    /// build a client from settings, validating the base URL once
    pub fn new(settings: &DownstreamSettings) -> Result<Self, MigrateError> {
        Url::parse(&settings.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_token: settings.api_token.clone(),
            client,
        })
    }

    /// absolute URL for an API path
    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl IdentityBackend for DownstreamClient {
    async fn find_identity(&self, username: &str) -> Result<Option<IdentityRef>, MigrateError> {
        let response = self
            .client
            .get(self.endpoint("/api/admin/identities"))
            .bearer_auth(&self.api_token)
            .query(&[("username", username)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MigrateError::Rejected {
                operation: "identity lookup",
                status: response.status().as_u16(),
            });
        }
        let identities: Vec<IdentityRef> = response.json().await?;
        Ok(identities.into_iter().find(|i| i.username == username))
    }

    async fn point_identity_at_directory(
        &self,
        identity: &IdentityRef,
    ) -> Result<(), MigrateError> {
        let response = self
            .client
            .put(self.endpoint(&format!(
                "/api/admin/identities/{}/auth-source",
                identity.id
            )))
            .bearer_auth(&self.api_token)
            .json(&json!({
                "source": "directory",
                "directoryUsername": identity.username,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MigrateError::Rejected {
                operation: "auth source update",
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn refresh_directory_view(&self) -> Result<(), MigrateError> {
        let response = self
            .client
            .post(self.endpoint("/api/admin/directory/refresh"))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MigrateError::Rejected {
                operation: "directory refresh",
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn register_group(&self, group: &DirectoryGroup) -> Result<(), MigrateError> {
        let response = self
            .client
            .post(self.endpoint("/api/admin/groups"))
            .bearer_auth(&self.api_token)
            .json(&json!({
                "name": group.name,
                "uniqueId": group.unique_id,
                "mentionable": group.mentionable,
            }))
            .send()
            .await?;
        // a group registered by an earlier run is not an error
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(MigrateError::Rejected {
                operation: "group registration",
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// per-user outcome counts of one migration batch
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationSummary {
    /// identities switched to directory-backed authentication
    pub succeeded: usize,
    /// identities where the switch failed
    pub failed: usize,
    /// usernames with no downstream identity yet, a non-error
    pub skipped: usize,
}

/// switch the given usernames to directory-backed authentication
///
/// partial success is expected, failures are logged per user and counted,
/// the batch always runs to completion
#[instrument(skip(backend, usernames), fields(count = usernames.len()))]
pub async fn migrate_to_directory_auth(
    backend: &dyn IdentityBackend,
    usernames: &[String],
) -> MigrationSummary {
    let mut summary = MigrationSummary::default();
    for username in usernames {
        match backend.find_identity(username).await {
            Ok(Some(identity)) => match backend.point_identity_at_directory(&identity).await {
                Ok(()) => {
                    tracing::debug!("Migrated {} to directory-backed auth", username);
                    summary.succeeded += 1;
                }
                Err(err) => {
                    tracing::warn!("Failed to migrate {}: {}", username, err);
                    summary.failed += 1;
                }
            },
            Ok(None) => {
                tracing::debug!("No downstream identity for {}, skipping", username);
                summary.skipped += 1;
            }
            Err(err) => {
                tracing::warn!("Failed to look up {}: {}", username, err);
                summary.failed += 1;
            }
        }
    }
    summary
}

/// request a refresh of the downstream application's cached directory view
///
/// failure here is fatal for the run, the provisioning is not considered
/// complete until the downstream application acknowledges the refresh
#[instrument(skip(backend))]
pub async fn trigger_downstream_sync(backend: &dyn IdentityBackend) -> Result<(), MigrateError> {
    backend.refresh_directory_view().await
}
