//! the orchestration call driving one provisioning run
//!
//! validation runs first and aborts before any directory contact, then the
//! phases run in order: schema, structure, users, groups, migration, each
//! on its own connection which is unbound on phase exit and never reused
//! across phases

use thiserror::Error;
use tracing::instrument;

use crate::connection::{connect_with_parameters, ConnectError};
use crate::descriptor::{validate_plan, ProvisioningPlan, ValidationError};
use crate::groups::sync_group;
use crate::migrate::{
    migrate_to_directory_auth, trigger_downstream_sync, IdentityBackend, MigrateError,
    MigrationSummary,
};
use crate::provision::{ensure_structure, provision_user, ProvisionError, ProvisionOutcome};
use crate::schema::{derive_schema_elements, ensure_schema, SchemaError, SchemaSummary};
use crate::settings::ProvisionerSettings;

/// error which aborts a provisioning run
#[derive(Debug, Error)]
pub enum PipelineError {
    /// the plan failed pre-flight validation, nothing was attempted
    #[error("validation error: {0}")]
    ValidationError(#[from] ValidationError),
    /// a phase could not connect or bind
    #[error("connect error: {0}")]
    ConnectError(#[from] ConnectError),
    /// the schema phase failed
    #[error("schema extension error: {0}")]
    SchemaError(#[from] SchemaError),
    /// the structure phase failed
    #[error("structure provisioning error: {0}")]
    StructureError(#[from] ProvisionError),
    /// the downstream sync trigger failed, the run is incomplete
    #[error("downstream sync error: {0}")]
    DownstreamSyncError(#[from] MigrateError),
}

/// what one provisioning run did
#[derive(Debug, Clone, Default)]
pub struct ProvisioningReport {
    /// schema elements created and skipped
    pub schema: SchemaSummary,
    /// container DNs the structure phase had to create
    pub structure_created: Vec<String>,
    /// user entries created
    pub users_created: usize,
    /// user entries that already existed
    pub users_skipped: usize,
    /// user entries that failed, the batch continued past them
    pub users_failed: usize,
    /// group entries created
    pub groups_created: usize,
    /// members added across all groups
    pub members_added: usize,
    /// members removed across all groups
    pub members_removed: usize,
    /// groups that failed to synchronize
    pub groups_failed: usize,
    /// migration counts, None when no downstream backend was supplied
    pub migration: Option<MigrationSummary>,
}

impl ProvisioningReport {
    /// whether the run completed without any per-item failure
    pub fn is_success(&self) -> bool {
        self.users_failed == 0
            && self.groups_failed == 0
            && self.migration.map_or(true, |m| m.failed == 0)
    }
}

/// run the full provisioning pipeline against the configured directory
///
/// per-user and per-group failures are logged and counted without aborting
/// the batch, fatal categories (validation, bind, schema, structure,
/// downstream sync) abort the remaining phases, partial changes are not
/// rolled back
#[instrument(skip(settings, plan, downstream))]
pub async fn run_provisioning(
    settings: &ProvisionerSettings,
    plan: &ProvisioningPlan,
    downstream: Option<&dyn IdentityBackend>,
) -> Result<ProvisioningReport, PipelineError> {
    validate_plan(plan)?;
    derive_schema_elements(&settings.schema, &plan.attributes)?;

    let mut report = ProvisioningReport::default();

    // schema phase, privileged bind
    {
        let mut ldap = connect_with_parameters(&settings.directory.schema_connect()).await?;
        let result = ensure_schema(&mut ldap, &settings.schema, &plan.attributes).await;
        let _ = ldap.unbind().await;
        report.schema = result?;
    }

    // structure phase
    {
        let mut ldap = connect_with_parameters(&settings.directory.entry_connect()).await?;
        let result = ensure_structure(&mut ldap, &settings.directory).await;
        let _ = ldap.unbind().await;
        report.structure_created = result?;
    }

    // user phase, per-entry failures do not abort the batch
    {
        let mut ldap = connect_with_parameters(&settings.directory.entry_connect()).await?;
        for user in &plan.users {
            match provision_user(&mut ldap, &settings.directory, &settings.schema, user).await {
                Ok(ProvisionOutcome::Created) => report.users_created += 1,
                Ok(ProvisionOutcome::AlreadyPresent) => report.users_skipped += 1,
                Err(err) => {
                    tracing::warn!("Failed to provision user {}: {}", user.username, err);
                    report.users_failed += 1;
                }
            }
        }
        let _ = ldap.unbind().await;
    }

    // group phase, per-group failures do not abort the batch
    {
        let mut ldap = connect_with_parameters(&settings.directory.entry_connect()).await?;
        for group in &plan.groups {
            match sync_group(&mut ldap, &settings.directory, &settings.schema, group).await {
                Ok(outcome) => {
                    if outcome.created {
                        report.groups_created += 1;
                    }
                    report.members_added += outcome.added;
                    report.members_removed += outcome.removed;
                    if let Some(backend) = downstream {
                        // the directory state is already correct, a failed
                        // registry link is a warning, not a failure
                        if let Err(err) = backend.register_group(group).await {
                            tracing::warn!(
                                "Failed to register group {} downstream: {}",
                                group.name,
                                err
                            );
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("Failed to synchronize group {}: {}", group.name, err);
                    report.groups_failed += 1;
                }
            }
        }
        let _ = ldap.unbind().await;
    }

    // migration phase
    if let Some(backend) = downstream {
        let usernames: Vec<String> = plan.users.iter().map(|u| u.username.clone()).collect();
        report.migration = Some(migrate_to_directory_auth(backend, &usernames).await);
        trigger_downstream_sync(backend).await?;
    }

    tracing::debug!(
        "Provisioning run finished: {} schema elements created, {} skipped, \
         {} users created, {} groups created, {} members added, {} removed",
        report.schema.created.len(),
        report.schema.skipped.len(),
        report.users_created,
        report.groups_created,
        report.members_added,
        report.members_removed,
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::descriptor::{AttributeDescriptor, AttributeValueKind, DirectoryUser};
    use crate::schema::SchemaConfig;
    use crate::settings::{BindCredentials, DirectorySettings};

    fn unreachable_settings() -> ProvisionerSettings {
        ProvisionerSettings {
            directory: DirectorySettings {
                url: "ldap://127.0.0.1:1".to_string(),
                base_dn: "dc=example,dc=org".to_string(),
                people_ou: "people".to_string(),
                groups_ou: "groups".to_string(),
                entry_bind: BindCredentials {
                    dn: "cn=admin,dc=example,dc=org".to_string(),
                    password: "secret".to_string(),
                },
                schema_bind: None,
                ca_cert_path: None,
                danger_accept_invalid_certs: false,
                connect_timeout_secs: 1,
            },
            schema: SchemaConfig {
                oid_prefix: "1.3.6.1.4.1.99999.1".to_string(),
                auxiliary_class_name: "provisionedPerson".to_string(),
                auxiliary_class_oid: 2,
                reserved_attribute_oid: 1,
                attribute_oid_start: 100,
                schema_entry_dn: None,
            },
            downstream: None,
        }
    }

    #[tokio::test]
    async fn validation_failures_abort_before_any_connection() {
        let descriptor = AttributeDescriptor {
            name: "rank".to_string(),
            display_name: "Rank".to_string(),
            value_type: AttributeValueKind::Text,
            directory_attribute: Some("rank".to_string()),
            required: false,
        };
        let user = DirectoryUser {
            username: "alice".to_string(),
            email: "alice@example.org".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Example".to_string(),
            credential: None,
            title: None,
            custom_attributes: HashMap::from([("rank".to_string(), "x".repeat(70))]),
        };
        let plan = ProvisioningPlan {
            attributes: vec![descriptor],
            users: vec![user],
            groups: vec![],
        };
        // the configured endpoint is unreachable, so anything but an
        // immediate validation error would surface as a connect error
        let result = run_provisioning(&unreachable_settings(), &plan, None).await;
        assert!(matches!(result, Err(PipelineError::ValidationError(_))));
    }

    #[test]
    fn report_success_requires_zero_failures() {
        let mut report = ProvisioningReport::default();
        assert!(report.is_success());
        report.users_failed = 1;
        assert!(!report.is_success());
        report.users_failed = 0;
        report.migration = Some(MigrationSummary {
            succeeded: 3,
            failed: 1,
            skipped: 0,
        });
        assert!(!report.is_success());
    }
}
