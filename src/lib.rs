#![deny(unknown_lints)]
#![deny(renamed_and_removed_lints)]
#![forbid(unsafe_code)]
#![deny(deprecated)]
#![forbid(non_fmt_panics)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![forbid(unused_doc_comments)]
#![forbid(unused_must_use)]
#![deny(while_true)]
#![deny(unused_parens)]
#![deny(redundant_semicolons)]
#![deny(non_ascii_idents)]
#![deny(confusable_idents)]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::cargo_common_metadata)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]
#![deny(clippy::mod_module_files)]
#![doc = include_str!("../README.md")]

pub mod connection;
pub mod descriptor;
pub mod groups;
pub mod ldif;
pub mod migrate;
pub mod pipeline;
pub mod provision;
pub mod schema;
pub mod settings;

pub use connection::{connect_with_parameters, ConnectError, ConnectParameters};
pub use descriptor::{
    extract_records, validate_plan, AttributeDescriptor, AttributeValueKind, DirectoryGroup,
    DirectoryUser, ProvisioningPlan, ProvisioningRecord, ValidationError,
    MAX_ATTRIBUTE_VALUE_LENGTH,
};
pub use groups::{sync_group, GroupSyncError, GroupSyncOutcome, PLACEHOLDER_MEMBER_CN};
pub use ldif::build_ldif;
pub use migrate::{
    migrate_to_directory_auth, trigger_downstream_sync, DownstreamClient, DownstreamSettings,
    IdentityBackend, MigrateError, MigrationSummary,
};
pub use pipeline::{run_provisioning, PipelineError, ProvisioningReport};
pub use provision::{ensure_structure, provision_user, ProvisionError, ProvisionOutcome};
pub use schema::{
    ensure_schema, SchemaConfig, SchemaError, SchemaSummary, RESERVED_UNIQUE_ID_ATTRIBUTE,
};
pub use settings::{
    default_settings_path, load_settings, toml_settings, BindCredentials, DirectorySettings,
    ProvisionerSettings, TomlConfigError,
};
