//! run settings loaded from a TOML file
//!
//! the directory section carries the endpoint, the two bind credential sets
//! and the container layout, the schema section the numbering scheme and
//! the optional downstream section the consuming application's API

use std::path::{Path, PathBuf};

use dirs2::home_dir;
use ldap3::dn_escape;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::connection::ConnectParameters;
use crate::groups::PLACEHOLDER_MEMBER_CN;
use crate::migrate::DownstreamSettings;
use crate::schema::SchemaConfig;

/// default name of the people sub-container
fn default_people_ou() -> String {
    "people".to_string()
}

/// default name of the groups sub-container
fn default_groups_ou() -> String {
    "groups".to_string()
}

/// default connect timeout in seconds
fn default_connect_timeout_secs() -> u64 {
    30
}

/// one bind credential set
#[derive(Debug, Clone, Deserialize)]
pub struct BindCredentials {
    /// the DN to bind as
    pub dn: String,
    /// the password for the bind DN
    pub password: String,
}

/// where the directory lives and how to talk to it
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySettings {
    /// the LDAP URL to connect to
    pub url: String,
    /// the base DN everything is provisioned under
    pub base_dn: String,
    /// name of the sub-container holding user entries
    #[serde(default = "default_people_ou")]
    pub people_ou: String,
    /// name of the sub-container holding group entries
    #[serde(default = "default_groups_ou")]
    pub groups_ou: String,
    /// the entry-administration credential set
    pub entry_bind: BindCredentials,
    /// the schema-administration credential set, the entry bind is reused
    /// when unset
    #[serde(default)]
    pub schema_bind: Option<BindCredentials>,
    /// CA certificate path for servers with a private CA
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// skip certificate verification, only acceptable against test servers
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
    /// connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl DirectorySettings {
    /// connect parameters with the given credential set
    fn connect_parameters(&self, bind: &BindCredentials) -> ConnectParameters {
        ConnectParameters {
            url: self.url.clone(),
            bind_dn: bind.dn.clone(),
            bind_password: bind.password.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            danger_accept_invalid_certs: self.danger_accept_invalid_certs,
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }

    /// connect parameters for the entry-administration phases
    pub fn entry_connect(&self) -> ConnectParameters {
        self.connect_parameters(&self.entry_bind)
    }

    /// connect parameters for the schema-administration phase
    pub fn schema_connect(&self) -> ConnectParameters {
        self.connect_parameters(self.schema_bind.as_ref().unwrap_or(&self.entry_bind))
    }

    /// DN of the people container
    pub fn people_dn(&self) -> String {
        format!("ou={},{}", dn_escape(&self.people_ou), self.base_dn)
    }

    /// DN of the groups container
    pub fn groups_dn(&self) -> String {
        format!("ou={},{}", dn_escape(&self.groups_ou), self.base_dn)
    }

    /// DN of a user entry, also the fully-qualified member identifier used
    /// in group entries
    pub fn user_dn(&self, username: &str) -> String {
        format!("uid={},{}", dn_escape(username), self.people_dn())
    }

    /// DN of a group entry
    pub fn group_dn(&self, name: &str) -> String {
        format!("cn={},{}", dn_escape(name), self.groups_dn())
    }

    /// DN of the placeholder member tolerated in otherwise empty groups
    pub fn placeholder_member_dn(&self) -> String {
        format!("cn={},{}", PLACEHOLDER_MEMBER_CN, self.groups_dn())
    }
}

/// everything one provisioning run needs to know
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerSettings {
    /// the directory endpoint and layout
    pub directory: DirectorySettings,
    /// the schema numbering scheme
    pub schema: SchemaConfig,
    /// the downstream application's API, migration and group registration
    /// are skipped when unset
    #[serde(default)]
    pub downstream: Option<DownstreamSettings>,
}

/// error which can happen while reading settings from a file
#[derive(Debug, Error)]
pub enum TomlConfigError {
    /// an I/O error
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// an error deserializing the TOML file
    #[error("Toml deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),
    /// neither an explicit path nor a home directory to derive the default
    /// path from
    #[error("no configuration file path available")]
    NoConfigPath,
}

/// load provisioner settings from a toml file
#[instrument]
pub fn toml_settings(filename: &Path) -> Result<ProvisionerSettings, TomlConfigError> {
    let config = std::fs::read_to_string(filename)?;
    let result: ProvisionerSettings = toml::from_str(&config)?;
    Ok(result)
}

/// the default settings path in the user's home directory
pub fn default_settings_path() -> Option<PathBuf> {
    home_dir().map(|mut d| {
        d.push(".config");
        d.push("ldap-provisioner");
        d.push("config.toml");
        d
    })
}

/// load settings from the given path, falling back to the default path
#[instrument]
pub fn load_settings(explicit: Option<&Path>) -> Result<ProvisionerSettings, TomlConfigError> {
    match explicit {
        Some(path) => toml_settings(path),
        None => {
            let path = default_settings_path().ok_or(TomlConfigError::NoConfigPath)?;
            tracing::debug!("Using settings at {:?}", path);
            toml_settings(&path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
        [directory]
        url = "ldaps://directory.example.org:636"
        base_dn = "dc=example,dc=org"

        [directory.entry_bind]
        dn = "cn=admin,dc=example,dc=org"
        password = "entry-secret"

        [directory.schema_bind]
        dn = "cn=config-admin,cn=config"
        password = "schema-secret"

        [schema]
        oid_prefix = "1.3.6.1.4.1.99999.1"

        [downstream]
        base_url = "https://app.example.org"
        api_token = "token"
    "#;

    fn settings() -> ProvisionerSettings {
        toml::from_str(SETTINGS).expect("settings should deserialize")
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings = settings();
        assert_eq!(settings.directory.people_ou, "people");
        assert_eq!(settings.directory.groups_ou, "groups");
        assert_eq!(settings.schema.attribute_oid_start, 100);
        assert_eq!(settings.schema.auxiliary_class_name, "provisionedPerson");
        assert!(settings.downstream.is_some());
    }

    #[test]
    fn schema_bind_is_used_for_schema_phase() {
        let settings = settings();
        let entry = settings.directory.entry_connect();
        let schema = settings.directory.schema_connect();
        assert_eq!(entry.bind_dn, "cn=admin,dc=example,dc=org");
        assert_eq!(schema.bind_dn, "cn=config-admin,cn=config");
    }

    #[test]
    fn schema_phase_falls_back_to_entry_bind() {
        let mut settings = settings();
        settings.directory.schema_bind = None;
        let schema = settings.directory.schema_connect();
        assert_eq!(schema.bind_dn, "cn=admin,dc=example,dc=org");
    }

    #[test]
    fn dns_are_constructed_and_escaped() {
        let settings = settings();
        assert_eq!(
            settings.directory.user_dn("alice"),
            "uid=alice,ou=people,dc=example,dc=org"
        );
        assert_eq!(
            settings.directory.group_dn("alpha"),
            "cn=alpha,ou=groups,dc=example,dc=org"
        );
        // a username with a DN special character must not break the DN
        let escaped = settings.directory.user_dn("al,ice");
        assert!(escaped.starts_with("uid=al\\"));
    }
}
