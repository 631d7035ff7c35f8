//! connection setup and the low-level search/result helpers shared by every
//! provisioning phase
//!
//! each logical phase of a run opens its own connection with the credential
//! set appropriate for it (schema administration versus entry
//! administration) and unbinds it on phase exit, a connection is never
//! reused across phases

use std::fmt::Debug;
use std::fmt::Display;
use std::fs::File;
use std::io::Read;
use std::time::Duration;

use derive_builder::Builder;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use native_tls::{Certificate, TlsConnector};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

/// result code returned when the search base does not exist
pub(crate) const RC_NO_SUCH_OBJECT: u32 = 32;

/// result code returned when an added attribute value is already present
pub(crate) const RC_ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;

/// result code returned when an added entry already exists
pub(crate) const RC_ENTRY_ALREADY_EXISTS: u32 = 68;

/// default connect timeout in seconds
fn default_connect_timeout_secs() -> u64 {
    30
}

/// a set of parameters for one bound connection to the directory server
#[derive(Debug, Clone, Builder, Deserialize)]
pub struct ConnectParameters {
    /// the LDAP URL to connect to
    pub url: String,
    /// the DN to bind as
    pub bind_dn: String,
    /// the password for the bind DN
    pub bind_password: String,
    /// CA certificate path for servers with a private CA
    #[builder(default)]
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// skip certificate verification, only acceptable against test servers
    #[builder(default)]
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
    /// connect timeout in seconds
    #[builder(default = "30")]
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// errors which can happen when connecting to the directory server
#[derive(Debug, Error)]
pub enum ConnectError {
    /// an error when building the parameters
    #[error("Parameters builder error: {0}")]
    ParametersBuilderError(#[from] ConnectParametersBuilderError),
    /// an I/O error reading the CA certificate
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// an error in the native_tls crate
    #[error("Native TLS error: {0}")]
    NativeTLSError(#[from] native_tls::Error),
    /// an error in the ldap3 crate, including bind failures
    #[error("ldap3 Ldap error: {0}")]
    LdapError(#[from] ldap3::LdapError),
}

/// an error during normal ldap operations (search, add, modify, ...)
#[derive(Debug, Error)]
pub enum LdapOperationError {
    /// an error in the ldap3 library
    #[error("ldap3 Ldap error: {0}")]
    LdapError(#[from] ldap3::LdapError),
}

/// connect to the directory server and bind with the given credential set
///
/// the returned connection is expected to be unbound by the caller when its
/// phase ends
#[instrument(skip(connect_parameters), fields(url = %connect_parameters.url, bind_dn = %connect_parameters.bind_dn))]
pub async fn connect_with_parameters(
    connect_parameters: &ConnectParameters,
) -> Result<Ldap, ConnectError> {
    let mut tls_builder = TlsConnector::builder();
    if let Some(ca_cert_path) = &connect_parameters.ca_cert_path {
        let mut ca_cert_contents = Vec::new();
        {
            let mut file = File::open(ca_cert_path)?;
            file.read_to_end(&mut ca_cert_contents)?;
        }
        tls_builder.add_root_certificate(Certificate::from_pem(&ca_cert_contents)?);
    }
    if connect_parameters.danger_accept_invalid_certs {
        tls_builder.danger_accept_invalid_certs(true);
    }
    let connector = tls_builder.build()?;
    let ldap_settings = LdapConnSettings::new()
        .set_connector(connector)
        .set_conn_timeout(Duration::from_secs(connect_parameters.connect_timeout_secs));
    let (ldap_conn_async, mut ldap) =
        LdapConnAsync::with_settings(ldap_settings, &connect_parameters.url).await?;
    ldap3::drive!(ldap_conn_async);
    ldap.simple_bind(
        &connect_parameters.bind_dn,
        &connect_parameters.bind_password,
    )
    .await?
    .success()?;
    tracing::debug!("Bound to {} as {}", connect_parameters.url, connect_parameters.bind_dn);
    Ok(ldap)
}

/// perform a paged LDAP search, logging a reproduction command on failure
/// and returning already-constructed search entries
///
/// a missing search base is reported as an empty result so existence checks
/// can use this directly, every other non-zero result code is an error
pub async fn ldap_search<'a, S>(
    ldap: &mut Ldap,
    base: &str,
    scope: Scope,
    filter: &str,
    attrs: Vec<S>,
) -> Result<Vec<SearchEntry>, LdapOperationError>
where
    S: AsRef<str> + Clone + Display + Debug + Send + Sync,
    Vec<S>: AsRef<[S]> + Send + Sync + 'a,
{
    let adapter: ldap3::adapters::PagedResults<S, Vec<S>> = ldap3::adapters::PagedResults::new(100);
    let mut search_stream = ldap
        .streaming_search_with(adapter, base, scope, filter, attrs.clone())
        .await?;
    let mut rs = Vec::new();
    while let Some(entry) = search_stream.next().await? {
        rs.push(entry);
    }
    let res = search_stream.finish().await;
    if res.rc != 0 && res.rc != RC_NO_SUCH_OBJECT {
        tracing::debug!(
            "Non-zero return code {} in LDAP query\n  base: {}\n  scope: {:?}\n  filter: {}",
            res.rc,
            base,
            scope,
            filter,
        );
        tracing::debug!(
            "ldapsearch -Q -LLL -E pr=100/noprompt -o ldif-wrap=no -b '{}' -s {} '{}' {}",
            base,
            format!("{:?}", scope).to_lowercase(),
            filter,
            itertools::join(attrs.iter(), " ")
        );
        return Err(ldap3::LdapError::from(res).into());
    }
    Ok(rs.into_iter().map(SearchEntry::construct).collect())
}

/// search for at most one entry, the common case for the base-scope lookups
/// the provisioner performs
pub async fn search_one<'a, S>(
    ldap: &mut Ldap,
    base: &str,
    filter: &str,
    attrs: Vec<S>,
) -> Result<Option<SearchEntry>, LdapOperationError>
where
    S: AsRef<str> + Clone + Display + Debug + Send + Sync,
    Vec<S>: AsRef<[S]> + Send + Sync + 'a,
{
    let mut it = ldap_search(ldap, base, Scope::Base, filter, attrs)
        .await?
        .into_iter();
    Ok(it.next())
}

/// check whether an entry exists at the given DN
#[instrument(skip(ldap))]
pub async fn entry_exists(ldap: &mut Ldap, dn: &str) -> Result<bool, LdapOperationError> {
    Ok(search_one(ldap, dn, "(objectClass=*)", vec!["objectClass"])
        .await?
        .is_some())
}

/// verify that the server answers a root DSE search on this connection
#[instrument(skip(ldap))]
pub async fn check_connection(ldap: &mut Ldap) -> Result<(), LdapOperationError> {
    search_one(ldap, "", "(objectClass=*)", vec!["supportedLDAPVersion"]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let parameters = ConnectParametersBuilder::default()
            .url("ldaps://directory.example.org:636".to_string())
            .bind_dn("cn=admin,dc=example,dc=org".to_string())
            .bind_password("secret".to_string())
            .build()
            .expect("builder should succeed");
        assert_eq!(parameters.connect_timeout_secs, 30);
        assert!(parameters.ca_cert_path.is_none());
        assert!(!parameters.danger_accept_invalid_certs);
    }

    #[test]
    fn builder_requires_url() {
        let result = ConnectParametersBuilder::default()
            .bind_dn("cn=admin,dc=example,dc=org".to_string())
            .bind_password("secret".to_string())
            .build();
        assert!(result.is_err());
    }
}
