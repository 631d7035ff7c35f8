//! the directory structure and entry provisioner
//!
//! ensures the base container and the people container exist, then creates
//! user entries that are missing, re-provisioning an existing entry is a
//! no-op rather than a reconciliation

use std::collections::HashSet;

use itertools::Itertools;
use ldap3::Ldap;
use thiserror::Error;
use tracing::instrument;

use crate::connection::{entry_exists, LdapOperationError, RC_ENTRY_ALREADY_EXISTS};
use crate::descriptor::{DirectoryUser, ValidationError};
use crate::schema::SchemaConfig;
use crate::settings::DirectorySettings;

/// whether an entry had to be created or was already there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// the entry was created by this run
    Created,
    /// the entry already existed and was left untouched
    AlreadyPresent,
}

/// error which can happen while provisioning structure or entries
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// an error in the ldap operations performed
    #[error("Ldap operation error: {0}")]
    LdapOperationError(#[from] LdapOperationError),
    /// an entry addition was rejected by the server
    #[error("ldap3 Ldap error: {0}")]
    LdapError(#[from] ldap3::LdapError),
    /// a base DN we cannot derive container attributes for
    #[error("validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

/// add an entry, tolerating a concurrent creation of the same DN
pub(crate) async fn add_entry(
    ldap: &mut Ldap,
    dn: &str,
    attrs: Vec<(String, HashSet<String>)>,
) -> Result<ProvisionOutcome, ProvisionError> {
    let result = ldap
        .add(dn, attrs)
        .await
        .map_err(LdapOperationError::from)?;
    match result.rc {
        0 => Ok(ProvisionOutcome::Created),
        RC_ENTRY_ALREADY_EXISTS => {
            tracing::debug!("Entry {} appeared concurrently, treating as present", dn);
            Ok(ProvisionOutcome::AlreadyPresent)
        }
        _ => Err(ldap3::LdapError::from(result).into()),
    }
}

/// ensure an organizationalUnit container exists at the given DN
#[instrument(skip(ldap))]
pub(crate) async fn ensure_container(
    ldap: &mut Ldap,
    dn: &str,
    ou_name: &str,
) -> Result<ProvisionOutcome, ProvisionError> {
    if entry_exists(ldap, dn).await? {
        return Ok(ProvisionOutcome::AlreadyPresent);
    }
    tracing::debug!("Creating container {}", dn);
    add_entry(
        ldap,
        dn,
        vec![
            (
                "objectClass".to_string(),
                HashSet::from(["top".to_string(), "organizationalUnit".to_string()]),
            ),
            ("ou".to_string(), HashSet::from([ou_name.to_string()])),
        ],
    )
    .await
}

/// minimal attributes for the base container, derived from its leading RDN
pub(crate) fn base_entry_attrs(
    base_dn: &str,
) -> Result<Vec<(String, HashSet<String>)>, ValidationError> {
    let rdn = base_dn.split(',').next().unwrap_or(base_dn);
    let (attribute, value) = rdn
        .split_once('=')
        .ok_or_else(|| ValidationError::UnsupportedBaseDn(base_dn.to_string()))?;
    let value = value.trim().to_string();
    match attribute.trim().to_lowercase().as_str() {
        "dc" => Ok(vec![
            (
                "objectClass".to_string(),
                HashSet::from([
                    "top".to_string(),
                    "dcObject".to_string(),
                    "organization".to_string(),
                ]),
            ),
            ("dc".to_string(), HashSet::from([value.clone()])),
            ("o".to_string(), HashSet::from([value])),
        ]),
        "ou" => Ok(vec![
            (
                "objectClass".to_string(),
                HashSet::from(["top".to_string(), "organizationalUnit".to_string()]),
            ),
            ("ou".to_string(), HashSet::from([value])),
        ]),
        "o" => Ok(vec![
            (
                "objectClass".to_string(),
                HashSet::from(["top".to_string(), "organization".to_string()]),
            ),
            ("o".to_string(), HashSet::from([value])),
        ]),
        _ => Err(ValidationError::UnsupportedBaseDn(base_dn.to_string())),
    }
}

/// ensure the base container and the people container exist, returning the
/// DNs this run had to create
#[instrument(skip(ldap, settings))]
pub async fn ensure_structure(
    ldap: &mut Ldap,
    settings: &DirectorySettings,
) -> Result<Vec<String>, ProvisionError> {
    let mut created = Vec::new();
    if !entry_exists(ldap, &settings.base_dn).await? {
        tracing::debug!("Creating base container {}", settings.base_dn);
        let attrs = base_entry_attrs(&settings.base_dn)?;
        if let ProvisionOutcome::Created = add_entry(ldap, &settings.base_dn, attrs).await? {
            created.push(settings.base_dn.clone());
        }
    }
    let people_dn = settings.people_dn();
    if let ProvisionOutcome::Created = ensure_container(ldap, &people_dn, &settings.people_ou).await?
    {
        created.push(people_dn);
    }
    Ok(created)
}

/// the attributes of a new user entry
///
/// the auxiliary class is attached only when the user carries custom
/// attribute values, and a missing credential provisions the entry without
/// a userPassword attribute
pub fn user_entry_attrs(
    config: &SchemaConfig,
    user: &DirectoryUser,
) -> Vec<(String, HashSet<String>)> {
    let mut object_classes: HashSet<String> = [
        "top",
        "person",
        "organizationalPerson",
        "inetOrgPerson",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if !user.custom_attributes.is_empty() {
        object_classes.insert(config.auxiliary_class_name.clone());
    }
    let mut attrs = vec![
        ("objectClass".to_string(), object_classes),
        (
            "uid".to_string(),
            HashSet::from([user.username.clone()]),
        ),
        (
            "cn".to_string(),
            HashSet::from([format!("{} {}", user.first_name, user.last_name)]),
        ),
        (
            "givenName".to_string(),
            HashSet::from([user.first_name.clone()]),
        ),
        ("sn".to_string(), HashSet::from([user.last_name.clone()])),
        ("mail".to_string(), HashSet::from([user.email.clone()])),
    ];
    if let Some(title) = &user.title {
        attrs.push(("title".to_string(), HashSet::from([title.clone()])));
    }
    if let Some(credential) = &user.credential {
        attrs.push((
            "userPassword".to_string(),
            HashSet::from([credential.clone()]),
        ));
    }
    for (attribute, value) in user.custom_attributes.iter().sorted() {
        attrs.push((attribute.clone(), HashSet::from([value.clone()])));
    }
    attrs
}

/// create the user entry if it does not exist yet, leave it untouched if it
/// does
#[instrument(skip(ldap, settings, config, user), fields(username = %user.username))]
pub async fn provision_user(
    ldap: &mut Ldap,
    settings: &DirectorySettings,
    config: &SchemaConfig,
    user: &DirectoryUser,
) -> Result<ProvisionOutcome, ProvisionError> {
    let dn = settings.user_dn(&user.username);
    if entry_exists(ldap, &dn).await? {
        tracing::debug!("User entry {} already present, leaving untouched", dn);
        return Ok(ProvisionOutcome::AlreadyPresent);
    }
    tracing::debug!("Creating user entry {}", dn);
    add_entry(ldap, &dn, user_entry_attrs(config, user)).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn test_config() -> SchemaConfig {
        SchemaConfig {
            oid_prefix: "1.3.6.1.4.1.99999.1".to_string(),
            auxiliary_class_name: "provisionedPerson".to_string(),
            auxiliary_class_oid: 2,
            reserved_attribute_oid: 1,
            attribute_oid_start: 100,
            schema_entry_dn: None,
        }
    }

    fn user() -> DirectoryUser {
        DirectoryUser {
            username: "alice".to_string(),
            email: "alice@example.org".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Example".to_string(),
            credential: None,
            title: None,
            custom_attributes: HashMap::new(),
        }
    }

    fn attribute<'a>(
        attrs: &'a [(String, HashSet<String>)],
        name: &str,
    ) -> Option<&'a HashSet<String>> {
        attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    #[test]
    fn plain_user_has_no_auxiliary_class_and_no_password() {
        let attrs = user_entry_attrs(&test_config(), &user());
        let classes = attribute(&attrs, "objectClass").expect("objectClass");
        assert!(classes.contains("inetOrgPerson"));
        assert!(!classes.contains("provisionedPerson"));
        assert!(attribute(&attrs, "userPassword").is_none());
        assert!(attribute(&attrs, "title").is_none());
        assert_eq!(
            attribute(&attrs, "cn").expect("cn"),
            &HashSet::from(["Alice Example".to_string()])
        );
    }

    #[test]
    fn custom_attributes_attach_the_auxiliary_class() {
        let mut user = user();
        user.custom_attributes
            .insert("rank".to_string(), "captain".to_string());
        let attrs = user_entry_attrs(&test_config(), &user);
        let classes = attribute(&attrs, "objectClass").expect("objectClass");
        assert!(classes.contains("provisionedPerson"));
        assert_eq!(
            attribute(&attrs, "rank").expect("rank"),
            &HashSet::from(["captain".to_string()])
        );
    }

    #[test]
    fn credential_and_title_are_written_when_present() {
        let mut user = user();
        user.credential = Some("secret".to_string());
        user.title = Some("Captain".to_string());
        let attrs = user_entry_attrs(&test_config(), &user);
        assert_eq!(
            attribute(&attrs, "userPassword").expect("userPassword"),
            &HashSet::from(["secret".to_string()])
        );
        assert_eq!(
            attribute(&attrs, "title").expect("title"),
            &HashSet::from(["Captain".to_string()])
        );
    }

    #[test]
    fn base_attrs_for_dc_base() {
        let attrs = base_entry_attrs("dc=example,dc=org").expect("dc base");
        let classes = attribute(&attrs, "objectClass").expect("objectClass");
        assert!(classes.contains("dcObject"));
        assert!(classes.contains("organization"));
        assert_eq!(
            attribute(&attrs, "dc").expect("dc"),
            &HashSet::from(["example".to_string()])
        );
    }

    #[test]
    fn base_attrs_for_unknown_rdn_are_rejected() {
        assert!(matches!(
            base_entry_attrs("cn=whatever"),
            Err(ValidationError::UnsupportedBaseDn(_))
        ));
    }
}
