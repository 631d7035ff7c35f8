//! the group membership synchronizer
//!
//! reconciles each group's live member set to exactly the declared set,
//! creating missing groups directly with their full target membership
//!
//! the synchronizer operates on sets, member ordering is irrelevant and
//! re-running with an unchanged declaration produces zero adds and zero
//! removes

use std::collections::{BTreeSet, HashSet};

use ldap3::{Ldap, Mod};
use thiserror::Error;
use tracing::instrument;

use crate::connection::{search_one, LdapOperationError};
use crate::descriptor::DirectoryGroup;
use crate::provision::{add_entry, ensure_container, ProvisionError};
use crate::schema::{SchemaConfig, RESERVED_UNIQUE_ID_ATTRIBUTE};
use crate::settings::DirectorySettings;

/// CN of the member entry used to satisfy the groupOfNames non-empty
/// constraint on groups declared without members
///
/// the placeholder is a directory-imposed workaround, it is tolerated in
/// live member sets and must never appear in declared input
pub const PLACEHOLDER_MEMBER_CN: &str = "membership-placeholder";

/// error which can happen while synchronizing a group
#[derive(Debug, Error)]
pub enum GroupSyncError {
    /// an error in the ldap operations performed
    #[error("Ldap operation error: {0}")]
    LdapOperationError(#[from] LdapOperationError),
    /// a membership modification was rejected by the server
    #[error("ldap3 Ldap error: {0}")]
    LdapError(#[from] ldap3::LdapError),
    /// an error creating the groups container or the group entry
    #[error("provisioning error: {0}")]
    ProvisionError(#[from] ProvisionError),
}

/// what one [sync_group] call changed
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupSyncOutcome {
    /// whether the group entry was created by this call
    pub created: bool,
    /// number of members added
    pub added: usize,
    /// number of members removed
    pub removed: usize,
}

/// the attributes of a new group entry
pub fn group_entry_attrs(
    config: &SchemaConfig,
    group: &DirectoryGroup,
    members: &BTreeSet<String>,
) -> Vec<(String, HashSet<String>)> {
    vec![
        (
            "objectClass".to_string(),
            HashSet::from([
                "top".to_string(),
                "groupOfNames".to_string(),
                config.auxiliary_class_name.clone(),
            ]),
        ),
        ("cn".to_string(), HashSet::from([group.name.clone()])),
        (
            RESERVED_UNIQUE_ID_ATTRIBUTE.to_string(),
            HashSet::from([group.unique_id.clone()]),
        ),
        (
            "member".to_string(),
            members.iter().cloned().collect::<HashSet<String>>(),
        ),
    ]
}

/// compute the two modification sets that converge the live membership to
/// the declared one
///
/// DN comparison is case-insensitive, and the placeholder member is never
/// scheduled for removal
pub fn member_diff(
    current: &BTreeSet<String>,
    desired: &BTreeSet<String>,
    placeholder_dn: &str,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let current_lower: HashSet<String> = current.iter().map(|m| m.to_lowercase()).collect();
    let desired_lower: HashSet<String> = desired.iter().map(|m| m.to_lowercase()).collect();
    let placeholder_lower = placeholder_dn.to_lowercase();
    let to_add: BTreeSet<String> = desired
        .iter()
        .filter(|m| !current_lower.contains(&m.to_lowercase()))
        .cloned()
        .collect();
    let to_remove: BTreeSet<String> = current
        .iter()
        .filter(|m| {
            let lower = m.to_lowercase();
            !desired_lower.contains(&lower) && lower != placeholder_lower
        })
        .cloned()
        .collect();
    (to_add, to_remove)
}

/// fetch the current member identifiers of a group entry, None if the
/// entry does not exist
async fn fetch_group_members(
    ldap: &mut Ldap,
    dn: &str,
) -> Result<Option<BTreeSet<String>>, LdapOperationError> {
    let entry = search_one(ldap, dn, "(objectClass=*)", vec!["member"]).await?;
    Ok(entry.map(|entry| {
        entry
            .attrs
            .get("member")
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }))
}

/// synchronize one group to its declared member set
///
/// a missing group is created directly with the full target membership, an
/// existing one is reconciled with a removal modification followed by an
/// addition modification, removal first so directories that reject
/// duplicate values never see a transient duplicate
#[instrument(skip(ldap, settings, config, group), fields(group = %group.name))]
pub async fn sync_group(
    ldap: &mut Ldap,
    settings: &DirectorySettings,
    config: &SchemaConfig,
    group: &DirectoryGroup,
) -> Result<GroupSyncOutcome, GroupSyncError> {
    ensure_container(ldap, &settings.groups_dn(), &settings.groups_ou).await?;
    let dn = settings.group_dn(&group.name);
    let placeholder_dn = settings.placeholder_member_dn();
    let desired: BTreeSet<String> = group
        .members
        .iter()
        .map(|username| settings.user_dn(username))
        .collect();
    match fetch_group_members(ldap, &dn).await? {
        None => {
            let mut members = desired.clone();
            if members.is_empty() {
                tracing::debug!(
                    "Group {} declared without members, seeding placeholder",
                    group.name
                );
                members.insert(placeholder_dn);
            }
            add_entry(ldap, &dn, group_entry_attrs(config, group, &members)).await?;
            tracing::debug!("Created group {} with {} declared members", dn, desired.len());
            Ok(GroupSyncOutcome {
                created: true,
                added: desired.len(),
                removed: 0,
            })
        }
        Some(current) => {
            let (to_add, to_remove) = member_diff(&current, &desired, &placeholder_dn);
            let added = to_add.len();
            let removed = to_remove.len();
            if !to_remove.is_empty() {
                tracing::debug!("Removing {} members from {}", removed, dn);
                ldap.modify(
                    &dn,
                    vec![Mod::Delete(
                        "member".to_string(),
                        to_remove.into_iter().collect::<HashSet<String>>(),
                    )],
                )
                .await
                .map_err(LdapOperationError::from)?
                .success()?;
            }
            if !to_add.is_empty() {
                tracing::debug!("Adding {} members to {}", added, dn);
                ldap.modify(
                    &dn,
                    vec![Mod::Add(
                        "member".to_string(),
                        to_add.into_iter().collect::<HashSet<String>>(),
                    )],
                )
                .await
                .map_err(LdapOperationError::from)?
                .success()?;
            }
            if added == 0 && removed == 0 {
                tracing::debug!("Group {} already converged", dn);
            }
            Ok(GroupSyncOutcome {
                created: false,
                added,
                removed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(members: &[&str]) -> BTreeSet<String> {
        members.iter().map(|m| m.to_string()).collect()
    }

    const PLACEHOLDER: &str = "cn=membership-placeholder,ou=groups,dc=example,dc=org";

    fn user(name: &str) -> String {
        format!("uid={},ou=people,dc=example,dc=org", name)
    }

    #[test]
    fn declared_set_replaces_live_set() {
        let current = set(&[&user("bob"), &user("carol")]);
        let desired = set(&[&user("carol"), &user("dave")]);
        let (to_add, to_remove) = member_diff(&current, &desired, PLACEHOLDER);
        assert_eq!(to_add, set(&[&user("dave")]));
        assert_eq!(to_remove, set(&[&user("bob")]));
    }

    #[test]
    fn unchanged_declaration_is_a_no_op() {
        let current = set(&[&user("bob"), &user("carol")]);
        let (to_add, to_remove) = member_diff(&current, &current.clone(), PLACEHOLDER);
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[test]
    fn placeholder_is_not_treated_as_drift() {
        let current = set(&[PLACEHOLDER, &user("carol")]);
        let desired = set(&[&user("carol")]);
        let (to_add, to_remove) = member_diff(&current, &desired, PLACEHOLDER);
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[test]
    fn dn_comparison_is_case_insensitive() {
        let current = set(&["UID=carol,OU=people,DC=example,DC=org"]);
        let desired = set(&[&user("carol")]);
        let (to_add, to_remove) = member_diff(&current, &desired, PLACEHOLDER);
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[test]
    fn group_attrs_carry_identity_and_members() {
        let config = SchemaConfig {
            oid_prefix: "1.3.6.1.4.1.99999.1".to_string(),
            auxiliary_class_name: "provisionedPerson".to_string(),
            auxiliary_class_oid: 2,
            reserved_attribute_oid: 1,
            attribute_oid_start: 100,
            schema_entry_dn: None,
        };
        let group = DirectoryGroup {
            name: "alpha".to_string(),
            unique_id: "42".to_string(),
            members: set(&["eve"]),
            mentionable: true,
        };
        let members = set(&[&user("eve")]);
        let attrs = group_entry_attrs(&config, &group, &members);
        let classes = &attrs
            .iter()
            .find(|(n, _)| n == "objectClass")
            .expect("objectClass")
            .1;
        assert!(classes.contains("groupOfNames"));
        assert!(classes.contains("provisionedPerson"));
        let unique = &attrs
            .iter()
            .find(|(n, _)| n == RESERVED_UNIQUE_ID_ATTRIBUTE)
            .expect("uniqueID")
            .1;
        assert!(unique.contains("42"));
        let member = &attrs.iter().find(|(n, _)| n == "member").expect("member").1;
        assert!(member.contains(&user("eve")));
    }
}
