//! the LDIF generator
//!
//! renders the schema extension, container, user and group operations as a
//! static LDIF document for offline review, it always emits full additive
//! records and never models the skip behavior of a live run
//!
//! the generator shares the derivation and entry-building functions of the
//! live path, so identifiers, syntaxes and the auxiliary class member list
//! in the generated text always match what a live run would apply

use std::collections::{BTreeSet, HashSet};

use itertools::Itertools;

use crate::descriptor::{
    validate_plan, AttributeDescriptor, DirectoryGroup, DirectoryUser, ProvisioningPlan,
    ValidationError,
};
use crate::groups::group_entry_attrs;
use crate::provision::{base_entry_attrs, user_entry_attrs};
use crate::schema::{derive_schema_elements, SchemaConfig};
use crate::settings::DirectorySettings;

/// subschema DN used in generated documents when the configuration does
/// not name one, offline generation cannot ask the root DSE
const DEFAULT_SCHEMA_DN: &str = "cn=schema";

/// append one changetype add record
fn push_entry(out: &mut String, dn: &str, attrs: &[(String, HashSet<String>)]) {
    out.push_str(&format!("dn: {}\n", dn));
    out.push_str("changetype: add\n");
    for (name, values) in attrs {
        for value in values.iter().sorted() {
            out.push_str(&format!("{}: {}\n", name, value));
        }
    }
    out.push('\n');
}

/// append one additive schema modification record
fn push_schema_value(out: &mut String, schema_dn: &str, attribute: &str, definition: &str) {
    out.push_str(&format!("dn: {}\n", schema_dn));
    out.push_str("changetype: modify\n");
    out.push_str(&format!("add: {}\n", attribute));
    out.push_str(&format!("{}: {}\n", attribute, definition));
    out.push('\n');
}

/// build the LDIF document mirroring one run's creation operations
///
/// the same validation as a live run applies, an oversized custom
/// attribute value fails generation just like it would fail provisioning
pub fn build_ldif(
    settings: &DirectorySettings,
    config: &SchemaConfig,
    descriptors: &[AttributeDescriptor],
    users: &[DirectoryUser],
    groups: &[DirectoryGroup],
) -> Result<String, ValidationError> {
    let plan = ProvisioningPlan {
        attributes: descriptors.to_vec(),
        users: users.to_vec(),
        groups: groups.to_vec(),
    };
    validate_plan(&plan)?;
    let elements = derive_schema_elements(config, descriptors)?;
    let schema_dn = config.schema_entry_dn.as_deref().unwrap_or(DEFAULT_SCHEMA_DN);

    let mut out = String::new();
    out.push_str("# generated by ldap-provisioner for offline review\n");
    out.push_str("# apply with ldapmodify against the target directory\n\n");

    for definition in elements
        .attribute_types
        .iter()
        .chain(std::iter::once(&elements.reserved_attribute))
    {
        out.push_str(&format!(
            "# generated attribute type {} ({})\n",
            definition.name, definition.oid
        ));
        push_schema_value(
            &mut out,
            schema_dn,
            "attributeTypes",
            &definition.definition_string(),
        );
    }

    let class = &elements.auxiliary_class;
    out.push_str(&format!(
        "# generated object class {} ({})\n",
        class.name, class.oid
    ));
    push_schema_value(&mut out, schema_dn, "objectClasses", &class.definition_string());

    push_entry(&mut out, &settings.base_dn, &base_entry_attrs(&settings.base_dn)?);
    push_entry(
        &mut out,
        &settings.people_dn(),
        &[
            (
                "objectClass".to_string(),
                HashSet::from(["top".to_string(), "organizationalUnit".to_string()]),
            ),
            (
                "ou".to_string(),
                HashSet::from([settings.people_ou.clone()]),
            ),
        ],
    );
    push_entry(
        &mut out,
        &settings.groups_dn(),
        &[
            (
                "objectClass".to_string(),
                HashSet::from(["top".to_string(), "organizationalUnit".to_string()]),
            ),
            (
                "ou".to_string(),
                HashSet::from([settings.groups_ou.clone()]),
            ),
        ],
    );

    for user in users {
        push_entry(
            &mut out,
            &settings.user_dn(&user.username),
            &user_entry_attrs(config, user),
        );
    }

    for group in groups {
        let mut members: BTreeSet<String> = group
            .members
            .iter()
            .map(|username| settings.user_dn(username))
            .collect();
        if members.is_empty() {
            members.insert(settings.placeholder_member_dn());
        }
        push_entry(
            &mut out,
            &settings.group_dn(&group.name),
            &group_entry_attrs(config, group, &members),
        );
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::descriptor::AttributeValueKind;
    use crate::schema::{derived_identifiers, RESERVED_UNIQUE_ID_ATTRIBUTE};
    use crate::settings::BindCredentials;

    fn settings() -> DirectorySettings {
        DirectorySettings {
            url: "ldaps://directory.example.org:636".to_string(),
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
            connect_timeout_secs: 30,
        }
    }

    fn config() -> SchemaConfig {
        SchemaConfig {
            oid_prefix: "1.3.6.1.4.1.99999.1".to_string(),
            auxiliary_class_name: "provisionedPerson".to_string(),
            auxiliary_class_oid: 2,
            reserved_attribute_oid: 1,
            attribute_oid_start: 100,
            schema_entry_dn: None,
        }
    }

    fn rank() -> AttributeDescriptor {
        AttributeDescriptor {
            name: "rank".to_string(),
            display_name: "Rank".to_string(),
            value_type: AttributeValueKind::Text,
            directory_attribute: Some("rank".to_string()),
            required: false,
        }
    }

    fn alice() -> DirectoryUser {
        DirectoryUser {
            username: "alice".to_string(),
            email: "alice@example.org".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Example".to_string(),
            credential: None,
            title: None,
            custom_attributes: HashMap::from([("rank".to_string(), "captain".to_string())]),
        }
    }

    #[test]
    fn generated_definitions_match_the_live_derivation() {
        let ldif = build_ldif(&settings(), &config(), &[rank()], &[], &[])
            .expect("generation should succeed");
        let elements =
            derive_schema_elements(&config(), &[rank()]).expect("derivation should succeed");
        for definition in elements
            .attribute_types
            .iter()
            .chain(std::iter::once(&elements.reserved_attribute))
        {
            assert!(ldif.contains(&definition.definition_string()));
        }
        assert!(ldif.contains(&elements.auxiliary_class.definition_string()));
        for (name, oid) in derived_identifiers(&elements) {
            assert!(ldif.contains(&format!("{} ({})", name, oid)));
        }
    }

    #[test]
    fn schema_blocks_carry_banner_comments_and_blank_separation() {
        let ldif = build_ldif(&settings(), &config(), &[rank()], &[], &[])
            .expect("generation should succeed");
        assert!(ldif.contains("# generated attribute type rank (1.3.6.1.4.1.99999.1.100)"));
        assert!(ldif.contains(
            "# generated object class provisionedPerson (1.3.6.1.4.1.99999.1.2)"
        ));
        assert!(ldif.contains("changetype: modify\nadd: attributeTypes\n"));
        assert!(ldif.contains("changetype: modify\nadd: objectClasses\n"));
        // records are blank-line separated
        assert!(ldif.contains(")\n\n"));
        assert!(!ldif.contains("\n\n\n"));
    }

    #[test]
    fn user_record_mirrors_the_live_entry_builder() {
        let ldif = build_ldif(&settings(), &config(), &[rank()], &[alice()], &[])
            .expect("generation should succeed");
        assert!(ldif.contains("dn: uid=alice,ou=people,dc=example,dc=org\n"));
        assert!(ldif.contains("objectClass: provisionedPerson\n"));
        assert!(ldif.contains("rank: captain\n"));
        assert!(!ldif.contains("userPassword:"));
    }

    #[test]
    fn empty_group_gets_the_placeholder_member() {
        let group = DirectoryGroup {
            name: "alpha".to_string(),
            unique_id: "42".to_string(),
            members: BTreeSet::new(),
            mentionable: false,
        };
        let ldif = build_ldif(&settings(), &config(), &[], &[], &[group])
            .expect("generation should succeed");
        assert!(ldif.contains("dn: cn=alpha,ou=groups,dc=example,dc=org\n"));
        assert!(ldif
            .contains("member: cn=membership-placeholder,ou=groups,dc=example,dc=org\n"));
        assert!(ldif.contains(&format!("{}: 42\n", RESERVED_UNIQUE_ID_ATTRIBUTE)));
    }

    #[test]
    fn oversized_value_fails_generation() {
        let mut user = alice();
        user.custom_attributes
            .insert("rank".to_string(), "x".repeat(70));
        let result = build_ldif(&settings(), &config(), &[rank()], &[user], &[]);
        assert!(matches!(
            result,
            Err(ValidationError::OversizedAttributeValue { length: 70, .. })
        ));
    }
}
