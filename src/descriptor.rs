//! typed declarative input records and the pre-flight validation applied to
//! them before any directory mutation is attempted

use std::collections::{BTreeSet, HashMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::groups::PLACEHOLDER_MEMBER_CN;

/// maximum length of a custom attribute value in characters, values above
/// this are rejected before any directory write is attempted
pub const MAX_ATTRIBUTE_VALUE_LENGTH: usize = 64;

/// the value type of a declared custom attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeValueKind {
    /// free-form text
    Text,
    /// integer values
    Number,
    /// true/false values
    Boolean,
    /// one value out of a fixed choice list, stored as text
    Select,
}

/// a declared custom profile attribute
///
/// only descriptors with a non-empty [directory_attribute](AttributeDescriptor::directory_attribute)
/// participate in schema extension
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDescriptor {
    /// the attribute name, unique within a run
    pub name: String,
    /// human-readable name, used as the schema description
    #[serde(default)]
    pub display_name: String,
    /// the value type of the attribute
    pub value_type: AttributeValueKind,
    /// the directory attribute this descriptor maps to, if any
    #[serde(default)]
    pub directory_attribute: Option<String>,
    /// whether the upstream form treats the attribute as mandatory
    #[serde(default)]
    pub required: bool,
}

impl AttributeDescriptor {
    /// the non-empty directory attribute name this descriptor maps to, if any
    pub fn mapped_attribute(&self) -> Option<&str> {
        self.directory_attribute
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// a user entry to provision in the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    /// login name, becomes the uid RDN of the entry
    pub username: String,
    /// mail address
    pub email: String,
    /// given name
    pub first_name: String,
    /// surname
    pub last_name: String,
    /// initial credential, the entry is created without a userPassword
    /// attribute when absent
    #[serde(default)]
    pub credential: Option<String>,
    /// job title
    #[serde(default)]
    pub title: Option<String>,
    /// custom attribute values keyed by directory attribute name
    #[serde(default)]
    pub custom_attributes: HashMap<String, String>,
}

/// a group with its desired member set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryGroup {
    /// group name, becomes the cn RDN within the groups container
    pub name: String,
    /// stable external identifier, written to the reserved uniqueID attribute
    pub unique_id: String,
    /// usernames that should be the exact membership after synchronization
    #[serde(default)]
    pub members: BTreeSet<String>,
    /// whether the downstream application should allow mentioning the group
    #[serde(default)]
    pub mentionable: bool,
}

/// one record of the declarative input produced by the configuration loader
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProvisioningRecord {
    /// a custom attribute declaration
    Attribute(AttributeDescriptor),
    /// a user entry
    User(DirectoryUser),
    /// a group with its member list
    Group(DirectoryGroup),
}

/// the extracted, typed view of one run's declarative input
#[derive(Debug, Clone, Default)]
pub struct ProvisioningPlan {
    /// declared custom attributes, in declaration order
    pub attributes: Vec<AttributeDescriptor>,
    /// user entries to provision
    pub users: Vec<DirectoryUser>,
    /// groups to synchronize
    pub groups: Vec<DirectoryGroup>,
}

/// split a sequence of tagged records into the typed plan the pipeline
/// consumes, preserving declaration order within each record kind
pub fn extract_records(records: Vec<ProvisioningRecord>) -> ProvisioningPlan {
    let mut plan = ProvisioningPlan::default();
    for record in records {
        match record {
            ProvisioningRecord::Attribute(attribute) => plan.attributes.push(attribute),
            ProvisioningRecord::User(user) => plan.users.push(user),
            ProvisioningRecord::Group(group) => plan.groups.push(group),
        }
    }
    plan
}

/// the descriptors that participate in schema extension, in declaration
/// order
///
/// the positional index within this filtered list drives OID assignment, so
/// unmapped descriptors never shift the identifiers of mapped ones
pub fn mapped_descriptors(descriptors: &[AttributeDescriptor]) -> Vec<&AttributeDescriptor> {
    descriptors
        .iter()
        .filter(|d| d.mapped_attribute().is_some())
        .collect()
}

/// a validation failure raised before any directory mutation
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// a descriptor without a name
    #[error("attribute descriptor with empty name")]
    EmptyDescriptorName,
    /// two descriptors share a name
    #[error("duplicate attribute descriptor name {0}")]
    DuplicateDescriptor(String),
    /// a directory attribute name the directory would reject
    #[error("descriptor {name} maps to invalid directory attribute name {directory_attribute}")]
    InvalidDirectoryAttribute {
        /// the descriptor name
        name: String,
        /// the offending mapped attribute name
        directory_attribute: String,
    },
    /// two descriptors map to the same directory attribute
    #[error("duplicate directory attribute mapping {0}")]
    DuplicateDirectoryAttribute(String),
    /// a user record without a username
    #[error("user record with empty username")]
    EmptyUsername,
    /// a user record missing a mandatory field
    #[error("user {username} is missing mandatory field {field}")]
    MissingUserField {
        /// the affected user
        username: String,
        /// the missing field
        field: &'static str,
    },
    /// a custom attribute value above [MAX_ATTRIBUTE_VALUE_LENGTH]
    #[error("custom attribute {attribute} of user {username} is {length} characters long, maximum is {MAX_ATTRIBUTE_VALUE_LENGTH}")]
    OversizedAttributeValue {
        /// the affected user
        username: String,
        /// the affected attribute
        attribute: String,
        /// the actual value length in characters
        length: usize,
    },
    /// a custom attribute value for an attribute no descriptor maps
    #[error("user {username} carries value for unmapped attribute {attribute}")]
    UnknownCustomAttribute {
        /// the affected user
        username: String,
        /// the unknown attribute name
        attribute: String,
    },
    /// a group record without a name
    #[error("group record with empty name")]
    EmptyGroupName,
    /// a group record without a unique identifier
    #[error("group {0} has no unique identifier")]
    MissingGroupUniqueId(String),
    /// the synchronizer-internal placeholder member declared as input
    #[error("group {0} declares the reserved placeholder member")]
    PlaceholderMemberDeclared(String),
    /// the configured OID prefix does not parse as an OID
    #[error("configured OID prefix {0} is not a valid OID")]
    InvalidOidPrefix(String),
    /// a base DN whose leading RDN is not one we know how to create
    #[error("cannot derive container attributes for base DN {0}")]
    UnsupportedBaseDn(String),
    /// two derived schema elements would share an identifier
    #[error("derived schema identifier {0} collides with another derived identifier")]
    IdentifierCollision(String),
}

/// check whether a name is usable as a directory attribute name
fn valid_attribute_name(name: &str) -> bool {
    lazy_static! {
        static ref ATTRIBUTE_NAME_RE: Regex =
            Regex::new("^[A-Za-z][A-Za-z0-9-]*$").expect("static regex");
    }
    ATTRIBUTE_NAME_RE.is_match(name)
}

/// validate the declared attributes of a plan
fn validate_descriptors(descriptors: &[AttributeDescriptor]) -> Result<(), ValidationError> {
    let mut names = HashSet::new();
    let mut mapped = HashSet::new();
    for descriptor in descriptors {
        if descriptor.name.trim().is_empty() {
            return Err(ValidationError::EmptyDescriptorName);
        }
        if !names.insert(descriptor.name.clone()) {
            return Err(ValidationError::DuplicateDescriptor(descriptor.name.clone()));
        }
        if let Some(attribute) = descriptor.mapped_attribute() {
            if !valid_attribute_name(attribute) {
                return Err(ValidationError::InvalidDirectoryAttribute {
                    name: descriptor.name.clone(),
                    directory_attribute: attribute.to_string(),
                });
            }
            if !mapped.insert(attribute.to_lowercase()) {
                return Err(ValidationError::DuplicateDirectoryAttribute(
                    attribute.to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// validate the user records of a plan against the declared attributes
fn validate_users(
    users: &[DirectoryUser],
    descriptors: &[AttributeDescriptor],
) -> Result<(), ValidationError> {
    let known: HashSet<String> = mapped_descriptors(descriptors)
        .iter()
        .filter_map(|d| d.mapped_attribute())
        .map(str::to_lowercase)
        .collect();
    for user in users {
        if user.username.trim().is_empty() {
            return Err(ValidationError::EmptyUsername);
        }
        for (field, value) in [
            ("email", &user.email),
            ("firstName", &user.first_name),
            ("lastName", &user.last_name),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingUserField {
                    username: user.username.clone(),
                    field,
                });
            }
        }
        for (attribute, value) in &user.custom_attributes {
            if !known.contains(&attribute.to_lowercase()) {
                return Err(ValidationError::UnknownCustomAttribute {
                    username: user.username.clone(),
                    attribute: attribute.clone(),
                });
            }
            let length = value.chars().count();
            if length > MAX_ATTRIBUTE_VALUE_LENGTH {
                return Err(ValidationError::OversizedAttributeValue {
                    username: user.username.clone(),
                    attribute: attribute.clone(),
                    length,
                });
            }
        }
    }
    Ok(())
}

/// validate the group records of a plan
fn validate_groups(groups: &[DirectoryGroup]) -> Result<(), ValidationError> {
    for group in groups {
        if group.name.trim().is_empty() {
            return Err(ValidationError::EmptyGroupName);
        }
        if group.unique_id.trim().is_empty() {
            return Err(ValidationError::MissingGroupUniqueId(group.name.clone()));
        }
        if group
            .members
            .iter()
            .any(|m| m.eq_ignore_ascii_case(PLACEHOLDER_MEMBER_CN))
        {
            return Err(ValidationError::PlaceholderMemberDeclared(
                group.name.clone(),
            ));
        }
    }
    Ok(())
}

/// validate an entire plan, called by the pipeline before the first
/// directory connection is opened
pub fn validate_plan(plan: &ProvisioningPlan) -> Result<(), ValidationError> {
    validate_descriptors(&plan.attributes)?;
    validate_users(&plan.users, &plan.attributes)?;
    validate_groups(&plan.groups)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rank_descriptor() -> AttributeDescriptor {
        AttributeDescriptor {
            name: "rank".to_string(),
            display_name: "Rank".to_string(),
            value_type: AttributeValueKind::Text,
            directory_attribute: Some("rank".to_string()),
            required: false,
        }
    }

    fn user_with_value(value: &str) -> DirectoryUser {
        DirectoryUser {
            username: "alice".to_string(),
            email: "alice@example.org".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Example".to_string(),
            credential: None,
            title: None,
            custom_attributes: HashMap::from([("rank".to_string(), value.to_string())]),
        }
    }

    #[test]
    fn value_at_limit_is_accepted() {
        let plan = ProvisioningPlan {
            attributes: vec![rank_descriptor()],
            users: vec![user_with_value(&"x".repeat(64))],
            groups: vec![],
        };
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn value_above_limit_is_rejected() {
        let plan = ProvisioningPlan {
            attributes: vec![rank_descriptor()],
            users: vec![user_with_value(&"x".repeat(65))],
            groups: vec![],
        };
        match validate_plan(&plan) {
            Err(ValidationError::OversizedAttributeValue { length, .. }) => {
                assert_eq!(length, 65)
            }
            other => panic!("expected oversize rejection, got {:?}", other),
        }
    }

    #[test]
    fn unmapped_attribute_value_is_rejected() {
        let mut user = user_with_value("ok");
        user.custom_attributes
            .insert("unheard-of".to_string(), "v".to_string());
        let plan = ProvisioningPlan {
            attributes: vec![rank_descriptor()],
            users: vec![user],
            groups: vec![],
        };
        assert!(matches!(
            validate_plan(&plan),
            Err(ValidationError::UnknownCustomAttribute { .. })
        ));
    }

    #[test]
    fn placeholder_member_is_rejected_as_input() {
        let group = DirectoryGroup {
            name: "alpha".to_string(),
            unique_id: "42".to_string(),
            members: BTreeSet::from([PLACEHOLDER_MEMBER_CN.to_string()]),
            mentionable: false,
        };
        let plan = ProvisioningPlan {
            attributes: vec![],
            users: vec![],
            groups: vec![group],
        };
        assert!(matches!(
            validate_plan(&plan),
            Err(ValidationError::PlaceholderMemberDeclared(_))
        ));
    }

    #[test]
    fn only_mapped_descriptors_participate() {
        let unmapped = AttributeDescriptor {
            name: "note".to_string(),
            display_name: "Note".to_string(),
            value_type: AttributeValueKind::Text,
            directory_attribute: None,
            required: false,
        };
        let blank = AttributeDescriptor {
            name: "blank".to_string(),
            display_name: String::new(),
            value_type: AttributeValueKind::Text,
            directory_attribute: Some("  ".to_string()),
            required: false,
        };
        let binding = [unmapped, rank_descriptor(), blank];
        let mapped = mapped_descriptors(&binding);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].mapped_attribute(), Some("rank"));
    }

    #[test]
    fn tagged_records_decode_into_a_plan() {
        let raw = r#"
            [
                {"kind": "attribute", "name": "rank", "displayName": "Rank",
                 "valueType": "text", "directoryAttribute": "rank"},
                {"kind": "user", "username": "alice", "email": "a@example.org",
                 "firstName": "Alice", "lastName": "Example"},
                {"kind": "group", "name": "alpha", "uniqueId": "42",
                 "members": ["alice"]}
            ]
        "#;
        let records: Vec<ProvisioningRecord> =
            serde_json::from_str(raw).expect("records should decode");
        let plan = extract_records(records);
        assert_eq!(plan.attributes.len(), 1);
        assert_eq!(plan.users.len(), 1);
        assert_eq!(plan.groups.len(), 1);
        assert!(plan.groups[0].members.contains("alice"));
    }

    #[test]
    fn duplicate_directory_attribute_is_rejected() {
        let mut second = rank_descriptor();
        second.name = "rank2".to_string();
        let plan = ProvisioningPlan {
            attributes: vec![rank_descriptor(), second],
            users: vec![],
            groups: vec![],
        };
        assert!(matches!(
            validate_plan(&plan),
            Err(ValidationError::DuplicateDirectoryAttribute(_))
        ));
    }
}
