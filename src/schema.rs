//! the schema extension manager
//!
//! derives attribute type and auxiliary object class definitions from the
//! declared attribute list, introspects the live subschema to decide what
//! is missing and applies only the missing pieces
//!
//! identifier derivation is deterministic: for a given [SchemaConfig] and
//! descriptor list the same name always maps to the same OID, independent
//! of directory server state

use std::collections::{HashMap, HashSet};

use chumsky::error::Simple;
use chumsky::Parser;
use lazy_static::lazy_static;
use ldap3::{Ldap, Mod};
use ldap_types::basic::ChumskyError;
use ldap_types::schema::{
    attribute_type_parser, ldap_syntax_parser, matching_rule_parser, matching_rule_use_parser,
    object_class_parser, LDAPSchema,
};
use oid::ObjectIdentifier;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::connection::{
    search_one, LdapOperationError, RC_ATTRIBUTE_OR_VALUE_EXISTS, RC_ENTRY_ALREADY_EXISTS,
};
use crate::descriptor::{
    mapped_descriptors, AttributeDescriptor, AttributeValueKind, ValidationError,
};

/// the reserved attribute ensured independently of the declared attributes,
/// group identity depends on it
pub const RESERVED_UNIQUE_ID_ATTRIBUTE: &str = "uniqueID";

/// directory string syntax (UTF-8 text)
const SYNTAX_DIRECTORY_STRING: &str = "1.3.6.1.4.1.1466.115.121.1.15";

/// integer syntax
const SYNTAX_INTEGER: &str = "1.3.6.1.4.1.1466.115.121.1.27";

/// boolean syntax
const SYNTAX_BOOLEAN: &str = "1.3.6.1.4.1.1466.115.121.1.7";

/// default name of the auxiliary object class
fn default_auxiliary_class_name() -> String {
    "provisionedPerson".to_string()
}

/// default OID suffix of the auxiliary object class
fn default_auxiliary_class_oid() -> u32 {
    2
}

/// default OID suffix of the reserved uniqueID attribute
fn default_reserved_attribute_oid() -> u32 {
    1
}

/// default OID suffix at which declared attribute numbering starts
fn default_attribute_oid_start() -> u32 {
    100
}

/// the numbering scheme from which every generated schema identifier is
/// deterministically derived
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    /// the private enterprise OID arc all generated identifiers live under
    pub oid_prefix: String,
    /// name of the auxiliary object class carrying the custom attributes
    #[serde(default = "default_auxiliary_class_name")]
    pub auxiliary_class_name: String,
    /// fixed OID suffix of the auxiliary object class
    #[serde(default = "default_auxiliary_class_oid")]
    pub auxiliary_class_oid: u32,
    /// fixed OID suffix of the reserved uniqueID attribute
    #[serde(default = "default_reserved_attribute_oid")]
    pub reserved_attribute_oid: u32,
    /// OID suffix assigned to the first declared attribute, subsequent
    /// mapped attributes count up from here in declaration order
    #[serde(default = "default_attribute_oid_start")]
    pub attribute_oid_start: u32,
    /// where to direct additive schema modifications, the subschema
    /// subentry advertised by the root DSE is used when unset
    #[serde(default)]
    pub schema_entry_dn: Option<String>,
}

impl SchemaConfig {
    /// the identifier of the declared attribute at the given position
    /// within the mapped-only descriptor list
    pub fn attribute_identifier(&self, filtered_index: usize) -> String {
        format!(
            "{}.{}",
            self.oid_prefix,
            self.attribute_oid_start as usize + filtered_index
        )
    }

    /// the identifier of the reserved uniqueID attribute
    pub fn reserved_attribute_identifier(&self) -> String {
        format!("{}.{}", self.oid_prefix, self.reserved_attribute_oid)
    }

    /// the identifier of the auxiliary object class
    pub fn auxiliary_class_identifier(&self) -> String {
        format!("{}.{}", self.oid_prefix, self.auxiliary_class_oid)
    }
}

/// an attribute type definition derived 1:1 from a declared attribute,
/// never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeTypeDefinition {
    /// the derived OID
    pub oid: String,
    /// the directory attribute name
    pub name: String,
    /// human-readable description
    pub description: String,
    /// the value syntax OID
    pub syntax: &'static str,
    /// equality matching rule, if any
    pub equality: Option<&'static str>,
    /// ordering matching rule, if any
    pub ordering: Option<&'static str>,
    /// substring matching rule, if any
    pub substring: Option<&'static str>,
    /// whether the attribute holds at most one value
    pub single_valued: bool,
}

impl AttributeTypeDefinition {
    /// render the RFC 4512 attribute type definition submitted to the
    /// server and emitted into generated LDIF
    pub fn definition_string(&self) -> String {
        let mut definition = format!(
            "( {} NAME '{}' DESC '{}'",
            self.oid,
            self.name,
            escape_description(&self.description)
        );
        if let Some(equality) = self.equality {
            definition.push_str(&format!(" EQUALITY {}", equality));
        }
        if let Some(ordering) = self.ordering {
            definition.push_str(&format!(" ORDERING {}", ordering));
        }
        if let Some(substring) = self.substring {
            definition.push_str(&format!(" SUBSTR {}", substring));
        }
        definition.push_str(&format!(" SYNTAX {}", self.syntax));
        if self.single_valued {
            definition.push_str(" SINGLE-VALUE");
        }
        definition.push_str(" )");
        definition
    }
}

/// the auxiliary object class derived from one run's declared attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryClassDefinition {
    /// the derived OID
    pub oid: String,
    /// the class name
    pub name: String,
    /// human-readable description
    pub description: String,
    /// every mapped directory attribute name plus the reserved uniqueID
    /// attribute
    pub may: Vec<String>,
}

impl AuxiliaryClassDefinition {
    /// render the RFC 4512 object class definition
    pub fn definition_string(&self) -> String {
        format!(
            "( {} NAME '{}' DESC '{}' SUP top AUXILIARY MAY ( {} ) )",
            self.oid,
            self.name,
            escape_description(&self.description),
            itertools::join(self.may.iter(), " $ ")
        )
    }
}

/// every schema element one run derives from its configuration and
/// descriptor list
#[derive(Debug, Clone)]
pub struct SchemaElements {
    /// attribute types for the mapped declared attributes, in declaration
    /// order
    pub attribute_types: Vec<AttributeTypeDefinition>,
    /// the reserved uniqueID attribute type
    pub reserved_attribute: AttributeTypeDefinition,
    /// the auxiliary object class listing all of the above
    pub auxiliary_class: AuxiliaryClassDefinition,
}

/// escape a description value for embedding in a quoted RFC 4512 string
fn escape_description(description: &str) -> String {
    description.replace('\\', "\\5C").replace('\'', "\\27")
}

/// the syntax and matching rules for a declared value type
fn syntax_for_kind(
    kind: AttributeValueKind,
) -> (
    &'static str,
    Option<&'static str>,
    Option<&'static str>,
    Option<&'static str>,
) {
    match kind {
        AttributeValueKind::Text | AttributeValueKind::Select => (
            SYNTAX_DIRECTORY_STRING,
            Some("caseIgnoreMatch"),
            Some("caseIgnoreOrderingMatch"),
            Some("caseIgnoreSubstringsMatch"),
        ),
        AttributeValueKind::Number => (SYNTAX_INTEGER, Some("integerMatch"), None, None),
        AttributeValueKind::Boolean => (SYNTAX_BOOLEAN, Some("booleanMatch"), None, None),
    }
}

/// derive the attribute type definitions for the mapped descriptors, in
/// declaration order
pub fn derive_attribute_types(
    config: &SchemaConfig,
    descriptors: &[AttributeDescriptor],
) -> Result<Vec<AttributeTypeDefinition>, ValidationError> {
    mapped_descriptors(descriptors)
        .iter()
        .enumerate()
        .map(|(filtered_index, descriptor)| {
            let name = descriptor
                .mapped_attribute()
                .expect("mapped_descriptors only yields mapped descriptors")
                .to_string();
            let description = if descriptor.display_name.trim().is_empty() {
                descriptor.name.clone()
            } else {
                descriptor.display_name.clone()
            };
            let (syntax, equality, ordering, substring) = syntax_for_kind(descriptor.value_type);
            Ok(AttributeTypeDefinition {
                oid: config.attribute_identifier(filtered_index),
                name,
                description,
                syntax,
                equality,
                ordering,
                substring,
                single_valued: true,
            })
        })
        .collect()
}

/// the definition of the reserved uniqueID attribute, ensured independently
/// of the declared attributes
pub fn reserved_attribute_definition(config: &SchemaConfig) -> AttributeTypeDefinition {
    AttributeTypeDefinition {
        oid: config.reserved_attribute_identifier(),
        name: RESERVED_UNIQUE_ID_ATTRIBUTE.to_string(),
        description: "stable external identifier".to_string(),
        syntax: SYNTAX_DIRECTORY_STRING,
        equality: Some("caseIgnoreMatch"),
        ordering: None,
        substring: None,
        single_valued: true,
    }
}

/// the auxiliary object class listing every mapped attribute plus the
/// reserved uniqueID attribute
pub fn auxiliary_class_definition(
    config: &SchemaConfig,
    attribute_types: &[AttributeTypeDefinition],
) -> AuxiliaryClassDefinition {
    let mut may: Vec<String> = attribute_types.iter().map(|at| at.name.clone()).collect();
    may.push(RESERVED_UNIQUE_ID_ATTRIBUTE.to_string());
    AuxiliaryClassDefinition {
        oid: config.auxiliary_class_identifier(),
        name: config.auxiliary_class_name.clone(),
        description: "auxiliary class carrying provisioned profile attributes".to_string(),
        may,
    }
}

/// derive every schema element for one run and verify the identifier
/// invariants (parseable prefix, no collisions among derived identifiers)
pub fn derive_schema_elements(
    config: &SchemaConfig,
    descriptors: &[AttributeDescriptor],
) -> Result<SchemaElements, ValidationError> {
    if ObjectIdentifier::try_from(config.oid_prefix.as_str()).is_err() {
        return Err(ValidationError::InvalidOidPrefix(config.oid_prefix.clone()));
    }
    let attribute_types = derive_attribute_types(config, descriptors)?;
    let reserved_attribute = reserved_attribute_definition(config);
    let auxiliary_class = auxiliary_class_definition(config, &attribute_types);
    let mut seen = HashSet::new();
    for identifier in attribute_types
        .iter()
        .map(|at| at.oid.clone())
        .chain([reserved_attribute.oid.clone(), auxiliary_class.oid.clone()])
    {
        if !seen.insert(identifier.clone()) {
            return Err(ValidationError::IdentifierCollision(identifier));
        }
    }
    Ok(SchemaElements {
        attribute_types,
        reserved_attribute,
        auxiliary_class,
    })
}

/// error which can happen while introspecting or extending the schema
#[derive(Debug, Error)]
pub enum SchemaError {
    /// the derived definitions violate an identifier invariant
    #[error("schema validation error: {0}")]
    ValidationError(#[from] ValidationError),
    /// an error in the ldap operations performed against the schema
    #[error("Ldap operation error: {0}")]
    LdapOperationError(#[from] LdapOperationError),
    /// a schema modification was rejected by the server
    #[error("ldap3 Ldap error: {0}")]
    LdapError(#[from] ldap3::LdapError),
    /// an error while parsing the retrieved schema
    #[error("chumsky parser error: {0}")]
    ChumskyError(#[from] ChumskyError),
    /// the server does not advertise a subschema subentry
    #[error("directory does not advertise a subschema subentry")]
    MissingSubschema,
}

/// the live subschema as seen at the start of a run, existence is
/// re-checked against this on every run rather than cached across runs
#[derive(Debug)]
pub struct SubschemaView {
    /// the DN schema modifications are directed to
    pub entry_dn: String,
    /// the parsed schema
    pub schema: LDAPSchema,
    /// raw attributeTypes values, fallback for definitions the parser
    /// cannot handle
    raw_attribute_types: Vec<String>,
    /// raw objectClasses values
    raw_object_classes: Vec<String>,
}

impl SubschemaView {
    /// check whether an attribute type with this name is already defined
    pub fn has_attribute_type(&self, name: &str) -> bool {
        if self
            .schema
            .find_attribute_type_property(name, |at| Some(at))
            .is_some()
        {
            return true;
        }
        self.raw_attribute_types
            .iter()
            .any(|definition| names_match(definition, name))
    }

    /// check whether an object class with this name is already defined
    pub fn has_object_class(&self, name: &str) -> bool {
        self.raw_object_classes
            .iter()
            .any(|definition| names_match(definition, name))
    }
}

/// extract the NAME values of a raw RFC 4512 definition
fn definition_names(definition: &str) -> Vec<String> {
    lazy_static! {
        static ref NAME_LIST_RE: Regex =
            Regex::new(r"NAME\s+\(([^)]*)\)").expect("static regex");
        static ref NAME_SINGLE_RE: Regex =
            Regex::new(r"NAME\s+'([^']*)'").expect("static regex");
        static ref QUOTED_RE: Regex = Regex::new(r"'([^']*)'").expect("static regex");
    }
    if let Some(caps) = NAME_LIST_RE.captures(definition) {
        QUOTED_RE
            .captures_iter(caps.get(1).map_or("", |m| m.as_str()))
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .collect()
    } else if let Some(caps) = NAME_SINGLE_RE.captures(definition) {
        caps.get(1)
            .map(|m| vec![m.as_str().to_string()])
            .unwrap_or_default()
    } else {
        Vec::new()
    }
}

/// check whether a raw definition carries the given name
fn names_match(definition: &str, name: &str) -> bool {
    definition_names(definition)
        .iter()
        .any(|n| n.eq_ignore_ascii_case(name))
}

/// parse one multi-valued subschema attribute with the given chumsky parser
fn parse_definitions<T>(
    values: &[String],
    parser: &impl Parser<char, T, Error = Simple<char>>,
    description: &str,
) -> Result<Vec<T>, ChumskyError> {
    values
        .iter()
        .map(|raw| match parser.parse_recovery(raw.as_str()) {
            (Some(parsed), _) => Ok(parsed),
            (_, errs) => Err(ChumskyError {
                description: description.to_string(),
                source: raw.to_string(),
                errors: errs,
            }),
        })
        .collect()
}

/// the values of one multi-valued subschema attribute, empty when the
/// server withholds the attribute
fn subschema_values<'a>(entry: &'a ldap3::SearchEntry, attribute: &str) -> &'a [String] {
    entry
        .attrs
        .get(attribute)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// ask the root DSE where the subschema subentry lives
async fn subschema_entry_dn(ldap: &mut Ldap) -> Result<String, SchemaError> {
    let entry = search_one(ldap, "", "(objectClass=*)", vec!["subschemaSubentry"])
        .await?
        .ok_or(SchemaError::MissingSubschema)?;
    entry
        .attrs
        .get("subschemaSubentry")
        .and_then(|values| values.first())
        .map(|dn| dn.to_string())
        .ok_or(SchemaError::MissingSubschema)
}

/// retrieve and parse the subschema subentry
///
/// definitions the ldap-types parsers cannot handle stay visible through
/// the raw value lists so the existence pre-check still sees them
#[instrument(skip(ldap))]
pub async fn query_subschema(
    ldap: &mut Ldap,
    override_dn: Option<&str>,
) -> Result<SubschemaView, SchemaError> {
    let entry_dn = match override_dn {
        Some(dn) => dn.to_string(),
        None => subschema_entry_dn(ldap).await?,
    };
    let entry = search_one(
        ldap,
        &entry_dn,
        "(objectClass=*)",
        vec![
            "ldapSyntaxes",
            "matchingRules",
            "matchingRuleUse",
            "attributeTypes",
            "objectClasses",
        ],
    )
    .await?
    .ok_or(SchemaError::MissingSubschema)?;
    let raw_attribute_types = subschema_values(&entry, "attributeTypes").to_vec();
    let raw_object_classes = subschema_values(&entry, "objectClasses").to_vec();
    let schema = LDAPSchema {
        ldap_syntaxes: parse_definitions(
            subschema_values(&entry, "ldapSyntaxes"),
            &ldap_syntax_parser(),
            "ldap syntax",
        )?,
        matching_rules: parse_definitions(
            subschema_values(&entry, "matchingRules"),
            &matching_rule_parser(),
            "matching rule",
        )?,
        matching_rule_use: parse_definitions(
            subschema_values(&entry, "matchingRuleUse"),
            &matching_rule_use_parser(),
            "matching rule use",
        )?,
        attribute_types: parse_definitions(
            subschema_values(&entry, "attributeTypes"),
            &attribute_type_parser(),
            "attribute type",
        )?,
        object_classes: parse_definitions(
            subschema_values(&entry, "objectClasses"),
            &object_class_parser(),
            "object class",
        )?,
    };
    Ok(SubschemaView {
        entry_dn,
        schema,
        raw_attribute_types,
        raw_object_classes,
    })
}

/// outcome of one additive schema modification
enum Applied {
    /// the definition was added
    Created,
    /// the server already had the definition, tolerated because the
    /// pre-check can lose a race against a concurrent writer
    AlreadyPresent,
}

/// submit one additive schema modification
async fn apply_schema_value(
    ldap: &mut Ldap,
    schema_dn: &str,
    attribute: &str,
    definition: &str,
) -> Result<Applied, SchemaError> {
    let result = ldap
        .modify(
            schema_dn,
            vec![Mod::Add(
                attribute.to_string(),
                HashSet::from([definition.to_string()]),
            )],
        )
        .await
        .map_err(LdapOperationError::from)?;
    match result.rc {
        0 => Ok(Applied::Created),
        RC_ATTRIBUTE_OR_VALUE_EXISTS | RC_ENTRY_ALREADY_EXISTS => Ok(Applied::AlreadyPresent),
        _ => Err(ldap3::LdapError::from(result).into()),
    }
}

/// what one [ensure_schema] run created and what it found already present
#[derive(Debug, Clone, Default)]
pub struct SchemaSummary {
    /// names of schema elements this run created
    pub created: Vec<String>,
    /// names of schema elements that already existed
    pub skipped: Vec<String>,
}

/// ensure every derived attribute type and the auxiliary object class
/// exist in the live schema
///
/// any modification failure other than an already-exists response is fatal,
/// schema drift is not self-healing and the remaining pipeline must not run
/// against a partially extended schema
#[instrument(skip(ldap, config, descriptors))]
pub async fn ensure_schema(
    ldap: &mut Ldap,
    config: &SchemaConfig,
    descriptors: &[AttributeDescriptor],
) -> Result<SchemaSummary, SchemaError> {
    let elements = derive_schema_elements(config, descriptors)?;
    let view = query_subschema(ldap, config.schema_entry_dn.as_deref()).await?;
    let mut summary = SchemaSummary::default();
    let attribute_types = elements
        .attribute_types
        .iter()
        .chain(std::iter::once(&elements.reserved_attribute));
    for definition in attribute_types {
        if view.has_attribute_type(&definition.name) {
            tracing::debug!("Attribute type {} already defined, skipping", definition.name);
            summary.skipped.push(definition.name.clone());
            continue;
        }
        match apply_schema_value(
            ldap,
            &view.entry_dn,
            "attributeTypes",
            &definition.definition_string(),
        )
        .await?
        {
            Applied::Created => {
                tracing::debug!("Created attribute type {} ({})", definition.name, definition.oid);
                summary.created.push(definition.name.clone());
            }
            Applied::AlreadyPresent => {
                tracing::debug!(
                    "Attribute type {} appeared concurrently, treating as already defined",
                    definition.name
                );
                summary.skipped.push(definition.name.clone());
            }
        }
    }
    let class = &elements.auxiliary_class;
    if view.has_object_class(&class.name) {
        tracing::debug!("Object class {} already defined, skipping", class.name);
        summary.skipped.push(class.name.clone());
    } else {
        match apply_schema_value(
            ldap,
            &view.entry_dn,
            "objectClasses",
            &class.definition_string(),
        )
        .await?
        {
            Applied::Created => {
                tracing::debug!("Created object class {} ({})", class.name, class.oid);
                summary.created.push(class.name.clone());
            }
            Applied::AlreadyPresent => summary.skipped.push(class.name.clone()),
        }
    }
    Ok(summary)
}

/// map of attribute name to derived identifier, convenience for callers
/// that need to report or cross-check the numbering
pub fn derived_identifiers(elements: &SchemaElements) -> HashMap<String, String> {
    elements
        .attribute_types
        .iter()
        .chain(std::iter::once(&elements.reserved_attribute))
        .map(|at| (at.name.clone(), at.oid.clone()))
        .chain(std::iter::once((
            elements.auxiliary_class.name.clone(),
            elements.auxiliary_class.oid.clone(),
        )))
        .collect()
}
