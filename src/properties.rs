//! User properties and the validators declared for them.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Current properties of the user, used by targeting rules.
///
/// # Examples
/// ```
/// # use abby::{UserProperties, PropertyValue};
/// let properties = [
///     ("age".to_owned(), 30.0.into()),
///     ("isPremium".to_owned(), true.into()),
///     ("email".to_owned(), "jane@example.com".into()),
/// ].into_iter().collect::<UserProperties>();
/// ```
pub type UserProperties = HashMap<String, PropertyValue>;

/// Value of a single user property.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum PropertyValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value. Only accepted for optional properties.
    Null,
}

impl PropertyValue {
    fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "string",
            PropertyValue::Number(_) => "number",
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Null => "null",
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Declared type of a user property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    /// Accepts [`PropertyValue::String`].
    String,
    /// Accepts [`PropertyValue::Number`].
    Number,
    /// Accepts [`PropertyValue::Boolean`].
    Boolean,
}

impl std::fmt::Display for PropertyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
        })
    }
}

/// Validator declared for a user property at configuration time.
///
/// ```
/// # use abby::PropertyValidator;
/// let email = PropertyValidator::string();
/// let age = PropertyValidator::number().optional();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValidator {
    #[serde(rename = "type")]
    pub(crate) ty: PropertyType,
    #[serde(default)]
    pub(crate) optional: bool,
}

impl PropertyValidator {
    /// A required string property.
    pub fn string() -> PropertyValidator {
        PropertyValidator::new(PropertyType::String)
    }

    /// A required number property.
    pub fn number() -> PropertyValidator {
        PropertyValidator::new(PropertyType::Number)
    }

    /// A required boolean property.
    pub fn boolean() -> PropertyValidator {
        PropertyValidator::new(PropertyType::Boolean)
    }

    /// Accept `null` in addition to the declared type.
    pub fn optional(mut self) -> PropertyValidator {
        self.optional = true;
        self
    }

    fn new(ty: PropertyType) -> PropertyValidator {
        PropertyValidator {
            ty,
            optional: false,
        }
    }

    fn accepts(&self, value: &PropertyValue) -> bool {
        match (self.ty, value) {
            (_, PropertyValue::Null) => self.optional,
            (PropertyType::String, PropertyValue::String(_))
            | (PropertyType::Number, PropertyValue::Number(_))
            | (PropertyType::Boolean, PropertyValue::Boolean(_)) => true,
            _ => false,
        }
    }
}

/// A single property that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyViolation {
    /// Name of the offending property.
    pub property: String,
    /// Declared type, or `None` if no validator was declared for the property.
    pub expected: Option<PropertyType>,
    /// Type of the supplied value.
    pub actual: &'static str,
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.expected {
            Some(expected) => write!(
                f,
                "`{}` expected {} but received {}",
                self.property, expected, self.actual
            ),
            None => write!(f, "`{}` is not a declared user property", self.property),
        }
    }
}

/// Check every supplied property against its validator. Returns all violations at once, sorted
/// by property name so error messages are stable.
pub(crate) fn validate(
    validators: &HashMap<String, PropertyValidator>,
    properties: &UserProperties,
) -> Vec<PropertyViolation> {
    let mut violations = properties
        .iter()
        .filter_map(|(name, value)| match validators.get(name) {
            Some(validator) if validator.accepts(value) => None,
            Some(validator) => Some(PropertyViolation {
                property: name.clone(),
                expected: Some(validator.ty),
                actual: value.type_name(),
            }),
            None => Some(PropertyViolation {
                property: name.clone(),
                expected: None,
                actual: value.type_name(),
            }),
        })
        .collect::<Vec<_>>();

    violations.sort_by(|a, b| a.property.cmp(&b.property));
    violations
}
