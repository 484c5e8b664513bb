//! Targeting rules evaluated against user properties.
//!
//! A [`RuleSet`] is an ordered list of [rules](Rule) and [rule groups](RuleGroup). Evaluation is
//! first-match-wins: the `then_value` of the first entry that matches replaces the base value of
//! the flag or remote-config entry.
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::properties::{PropertyValue, UserProperties};

/// Ordered targeting rules. Order is significant.
pub type RuleSet<T> = Vec<RuleSetEntry<T>>;

/// A single entry of a [`RuleSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSetEntry<T> {
    /// Several conditions combined with `and`/`or`. Tried first when parsing, as only groups
    /// carry a `rules` field.
    Group(RuleGroup<T>),
    /// A single condition.
    Rule(Rule<T>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Serve `then_value` when `condition` matches.
pub struct Rule<T> {
    #[allow(missing_docs)]
    #[serde(flatten)]
    pub condition: Condition,
    /// Value served on match.
    #[serde(rename = "thenValue")]
    pub then_value: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Serve `then_value` when the conditions, combined with `operator`, match.
pub struct RuleGroup<T> {
    #[allow(missing_docs)]
    pub operator: GroupOperator,
    #[allow(missing_docs)]
    pub rules: Vec<Condition>,
    /// Value served on match.
    #[serde(rename = "thenValue")]
    pub then_value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// How the conditions of a [`RuleGroup`] are combined.
pub enum GroupOperator {
    /// Every condition matches.
    And,
    /// At least one condition matches.
    Or,
}

/// A predicate over one user property. The variant is the declared property type; a property of
/// another type never matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "propertyType", rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Condition {
    String {
        #[serde(rename = "propertyName")]
        property_name: String,
        operator: StringOperator,
        value: String,
    },
    Number {
        #[serde(rename = "propertyName")]
        property_name: String,
        operator: NumberOperator,
        value: f64,
    },
    Boolean {
        #[serde(rename = "propertyName")]
        property_name: String,
        operator: BooleanOperator,
        value: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum StringOperator {
    Eq,
    Neq,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum NumberOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum BooleanOperator {
    Eq,
    Neq,
}

/// Return the `then_value` of the first matching entry, or `None` if nothing matches and the
/// base value should be used.
pub(crate) fn evaluate<'a, T>(
    rule_set: &'a [RuleSetEntry<T>],
    properties: &UserProperties,
) -> Option<&'a T> {
    rule_set.iter().find_map(|entry| {
        if entry.matches(properties) {
            Some(entry.then_value())
        } else {
            None
        }
    })
}

impl<T> RuleSetEntry<T> {
    fn matches(&self, properties: &UserProperties) -> bool {
        match self {
            RuleSetEntry::Rule(rule) => rule.condition.eval(properties),
            RuleSetEntry::Group(group) => group.eval(properties),
        }
    }

    fn then_value(&self) -> &T {
        match self {
            RuleSetEntry::Rule(rule) => &rule.then_value,
            RuleSetEntry::Group(group) => &group.then_value,
        }
    }
}

impl<T> RuleGroup<T> {
    /// An empty `and` group matches (vacuous truth), an empty `or` group does not.
    fn eval(&self, properties: &UserProperties) -> bool {
        match self.operator {
            GroupOperator::And => self.rules.iter().all(|rule| rule.eval(properties)),
            GroupOperator::Or => self.rules.iter().any(|rule| rule.eval(properties)),
        }
    }
}

impl Condition {
    /// Name of the user property tested by this condition.
    pub fn property_name(&self) -> &str {
        match self {
            Condition::String { property_name, .. }
            | Condition::Number { property_name, .. }
            | Condition::Boolean { property_name, .. } => property_name,
        }
    }

    /// The named property must exist and have the declared type, otherwise the condition does
    /// not match.
    fn eval(&self, properties: &UserProperties) -> bool {
        let actual = properties.get(self.property_name());
        match (self, actual) {
            (Condition::String { operator, value, .. }, Some(PropertyValue::String(actual))) => {
                operator.eval(actual, value)
            }
            (Condition::Number { operator, value, .. }, Some(PropertyValue::Number(actual))) => {
                operator.eval(*actual, *value)
            }
            (Condition::Boolean { operator, value, .. }, Some(PropertyValue::Boolean(actual))) => {
                operator.eval(*actual, *value)
            }
            _ => false,
        }
    }
}

impl StringOperator {
    fn eval(self, actual: &str, expected: &str) -> bool {
        match self {
            Self::Eq => actual == expected,
            Self::Neq => actual != expected,
            Self::Contains => actual.contains(expected),
            Self::NotContains => !actual.contains(expected),
            Self::StartsWith => actual.starts_with(expected),
            Self::EndsWith => actual.ends_with(expected),
            Self::Regex => match Regex::new(expected) {
                Ok(regex) => regex.is_match(actual),
                Err(err) => {
                    log::warn!(target: "abby", pattern = expected; "invalid regex in rule: {err}");
                    false
                }
            },
        }
    }
}

impl NumberOperator {
    fn eval(self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Eq => actual == expected,
            Self::Neq => actual != expected,
            Self::Gt => actual > expected,
            Self::Gte => actual >= expected,
            Self::Lt => actual < expected,
            Self::Lte => actual <= expected,
        }
    }
}

impl BooleanOperator {
    fn eval(self, actual: bool, expected: bool) -> bool {
        match self {
            Self::Eq => actual == expected,
            Self::Neq => actual != expected,
        }
    }
}
