//! Wire model of the snapshot served by the delivery endpoint.
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::rules::RuleSet;

/// Server-delivered payload of current test weights, flag values and remote-config values for a
/// project and environment.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    /// Current weights of each test.
    #[serde(default)]
    pub tests: Vec<TestWire>,
    /// Flag values with their targeting rules.
    #[serde(default)]
    pub flags: Vec<FlagWire>,
    /// Remote-config values with their targeting rules.
    #[serde(default)]
    pub remote_config: Vec<RemoteConfigWire>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Weights of a test, aligned with the variants declared in its [`TestConfig`](crate::TestConfig).
pub struct TestWire {
    /// Test name.
    pub name: String,
    /// One weight per declared variant. Normalized before selection.
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Server value of a flag.
pub struct FlagWire {
    /// Flag name.
    pub name: String,
    /// Value served when no rule matches.
    pub value: bool,
    /// Optional targeting rules evaluated against the user properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_set: Option<RuleSet<bool>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Server value of a remote-config entry.
pub struct RemoteConfigWire {
    /// Entry name.
    pub name: String,
    /// Value served when no rule matches.
    pub value: RemoteConfigValue,
    /// Optional targeting rules evaluated against the user properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_set: Option<RuleSet<RemoteConfigValue>>,
}

/// Declared type of a remote-config entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteConfigType {
    /// Resolves to [`RemoteConfigValue::String`].
    String,
    /// Resolves to [`RemoteConfigValue::Number`].
    Number,
    /// Resolves to [`RemoteConfigValue::Json`].
    #[serde(rename = "JSON")]
    Json,
}

impl RemoteConfigType {
    /// Value used when neither the snapshot nor the settings provide one.
    pub fn builtin_default(self) -> RemoteConfigValue {
        match self {
            RemoteConfigType::String => RemoteConfigValue::String(String::new()),
            RemoteConfigType::Number => RemoteConfigValue::Number(0.0),
            RemoteConfigType::Json => RemoteConfigValue::Json(serde_json::json!({})),
        }
    }

    /// Parse a persisted (string) representation of a value of this type.
    ///
    /// Returns `None` if the content does not describe a value of this type.
    pub fn parse_persisted(self, raw: &str) -> Option<RemoteConfigValue> {
        match self {
            RemoteConfigType::String => Some(RemoteConfigValue::String(raw.to_owned())),
            RemoteConfigType::Number => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(RemoteConfigValue::Number),
            RemoteConfigType::Json => serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .filter(serde_json::Value::is_object)
                .map(RemoteConfigValue::Json),
        }
    }

    /// Whether `value` is a value of this type. `JSON` entries only hold objects.
    pub fn accepts(self, value: &RemoteConfigValue) -> bool {
        match (self, value) {
            (RemoteConfigType::String, RemoteConfigValue::String(_))
            | (RemoteConfigType::Number, RemoteConfigValue::Number(_)) => true,
            (RemoteConfigType::Json, RemoteConfigValue::Json(value)) => value.is_object(),
            _ => false,
        }
    }
}

/// Value of a remote-config entry.
///
/// Serialized untagged: a JSON string maps to `String`, a JSON number to `Number` and anything
/// else to `Json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum RemoteConfigValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// Any other JSON value. Only objects are served for `JSON` entries.
    Json(serde_json::Value),
}

impl RemoteConfigValue {
    /// The string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RemoteConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The number, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RemoteConfigValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The JSON value, if this is neither a string nor a number.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            RemoteConfigValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// String form used when persisting an override through a storage port.
    pub fn to_persisted(&self) -> String {
        match self {
            RemoteConfigValue::String(s) => s.clone(),
            RemoteConfigValue::Number(n) => n.to_string(),
            RemoteConfigValue::Json(v) => v.to_string(),
        }
    }
}

impl From<&str> for RemoteConfigValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// The delivery endpoint may send entries a given SDK version does not understand (e.g., a new
/// rule operator). Those entries are dropped, logged at `error` level, and the rest of the
/// snapshot is still served. A dropped flag or remote-config entry resolves through its
/// fallback chain as if the server had not sent it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

/// Tolerant form of [`ServerSnapshot`] used to decode server responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SnapshotResponse {
    #[serde(default)]
    tests: Vec<TryParse<TestWire>>,
    #[serde(default)]
    flags: Vec<TryParse<FlagWire>>,
    #[serde(default)]
    remote_config: Vec<TryParse<RemoteConfigWire>>,
}

impl From<SnapshotResponse> for ServerSnapshot {
    fn from(response: SnapshotResponse) -> ServerSnapshot {
        ServerSnapshot {
            tests: keep_parsed("test", response.tests),
            flags: keep_parsed("flag", response.flags),
            remote_config: keep_parsed("remote config", response.remote_config),
        }
    }
}

fn keep_parsed<T>(kind: &str, entries: Vec<TryParse<T>>) -> Vec<T> {
    entries
        .into_iter()
        .filter_map(|entry| match entry {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(json) => {
                let name = json.get("name").and_then(serde_json::Value::as_str).unwrap_or_default();
                log::error!(target: "abby", kind, name, entry:serde = json; "dropping snapshot entry that failed to parse, serving fallbacks instead");
                None
            }
        })
        .collect()
}
