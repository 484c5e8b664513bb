//! Compact encoding of [`ServerSnapshot`] for embedding (e.g., into an HTML document for client
//! hydration) and a stable string hash shared by all SDKs.
//!
//! The compact form replaces objects with positional arrays:
//!
//! ```text
//! {"t":[[name,[weight,..]],..],"f":[[name,value,rules?],..],"r":[[name,value,rules?],..]}
//! ```
//!
//! Encoding is canonical: `serialize_abby_data(&parse_abby_data(s)?)? == s` for any `s` produced
//! by [`serialize_abby_data`].
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{ser::Error as _, Deserialize, Serialize};

use crate::{
    rules::RuleSet,
    snapshot::{FlagWire, RemoteConfigValue, RemoteConfigWire, ServerSnapshot, TestWire},
    Error, Result,
};

#[derive(Serialize, Deserialize)]
struct CompactData {
    #[serde(rename = "t")]
    tests: Vec<CompactTest>,
    #[serde(rename = "f")]
    flags: Vec<CompactEntry<bool>>,
    #[serde(rename = "r")]
    remote_config: Vec<CompactEntry<RemoteConfigValue>>,
}

#[derive(Serialize, Deserialize)]
struct CompactTest(String, Vec<f64>);

/// Entries without rules are encoded as 2-element arrays.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CompactEntry<T> {
    WithRules(String, T, RuleSet<T>),
    Plain(String, T),
}

impl<T> CompactEntry<T> {
    fn new(name: String, value: T, rule_set: Option<RuleSet<T>>) -> CompactEntry<T> {
        match rule_set {
            Some(rule_set) => CompactEntry::WithRules(name, value, rule_set),
            None => CompactEntry::Plain(name, value),
        }
    }

    fn into_parts(self) -> (String, T, Option<RuleSet<T>>) {
        match self {
            CompactEntry::WithRules(name, value, rule_set) => (name, value, Some(rule_set)),
            CompactEntry::Plain(name, value) => (name, value, None),
        }
    }
}

impl From<&ServerSnapshot> for CompactData {
    fn from(snapshot: &ServerSnapshot) -> CompactData {
        CompactData {
            tests: snapshot
                .tests
                .iter()
                .map(|test| CompactTest(test.name.clone(), test.weights.clone()))
                .collect(),
            flags: snapshot
                .flags
                .iter()
                .map(|flag| CompactEntry::new(flag.name.clone(), flag.value, flag.rule_set.clone()))
                .collect(),
            remote_config: snapshot
                .remote_config
                .iter()
                .map(|rc| CompactEntry::new(rc.name.clone(), rc.value.clone(), rc.rule_set.clone()))
                .collect(),
        }
    }
}

impl From<CompactData> for ServerSnapshot {
    fn from(data: CompactData) -> ServerSnapshot {
        ServerSnapshot {
            tests: data
                .tests
                .into_iter()
                .map(|CompactTest(name, weights)| TestWire { name, weights })
                .collect(),
            flags: data
                .flags
                .into_iter()
                .map(|entry| {
                    let (name, value, rule_set) = entry.into_parts();
                    FlagWire {
                        name,
                        value,
                        rule_set,
                    }
                })
                .collect(),
            remote_config: data
                .remote_config
                .into_iter()
                .map(|entry| {
                    let (name, value, rule_set) = entry.into_parts();
                    RemoteConfigWire {
                        name,
                        value,
                        rule_set,
                    }
                })
                .collect(),
        }
    }
}

/// Encode a snapshot into its compact string form.
///
/// JSON has no representation for NaN or infinity, so snapshots holding non-finite weights or
/// numbers are rejected with [`Error::Codec`] instead of being encoded lossily.
pub fn serialize_abby_data(snapshot: &ServerSnapshot) -> Result<String> {
    if let Some(name) = first_non_finite(snapshot) {
        return Err(serde_json::Error::custom(format!("`{name}` holds a non-finite number")).into());
    }
    Ok(serde_json::to_string(&CompactData::from(snapshot))?)
}

fn first_non_finite(snapshot: &ServerSnapshot) -> Option<&str> {
    let tests = snapshot
        .tests
        .iter()
        .filter(|test| test.weights.iter().any(|w| !w.is_finite()))
        .map(|test| test.name.as_str());
    let remote_config = snapshot
        .remote_config
        .iter()
        .filter(|rc| rc.value.as_number().is_some_and(|n| !n.is_finite()))
        .map(|rc| rc.name.as_str());

    tests.chain(remote_config).next()
}

/// Decode a snapshot from the compact string form produced by [`serialize_abby_data`].
pub fn parse_abby_data(data: &str) -> Result<ServerSnapshot> {
    let compact: CompactData = serde_json::from_str(data)?;
    Ok(compact.into())
}

/// Compact form wrapped in URL-safe base64, safe to inline into HTML attributes or script
/// globals without escaping.
pub fn encode_window_data(snapshot: &ServerSnapshot) -> Result<String> {
    let compact = serialize_abby_data(snapshot)?;
    Ok(URL_SAFE_NO_PAD.encode(compact))
}

/// Inverse of [`encode_window_data`].
pub fn decode_window_data(data: &str) -> Result<ServerSnapshot> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim())
        .map_err(Error::InvalidBase64)?;
    let compact: CompactData = serde_json::from_slice(&bytes)?;
    Ok(compact.into())
}

/// Stable 32-bit hash of a string, used to key flag names compactly.
///
/// Computed over the UTF-16 code units of `s` as `h = h * 31 + unit` with 32-bit wrapping
/// arithmetic, so the result is identical to the JavaScript SDKs' `(h << 5) - h + c` loop.
pub fn hash_string_to_int32(s: &str) -> i32 {
    s.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}
