//! Seeding local overrides from an ambient cookie source (e.g., the `Cookie` header of the
//! incoming request during server-side rendering, or `document.cookie` in a browser adapter).
use std::collections::HashMap;

use crate::storage::{consent_key, StorageKind};

/// Provides the current cookie string in `Cookie` header syntax (`name=value; name2=value2`).
///
/// Implemented for closures, so an adapter can simply pass `|| Some(header.clone())`.
pub trait CookieSource {
    /// Current cookie string, or `None` if no cookies are available.
    fn cookie_string(&self) -> Option<String>;
}

impl<T: Fn() -> Option<String>> CookieSource for T {
    fn cookie_string(&self) -> Option<String> {
        self()
    }
}

/// Split a cookie string into `(name, value)` pairs. Malformed pairs are skipped; values are
/// percent-decoded.
pub fn parse_cookie_string(cookies: &str) -> Vec<(String, String)> {
    cookies
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = percent_decode(value.trim().trim_matches('"'));
            Some((name.to_owned(), value))
        })
        .collect()
}

/// Percent-decode a cookie value. `+` and `&` are literal in cookie values, so they are escaped
/// before running the form decoder.
fn percent_decode(value: &str) -> String {
    let escaped = format!("v={}", value.replace('+', "%2B").replace('&', "%26"));
    url::form_urlencoded::parse(escaped.as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

/// Abby-related values found in a cookie string for one project.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct CookieOverrides {
    pub tests: HashMap<String, String>,
    pub flags: HashMap<String, String>,
    pub remote_config: HashMap<String, String>,
    pub consent: Option<bool>,
}

impl CookieOverrides {
    /// Collect values of the three entity prefixes scoped to `project_id`, plus the consent key.
    /// Cookies of other projects and unrelated cookies are ignored.
    pub fn parse(project_id: &str, cookies: &str) -> CookieOverrides {
        let consent_key = consent_key(project_id);
        let mut overrides = CookieOverrides::default();

        for (name, value) in parse_cookie_string(cookies) {
            if name == consent_key {
                overrides.consent = parse_bool(&value);
                continue;
            }

            for kind in [StorageKind::Test, StorageKind::Flag, StorageKind::RemoteConfig] {
                if let Some(entity) = kind.entity_name(project_id, &name) {
                    let target = match kind {
                        StorageKind::Test => &mut overrides.tests,
                        StorageKind::Flag => &mut overrides.flags,
                        StorageKind::RemoteConfig => &mut overrides.remote_config,
                    };
                    target.insert(entity.to_owned(), value.clone());
                    break;
                }
            }
        }

        overrides
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
