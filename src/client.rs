use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::{
    config::ProjectConfig,
    cookies::{parse_bool, CookieOverrides, CookieSource},
    fetcher::{HttpFetcher, SnapshotFetcher},
    listener::{Listener, Listeners, Subscription},
    properties::UserProperties,
    rules::{self, RuleSet},
    selector,
    snapshot::{RemoteConfigType, RemoteConfigValue, ServerSnapshot},
    storage::{consent_key, StorageKind, StorageOptions, StoragePorts},
    Error, Result,
};

/// The assignment engine of a project.
///
/// Resolves test variants, feature flags and remote-config values by combining the declared
/// [`ProjectConfig`], the server snapshot, local overrides, targeting rules and persisted
/// assignments. Evaluation never fails: when nothing else is available, configured defaults are
/// served.
///
/// In order to create an engine, first create a [`ProjectConfig`].
///
/// # Examples
/// ```
/// # use abby::{Abby, ProjectConfig, StoragePorts};
/// let abby = ProjectConfig::new("project-id")
///     .test("footer", ["A", "B"])
///     .flag("darkMode")
///     .to_engine(StoragePorts::in_memory());
///
/// assert!(abby.get_test_variant("footer").is_some());
/// assert!(!abby.get_feature_flag("darkMode"));
/// ```
pub struct Abby {
    config: ProjectConfig,
    storage: StoragePorts,
    cookie_source: Option<Box<dyn CookieSource + Send + Sync>>,
    state: LocalState,
    listeners: Listeners,
    hydration_attempted: bool,
    cookies_enabled: bool,
}

/// Fully resolved values of every declared test, flag and remote-config entry.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectData {
    /// Assigned variant per test. Tests without variants are omitted.
    pub tests: BTreeMap<String, String>,
    /// Resolved value per flag.
    pub flags: BTreeMap<String, bool>,
    /// Resolved value per remote-config entry.
    pub remote_config: BTreeMap<String, RemoteConfigValue>,
}

/// Value received from the server along with the rules that may replace it.
struct Hydrated<T> {
    value: T,
    rule_set: RuleSet<T>,
}

impl<T> Hydrated<T> {
    fn resolve(&self, properties: &UserProperties) -> &T {
        rules::evaluate(&self.rule_set, properties).unwrap_or(&self.value)
    }
}

#[derive(Default)]
struct LocalState {
    test_weights: HashMap<String, Vec<f64>>,
    flags: HashMap<String, Hydrated<bool>>,
    remote_config: HashMap<String, Hydrated<RemoteConfigValue>>,
    test_overrides: HashMap<String, String>,
    flag_overrides: HashMap<String, bool>,
    remote_config_overrides: HashMap<String, RemoteConfigValue>,
    user_properties: UserProperties,
}

impl Abby {
    /// Create a new engine using the specified configuration and storage.
    ///
    /// Storage consent is read from the persisted consent marker if present; otherwise it is
    /// granted unless [`CookieSettings::disable_by_default`](crate::CookieSettings) is set.
    pub fn new(config: ProjectConfig, storage: StoragePorts) -> Abby {
        let cookies_enabled = storage
            .tests
            .get(&consent_key(&config.project_id))
            .as_deref()
            .and_then(parse_bool)
            .unwrap_or(!config.cookies.disable_by_default);

        if !config.environments.is_empty()
            && !config.environments.contains(&config.current_environment)
        {
            log::warn!(target: "abby",
                environment = config.current_environment.as_str();
                "current environment is not one of the declared environments");
        }

        Abby {
            config,
            storage,
            cookie_source: None,
            state: LocalState::default(),
            listeners: Listeners::default(),
            hydration_attempted: false,
            cookies_enabled,
        }
    }

    /// Read overrides from `source` on every [`Abby::init`].
    pub fn with_cookie_source(mut self, source: impl CookieSource + Send + Sync + 'static) -> Abby {
        self.cookie_source = Some(Box::new(source));
        self
    }

    /// The configuration this engine was built from.
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Hydrate the engine from `snapshot`, then seed overrides from the cookie source (if any).
    ///
    /// Entries not declared in the configuration are ignored. Declared entries missing from the
    /// snapshot keep their configured defaults. Calling `init` counts as hydration, so
    /// [`Abby::get_project_data_async`] will not fetch afterwards.
    pub fn init(&mut self, snapshot: ServerSnapshot) {
        self.hydration_attempted = true;
        self.hydrate(snapshot);
        self.seed_cookie_overrides();
        self.notify();
    }

    /// Fetch the project snapshot from the delivery endpoint and hydrate the engine.
    ///
    /// The fetch happens at most once per engine, even if it fails. A failed fetch is logged and
    /// leaves the configured defaults in place.
    pub async fn get_project_data_async(&mut self) -> ProjectData {
        let fetcher = HttpFetcher::new(self.config.base_url.clone());
        self.get_project_data_async_with(&fetcher).await
    }

    /// Same as [`Abby::get_project_data_async`] but fetches through `fetcher`.
    pub async fn get_project_data_async_with<F: SnapshotFetcher>(
        &mut self,
        fetcher: &F,
    ) -> ProjectData {
        if !self.hydration_attempted {
            self.hydration_attempted = true;

            let result = fetcher
                .fetch_snapshot(&self.config.project_id, &self.config.current_environment)
                .await;
            match result {
                Ok(snapshot) => self.init(snapshot),
                Err(err) => {
                    log::warn!(target: "abby",
                        project_id = self.config.project_id.as_str(),
                        environment = self.config.current_environment.as_str();
                        "failed to fetch project data, serving defaults: {err}");
                }
            }
        }

        self.get_project_data()
    }

    /// Resolve the variant of test `name`.
    ///
    /// Returns `None` if the test is not declared or has no variants. A freshly drawn variant is
    /// persisted (when storage consent is given) so later calls return the same variant.
    pub fn get_test_variant(&self, name: &str) -> Option<String> {
        let Some(test) = self.config.tests.get(name) else {
            log::warn!(target: "abby", test_name = name; "resolving a test that is not declared");
            return None;
        };

        if let Some(variant) = self.state.test_overrides.get(name) {
            return Some(variant.clone());
        }

        let key = self.key(StorageKind::Test, name);
        if let Some(stored) = self.storage.tests.get(&key) {
            if test.variants.contains(&stored) {
                return Some(stored);
            }
            log::debug!(target: "abby", test_name = name, variant = stored.as_str(); "ignoring persisted variant that is not declared");
        }

        let weights = self
            .state
            .test_weights
            .get(name)
            .or(test.weights.as_ref())
            .map(Vec::as_slice);

        if !self.cookies_enabled {
            return selector::select_deterministic(&test.variants, weights).map(str::to_owned);
        }

        let variant = selector::select(&test.variants, weights)?.to_owned();
        log::trace!(target: "abby", test_name = name, variant = variant.as_str(); "assigned test variant");
        self.persist_test_variant(&key, &variant);
        Some(variant)
    }

    /// Resolve the value of feature flag `name`. Never fails; `false` is the last resort.
    pub fn get_feature_flag(&self, name: &str) -> bool {
        if !self.config.flags.contains(name) {
            log::debug!(target: "abby", flag_name = name; "resolving a flag that is not declared");
        }

        let value = self.resolve_flag(name);
        log::trace!(target: "abby", flag_name = name, value; "evaluated feature flag");
        value
    }

    /// Resolve the value of remote-config entry `name`. The value always has the declared type.
    ///
    /// Returns `None` only if `name` is not declared.
    pub fn get_remote_config(&self, name: &str) -> Option<RemoteConfigValue> {
        let Some(ty) = self.config.remote_config.get(name).copied() else {
            log::warn!(target: "abby", remote_config_name = name; "resolving a remote config entry that is not declared");
            return None;
        };

        let value = self.resolve_remote_config(name, ty);
        log::trace!(target: "abby", remote_config_name = name, value:serde; "evaluated remote config");
        Some(value)
    }

    /// Resolved variant of every declared test.
    pub fn get_tests(&self) -> BTreeMap<String, String> {
        self.config
            .tests
            .keys()
            .filter_map(|name| Some((name.clone(), self.get_test_variant(name)?)))
            .collect()
    }

    /// Resolved value of every declared flag.
    pub fn get_feature_flags(&self) -> BTreeMap<String, bool> {
        self.config
            .flags
            .iter()
            .map(|name| (name.clone(), self.resolve_flag(name)))
            .collect()
    }

    /// Resolved value of every declared remote-config entry.
    pub fn get_remote_configs(&self) -> BTreeMap<String, RemoteConfigValue> {
        self.config
            .remote_config
            .iter()
            .map(|(name, ty)| (name.clone(), self.resolve_remote_config(name, *ty)))
            .collect()
    }

    /// Resolve everything. This is what listeners receive.
    pub fn get_project_data(&self) -> ProjectData {
        ProjectData {
            tests: self.get_tests(),
            flags: self.get_feature_flags(),
            remote_config: self.get_remote_configs(),
        }
    }

    /// Force `variant` for test `name` and persist it. Undeclared tests or variants are ignored.
    pub fn update_local_variant(&mut self, name: &str, variant: impl Into<String>) {
        let variant = variant.into();
        match self.config.tests.get(name) {
            Some(test) if test.variants.contains(&variant) => {}
            _ => {
                log::warn!(target: "abby", test_name = name, variant = variant.as_str(); "ignoring override with an undeclared test variant");
                return;
            }
        }

        self.persist_test_variant(&self.key(StorageKind::Test, name), &variant);
        self.state.test_overrides.insert(name.to_owned(), variant);
        self.notify();
    }

    /// Drop the local override of test `name`. The persisted assignment is kept.
    pub fn remove_local_variant(&mut self, name: &str) {
        if self.state.test_overrides.remove(name).is_some() {
            self.notify();
        }
    }

    /// Forget both the override and the persisted assignment of test `name`, so the next
    /// resolution draws again.
    pub fn reset_test_assignment(&mut self, name: &str) {
        self.state.test_overrides.remove(name);
        self.storage.tests.remove(&self.key(StorageKind::Test, name));
        self.notify();
    }

    /// Override flag `name` in every environment and persist the override.
    pub fn update_flag(&mut self, name: &str, value: bool) {
        if !self.config.flags.contains(name) {
            log::warn!(target: "abby", flag_name = name; "ignoring override of a flag that is not declared");
            return;
        }

        self.storage.flags.set(
            &self.key(StorageKind::Flag, name),
            &value.to_string(),
            self.storage_options(),
        );
        self.state.flag_overrides.insert(name.to_owned(), value);
        self.notify();
    }

    /// Drop the override of flag `name`, both in memory and in storage.
    pub fn remove_flag_override(&mut self, name: &str) {
        self.state.flag_overrides.remove(name);
        self.storage.flags.remove(&self.key(StorageKind::Flag, name));
        self.notify();
    }

    /// Override remote-config entry `name` and persist the override. Values that do not match
    /// the declared type are ignored.
    pub fn update_remote_config(&mut self, name: &str, value: impl Into<RemoteConfigValue>) {
        let value = value.into();
        match self.config.remote_config.get(name) {
            Some(ty) if ty.accepts(&value) => {}
            _ => {
                log::warn!(target: "abby", remote_config_name = name, value:serde; "ignoring remote config override that is not declared with this type");
                return;
            }
        }

        self.storage.remote_config.set(
            &self.key(StorageKind::RemoteConfig, name),
            &value.to_persisted(),
            self.storage_options(),
        );
        self.state
            .remote_config_overrides
            .insert(name.to_owned(), value);
        self.notify();
    }

    /// Drop the override of remote-config entry `name`, both in memory and in storage.
    pub fn remove_remote_config_override(&mut self, name: &str) {
        self.state.remote_config_overrides.remove(name);
        self.storage
            .remote_config
            .remove(&self.key(StorageKind::RemoteConfig, name));
        self.notify();
    }

    /// Validate and merge `properties` into the current user properties.
    ///
    /// Every property must be declared and match its validator. On failure, the returned
    /// [`Error::InvalidUserProperties`] lists all violations and nothing is applied.
    pub fn update_user_properties(&mut self, properties: UserProperties) -> Result<()> {
        let violations = crate::properties::validate(&self.config.user_properties, &properties);
        if !violations.is_empty() {
            let err = Error::InvalidUserProperties(violations);
            log::warn!(target: "abby", "rejected user properties: {err}");
            return Err(err);
        }

        self.state.user_properties.extend(properties);
        self.notify();
        Ok(())
    }

    /// Current (validated) user properties.
    pub fn get_user_properties(&self) -> &UserProperties {
        &self.state.user_properties
    }

    /// Grant storage consent, persist the consent marker and persist a variant for every
    /// declared test right away.
    pub fn enable_cookies(&mut self) {
        self.cookies_enabled = true;
        self.persist_consent(true);

        for name in self.config.tests.keys() {
            let Some(variant) = self.get_test_variant(name) else {
                continue;
            };
            // Overridden variants are served without touching storage, so write them here.
            let key = self.key(StorageKind::Test, name);
            if self.storage.tests.get(&key).as_deref() != Some(variant.as_str()) {
                self.persist_test_variant(&key, &variant);
            }
        }
        self.notify();
    }

    /// Withdraw storage consent and persist the consent marker. Persisted test assignments are
    /// removed; tests then resolve deterministically to their highest-weight variant.
    pub fn disable_cookies(&mut self) {
        self.cookies_enabled = false;

        for name in self.config.tests.keys() {
            self.storage.tests.remove(&self.key(StorageKind::Test, name));
        }
        self.persist_consent(false);
        self.notify();
    }

    /// Whether the user has consented to assignments being persisted.
    pub fn cookies_enabled(&self) -> bool {
        self.cookies_enabled
    }

    /// Register `listener`. It is called synchronously with the resolved [`ProjectData`] after
    /// every mutating call.
    pub fn subscribe(&mut self, listener: impl Listener + Send + Sync + 'static) -> Subscription {
        self.listeners.add(Box::new(listener))
    }

    /// Remove a listener. Returns `false` if it was already removed.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.listeners.remove(subscription)
    }

    fn hydrate(&mut self, snapshot: ServerSnapshot) {
        for test in snapshot.tests {
            if self.config.tests.contains_key(&test.name) {
                self.state.test_weights.insert(test.name, test.weights);
            } else {
                log::debug!(target: "abby", test_name = test.name.as_str(); "ignoring undeclared test in snapshot");
            }
        }

        for flag in snapshot.flags {
            if self.config.flags.contains(&flag.name) {
                self.state.flags.insert(
                    flag.name,
                    Hydrated {
                        value: flag.value,
                        rule_set: flag.rule_set.unwrap_or_default(),
                    },
                );
            } else {
                log::debug!(target: "abby", flag_name = flag.name.as_str(); "ignoring undeclared flag in snapshot");
            }
        }

        for entry in snapshot.remote_config {
            if self.config.remote_config.contains_key(&entry.name) {
                self.state.remote_config.insert(
                    entry.name,
                    Hydrated {
                        value: entry.value,
                        rule_set: entry.rule_set.unwrap_or_default(),
                    },
                );
            } else {
                log::debug!(target: "abby", remote_config_name = entry.name.as_str(); "ignoring undeclared remote config in snapshot");
            }
        }
    }

    fn seed_cookie_overrides(&mut self) {
        let Some(cookies) = self
            .cookie_source
            .as_ref()
            .and_then(|source| source.cookie_string())
        else {
            return;
        };
        let overrides = CookieOverrides::parse(&self.config.project_id, &cookies);

        for (name, variant) in overrides.tests {
            match self.config.tests.get(&name) {
                Some(test) if test.variants.contains(&variant) => {
                    self.state.test_overrides.insert(name, variant);
                }
                _ => {
                    log::debug!(target: "abby", test_name = name.as_str(), variant = variant.as_str(); "ignoring unknown test variant in cookies");
                }
            }
        }

        for (name, raw) in overrides.flags {
            match parse_bool(&raw) {
                Some(value) if self.config.flags.contains(&name) => {
                    self.state.flag_overrides.insert(name, value);
                }
                _ => {
                    log::debug!(target: "abby", flag_name = name.as_str(); "ignoring flag cookie");
                }
            }
        }

        for (name, raw) in overrides.remote_config {
            let Some(ty) = self.config.remote_config.get(&name).copied() else {
                log::debug!(target: "abby", remote_config_name = name.as_str(); "ignoring undeclared remote config cookie");
                continue;
            };
            match ty.parse_persisted(&raw) {
                Some(value) => {
                    self.state.remote_config_overrides.insert(name, value);
                }
                None => {
                    log::warn!(target: "abby", remote_config_name = name.as_str(); "ignoring malformed remote config cookie");
                }
            }
        }

        if let Some(consent) = overrides.consent {
            self.cookies_enabled = consent;
        }
    }

    fn resolve_flag(&self, name: &str) -> bool {
        if let Some(value) = self.flag_override(name) {
            return value;
        }

        let settings = &self.config.flag_settings;
        if self.config.is_development() {
            if let Some(value) = settings.dev_overrides.get(name) {
                return *value;
            }
        }

        if let Some(flag) = self.state.flags.get(name) {
            return *flag.resolve(&self.state.user_properties);
        }

        settings
            .environment_fallbacks
            .get(&self.config.current_environment)
            .and_then(|fallbacks| fallbacks.get(name))
            .or_else(|| settings.fallback_values.get(name))
            .copied()
            .or(settings.default_value)
            .unwrap_or(false)
    }

    fn flag_override(&self, name: &str) -> Option<bool> {
        if let Some(value) = self.state.flag_overrides.get(name) {
            return Some(*value);
        }

        let raw = self.storage.flags.get(&self.key(StorageKind::Flag, name))?;
        let value = parse_bool(&raw);
        if value.is_none() {
            log::warn!(target: "abby", flag_name = name; "ignoring malformed persisted flag value");
        }
        value
    }

    fn resolve_remote_config(&self, name: &str, ty: RemoteConfigType) -> RemoteConfigValue {
        if let Some(value) = self.remote_config_override(name, ty) {
            return value;
        }

        let has_type = |source: &'static str, value: &RemoteConfigValue| {
            let matches = ty.accepts(value);
            if !matches {
                log::warn!(target: "abby", remote_config_name = name, source; "skipping remote config value of unexpected type");
            }
            matches
        };

        let settings = &self.config.remote_config_settings;
        if self.config.is_development() {
            if let Some(value) = settings.dev_overrides.get(name) {
                if has_type("dev override", value) {
                    return value.clone();
                }
            }
        }

        if let Some(entry) = self.state.remote_config.get(name) {
            let value = entry.resolve(&self.state.user_properties);
            if has_type("snapshot", value) {
                return value.clone();
            }
        }

        let fallback = settings
            .environment_fallbacks
            .get(&self.config.current_environment)
            .and_then(|fallbacks| fallbacks.get(name))
            .or_else(|| settings.fallback_values.get(name));
        if let Some(value) = fallback {
            if has_type("fallback", value) {
                return value.clone();
            }
        }

        settings.default_values.get(ty)
    }

    fn remote_config_override(&self, name: &str, ty: RemoteConfigType) -> Option<RemoteConfigValue> {
        if let Some(value) = self.state.remote_config_overrides.get(name) {
            return Some(value.clone());
        }

        let raw = self
            .storage
            .remote_config
            .get(&self.key(StorageKind::RemoteConfig, name))?;
        let value = ty.parse_persisted(&raw);
        if value.is_none() {
            log::warn!(target: "abby", remote_config_name = name; "ignoring malformed persisted remote config value");
        }
        value
    }

    /// Test-namespace writes are dropped while consent is withheld.
    fn persist_test_variant(&self, key: &str, variant: &str) {
        if self.cookies_enabled {
            self.storage.tests.set(key, variant, self.storage_options());
        }
    }

    fn persist_consent(&self, enabled: bool) {
        self.storage.tests.set(
            &consent_key(&self.config.project_id),
            &enabled.to_string(),
            self.storage_options(),
        );
    }

    fn key(&self, kind: StorageKind, name: &str) -> String {
        kind.key(&self.config.project_id, name)
    }

    fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            expires_in_days_override: self.config.cookies.expires_in_days,
        }
    }

    fn notify(&self) {
        if self.listeners.is_empty() {
            return;
        }
        let data = self.get_project_data();
        self.listeners.notify(&data);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use super::*;
    use crate::{
        config::{CookieSettings, FlagSettings, RemoteConfigDefaults, RemoteConfigSettings},
        properties::{PropertyValidator, PropertyValue},
        rules::{Condition, Rule, RuleSetEntry, StringOperator},
        snapshot::{FlagWire, RemoteConfigWire, TestWire},
        storage::{MemoryStorage, StoragePort},
    };

    /// Memory storage that records every write.
    #[derive(Default)]
    struct RecordingStorage {
        inner: MemoryStorage,
        writes: Mutex<Vec<(String, String, StorageOptions)>>,
    }

    impl RecordingStorage {
        fn written_keys(&self) -> Vec<String> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(key, _, _)| key.clone())
                .collect()
        }
    }

    impl StoragePort for RecordingStorage {
        fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str, options: StorageOptions) {
            self.writes
                .lock()
                .unwrap()
                .push((key.to_owned(), value.to_owned(), options));
            self.inner.set(key, value, options);
        }

        fn remove(&self, key: &str) {
            self.inner.remove(key);
        }
    }

    struct StaticFetcher {
        result: Result<ServerSnapshot>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn new(result: Result<ServerSnapshot>) -> StaticFetcher {
            StaticFetcher {
                result,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl SnapshotFetcher for StaticFetcher {
        fn fetch_snapshot(
            &self,
            _project_id: &str,
            _environment: &str,
        ) -> impl Future<Output = Result<ServerSnapshot>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(self.result.clone())
        }
    }

    fn config() -> ProjectConfig {
        ProjectConfig::new("p1")
            .environments(["development", "production"])
            .weighted_test("footer", ["A", "B", "C"], [0.2, 0.5, 0.3])
            .test("pricing", ["cheap", "expensive"])
            .flag("darkMode")
            .flag("beta")
            .remote_config("title", RemoteConfigType::String)
            .remote_config("limit", RemoteConfigType::Number)
            .remote_config("layout", RemoteConfigType::Json)
            .user_property("email", PropertyValidator::string())
            .user_property("test", PropertyValidator::string())
            .user_property("age", PropertyValidator::number().optional())
    }

    fn email_rule<T>(suffix: &str, then_value: T) -> RuleSetEntry<T> {
        RuleSetEntry::Rule(Rule {
            condition: Condition::String {
                property_name: "email".to_owned(),
                operator: StringOperator::EndsWith,
                value: suffix.to_owned(),
            },
            then_value,
        })
    }

    fn snapshot() -> ServerSnapshot {
        ServerSnapshot {
            tests: vec![
                TestWire {
                    name: "footer".to_owned(),
                    weights: vec![0.0, 1.0, 0.0],
                },
                TestWire {
                    name: "undeclared".to_owned(),
                    weights: vec![1.0],
                },
            ],
            flags: vec![
                FlagWire {
                    name: "darkMode".to_owned(),
                    value: true,
                    rule_set: None,
                },
                FlagWire {
                    name: "beta".to_owned(),
                    value: false,
                    rule_set: Some(vec![email_rule("@abby.dev", true)]),
                },
                FlagWire {
                    name: "undeclared".to_owned(),
                    value: true,
                    rule_set: None,
                },
            ],
            remote_config: vec![RemoteConfigWire {
                name: "title".to_owned(),
                value: "Hello".into(),
                rule_set: Some(vec![email_rule(
                    "@abby.dev",
                    RemoteConfigValue::from("Hello, team"),
                )]),
            }],
        }
    }

    fn props(entries: &[(&str, PropertyValue)]) -> UserProperties {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn flags_default_to_false() {
        let abby = config().to_engine(StoragePorts::in_memory());

        assert!(!abby.get_feature_flag("darkMode"));
        assert!(!abby.get_feature_flag("notDeclared"));
    }

    #[test]
    fn flag_fallback_chain() {
        let settings = FlagSettings {
            default_value: Some(true),
            fallback_values: [("beta".to_owned(), false)].into_iter().collect(),
            environment_fallbacks: [(
                "staging".to_owned(),
                [("beta".to_owned(), true)].into_iter().collect(),
            )]
            .into_iter()
            .collect(),
            dev_overrides: HashMap::new(),
        };

        let production = config()
            .flag_settings(settings.clone())
            .to_engine(StoragePorts::in_memory());
        assert!(production.get_feature_flag("darkMode"));
        assert!(!production.get_feature_flag("beta"));

        let staging = config()
            .current_environment("staging")
            .flag_settings(settings)
            .to_engine(StoragePorts::in_memory());
        assert!(staging.get_feature_flag("beta"));
    }

    #[test]
    fn hydrated_flag_beats_fallbacks() {
        let mut abby = config()
            .flag_settings(FlagSettings {
                default_value: Some(true),
                ..FlagSettings::default()
            })
            .to_engine(StoragePorts::in_memory());

        abby.init(snapshot());

        assert!(!abby.get_feature_flag("beta"));
    }

    #[test]
    fn dev_overrides_apply_only_in_development() {
        let settings = FlagSettings {
            dev_overrides: [("darkMode".to_owned(), false)].into_iter().collect(),
            ..FlagSettings::default()
        };

        let mut production = config()
            .flag_settings(settings.clone())
            .to_engine(StoragePorts::in_memory());
        production.init(snapshot());
        assert!(production.get_feature_flag("darkMode"));

        let mut development = config()
            .current_environment("development")
            .flag_settings(settings)
            .to_engine(StoragePorts::in_memory());
        development.init(snapshot());
        assert!(!development.get_feature_flag("darkMode"));
    }

    #[test]
    fn flag_override_wins_everywhere_and_persists() {
        let storage = StoragePorts::in_memory();
        let mut abby = config()
            .current_environment("development")
            .flag_settings(FlagSettings {
                dev_overrides: [("darkMode".to_owned(), true)].into_iter().collect(),
                ..FlagSettings::default()
            })
            .to_engine(storage.clone());
        abby.init(snapshot());

        abby.update_flag("darkMode", false);
        assert!(!abby.get_feature_flag("darkMode"));

        // Overrides survive a new engine sharing the same storage.
        let other = config().to_engine(storage.clone());
        assert!(!other.get_feature_flag("darkMode"));

        abby.remove_flag_override("darkMode");
        assert!(abby.get_feature_flag("darkMode"));
        assert_eq!(storage.flags.get("__abby__ff__p1_darkMode"), None);
    }

    #[test]
    fn rules_are_reevaluated_after_user_properties_change() {
        let mut abby = config().to_engine(StoragePorts::in_memory());
        abby.init(snapshot());

        assert!(!abby.get_feature_flag("beta"));
        assert_eq!(abby.get_remote_config("title"), Some("Hello".into()));

        abby.update_user_properties(props(&[("email", "jane@abby.dev".into())]))
            .unwrap();

        assert!(abby.get_feature_flag("beta"));
        assert_eq!(abby.get_remote_config("title"), Some("Hello, team".into()));
    }

    #[test]
    fn invalid_user_properties_are_rejected_as_a_whole() {
        let mut abby = config().to_engine(StoragePorts::in_memory());

        let err = abby
            .update_user_properties(props(&[
                ("test", 123.0.into()),
                ("email", "jane@abby.dev".into()),
            ]))
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("`test`"), "{message}");
        assert!(message.contains("expected string but received number"), "{message}");
        assert!(matches!(err, Error::InvalidUserProperties(ref v) if v.len() == 1));
        assert!(abby.get_user_properties().is_empty());
    }

    #[test]
    fn optional_properties_accept_null() {
        let mut abby = config().to_engine(StoragePorts::in_memory());

        abby.update_user_properties(props(&[("age", PropertyValue::Null)]))
            .unwrap();

        assert_eq!(abby.get_user_properties()["age"], PropertyValue::Null);
    }

    #[test]
    fn remote_config_defaults() {
        let abby = config().to_engine(StoragePorts::in_memory());

        assert_eq!(abby.get_remote_config("title"), Some("".into()));
        assert_eq!(abby.get_remote_config("limit"), Some(0.0.into()));
        assert_eq!(
            abby.get_remote_config("layout"),
            Some(RemoteConfigValue::Json(serde_json::json!({})))
        );
        assert_eq!(abby.get_remote_config("notDeclared"), None);
    }

    #[test]
    fn remote_config_fallback_chain() {
        let mut abby = config()
            .remote_config_settings(RemoteConfigSettings {
                default_values: RemoteConfigDefaults {
                    number: Some(5.0),
                    ..RemoteConfigDefaults::default()
                },
                fallback_values: [
                    ("title".to_owned(), "Fallback".into()),
                    // Wrong type, skipped.
                    ("layout".to_owned(), 3.0.into()),
                ]
                .into_iter()
                .collect(),
                ..RemoteConfigSettings::default()
            })
            .to_engine(StoragePorts::in_memory());

        assert_eq!(abby.get_remote_config("title"), Some("Fallback".into()));
        assert_eq!(abby.get_remote_config("limit"), Some(5.0.into()));
        assert_eq!(
            abby.get_remote_config("layout"),
            Some(RemoteConfigValue::Json(serde_json::json!({})))
        );

        abby.init(snapshot());
        assert_eq!(abby.get_remote_config("title"), Some("Hello".into()));
    }

    #[test]
    fn hydrated_remote_config_of_wrong_type_falls_through() {
        let mut abby = config().to_engine(StoragePorts::in_memory());

        abby.init(ServerSnapshot {
            remote_config: vec![RemoteConfigWire {
                name: "limit".to_owned(),
                value: "many".into(),
                rule_set: None,
            }],
            ..ServerSnapshot::default()
        });

        assert_eq!(abby.get_remote_config("limit"), Some(0.0.into()));
    }

    #[test]
    fn remote_config_overrides() {
        let storage = StoragePorts::in_memory();
        let mut abby = config()
            .current_environment("development")
            .remote_config_settings(RemoteConfigSettings {
                dev_overrides: [("limit".to_owned(), 50.0.into())].into_iter().collect(),
                ..RemoteConfigSettings::default()
            })
            .to_engine(storage.clone());
        assert_eq!(abby.get_remote_config("limit"), Some(50.0.into()));

        abby.update_remote_config("limit", 12.0);
        assert_eq!(abby.get_remote_config("limit"), Some(12.0.into()));
        assert_eq!(
            storage.remote_config.get("__abby__rc__p1_limit"),
            Some("12".to_owned())
        );

        abby.update_remote_config("limit", "twelve");
        assert_eq!(abby.get_remote_config("limit"), Some(12.0.into()));

        abby.remove_remote_config_override("limit");
        assert_eq!(abby.get_remote_config("limit"), Some(50.0.into()));
    }

    #[test]
    fn json_entries_only_resolve_to_objects() {
        let storage = StoragePorts::in_memory();
        let mut abby = config()
            .current_environment("development")
            .remote_config_settings(RemoteConfigSettings {
                dev_overrides: [(
                    "layout".to_owned(),
                    RemoteConfigValue::Json(serde_json::json!("wide")),
                )]
                .into_iter()
                .collect(),
                fallback_values: [(
                    "layout".to_owned(),
                    RemoteConfigValue::Json(serde_json::Value::Null),
                )]
                .into_iter()
                .collect(),
                ..RemoteConfigSettings::default()
            })
            .to_engine(storage.clone());

        abby.init(ServerSnapshot {
            remote_config: vec![RemoteConfigWire {
                name: "layout".to_owned(),
                value: RemoteConfigValue::Json(serde_json::json!(true)),
                rule_set: Some(vec![email_rule(
                    "@abby.dev",
                    RemoteConfigValue::Json(serde_json::json!([1, 2])),
                )]),
            }],
            ..ServerSnapshot::default()
        });
        abby.update_user_properties(props(&[("email", "jane@abby.dev".into())]))
            .unwrap();
        let empty = Some(RemoteConfigValue::Json(serde_json::json!({})));
        assert_eq!(abby.get_remote_config("layout"), empty);

        abby.update_remote_config("layout", serde_json::json!(5));
        assert_eq!(abby.get_remote_config("layout"), empty);
        assert_eq!(storage.remote_config.get("__abby__rc__p1_layout"), None);

        abby.update_remote_config("layout", serde_json::json!({"columns": 3}));
        let columns = Some(RemoteConfigValue::Json(serde_json::json!({"columns": 3})));
        assert_eq!(abby.get_remote_config("layout"), columns);
        assert_eq!(config().to_engine(storage).get_remote_config("layout"), columns);
    }

    #[test]
    fn malformed_persisted_remote_config_falls_back_to_default() {
        let storage = StoragePorts::in_memory();
        storage.remote_config.set(
            "__abby__rc__p1_limit",
            "not-a-number",
            StorageOptions::default(),
        );
        storage
            .remote_config
            .set("__abby__rc__p1_layout", "{broken", StorageOptions::default());

        let abby = config().to_engine(storage);

        assert_eq!(abby.get_remote_config("limit"), Some(0.0.into()));
        assert_eq!(
            abby.get_remote_config("layout"),
            Some(RemoteConfigValue::Json(serde_json::json!({})))
        );
    }

    #[test]
    fn persisted_test_variant_is_stable() {
        let storage = StoragePorts::in_memory();
        let abby = config().to_engine(storage.clone());

        let first = abby.get_test_variant("footer").unwrap();
        let second = abby.get_test_variant("footer").unwrap();

        assert_eq!(first, second);
        assert_eq!(storage.tests.get("__abby__ab__p1_footer"), Some(first.clone()));

        let other = config().to_engine(storage);
        assert_eq!(other.get_test_variant("footer"), Some(first));
    }

    #[test]
    fn hydrated_weights_drive_selection() {
        let mut abby = config().to_engine(StoragePorts::noop());
        abby.init(snapshot());

        for _ in 0..100 {
            assert_eq!(abby.get_test_variant("footer"), Some("B".to_owned()));
        }
    }

    #[test]
    fn undeclared_tests_resolve_to_nothing() {
        let abby = config().to_engine(StoragePorts::in_memory());

        assert_eq!(abby.get_test_variant("notDeclared"), None);
    }

    #[test]
    fn unknown_persisted_variant_is_ignored() {
        let storage = StoragePorts::in_memory();
        storage
            .tests
            .set("__abby__ab__p1_pricing", "free", StorageOptions::default());

        let abby = config().to_engine(storage.clone());
        let variant = abby.get_test_variant("pricing").unwrap();

        assert!(variant == "cheap" || variant == "expensive");
        assert_eq!(storage.tests.get("__abby__ab__p1_pricing"), Some(variant));
    }

    #[test]
    fn without_consent_tests_are_deterministic_and_never_persisted() {
        let recording = Arc::new(RecordingStorage::default());
        let storage = StoragePorts {
            tests: recording.clone(),
            ..StoragePorts::in_memory()
        };
        let abby = config()
            .cookies(CookieSettings {
                disable_by_default: true,
                expires_in_days: None,
            })
            .to_engine(storage);

        assert!(!abby.cookies_enabled());
        for _ in 0..100 {
            assert_eq!(abby.get_test_variant("footer"), Some("B".to_owned()));
            assert_eq!(abby.get_test_variant("pricing"), Some("cheap".to_owned()));
        }
        assert!(recording.written_keys().is_empty());
    }

    #[test]
    fn enabling_cookies_materializes_every_test() {
        let recording = Arc::new(RecordingStorage::default());
        let storage = StoragePorts {
            tests: recording.clone(),
            ..StoragePorts::in_memory()
        };
        let mut abby = config()
            .cookies(CookieSettings {
                disable_by_default: true,
                expires_in_days: Some(30),
            })
            .to_engine(storage.clone());

        abby.enable_cookies();

        let mut keys = recording.written_keys();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "__abby__ab__p1_footer",
                "__abby__ab__p1_pricing",
                "__abby__cookie_consent__p1",
            ]
        );
        assert!(recording
            .writes
            .lock()
            .unwrap()
            .iter()
            .all(|(_, _, options)| options.expires_in_days_override == Some(30)));

        // The persisted marker wins over `disable_by_default`.
        let other = config()
            .cookies(CookieSettings {
                disable_by_default: true,
                expires_in_days: None,
            })
            .to_engine(storage);
        assert!(other.cookies_enabled());
    }

    #[test]
    fn enabling_cookies_persists_overridden_variants() {
        let storage = StoragePorts::in_memory();
        let mut abby = config()
            .cookies(CookieSettings {
                disable_by_default: true,
                expires_in_days: None,
            })
            .to_engine(storage.clone());

        abby.update_local_variant("footer", "C");
        assert_eq!(storage.tests.get("__abby__ab__p1_footer"), None);

        abby.enable_cookies();

        assert_eq!(abby.get_test_variant("footer"), Some("C".to_owned()));
        assert_eq!(
            storage.tests.get("__abby__ab__p1_footer"),
            Some("C".to_owned())
        );
        assert!(storage.tests.get("__abby__ab__p1_pricing").is_some());
    }

    #[test]
    fn disabling_cookies_removes_assignments() {
        let storage = StoragePorts::in_memory();
        let mut abby = config().to_engine(storage.clone());
        abby.get_test_variant("footer").unwrap();

        abby.disable_cookies();

        assert!(!abby.cookies_enabled());
        assert_eq!(storage.tests.get("__abby__ab__p1_footer"), None);
        assert_eq!(
            storage.tests.get("__abby__cookie_consent__p1"),
            Some("false".to_owned())
        );
        assert_eq!(abby.get_test_variant("footer"), Some("B".to_owned()));
        assert!(!config().to_engine(storage).cookies_enabled());
    }

    #[test]
    fn local_variant_overrides() {
        let storage = StoragePorts::in_memory();
        let mut abby = config().to_engine(storage.clone());

        abby.update_local_variant("footer", "C");
        assert_eq!(abby.get_test_variant("footer"), Some("C".to_owned()));
        assert_eq!(
            storage.tests.get("__abby__ab__p1_footer"),
            Some("C".to_owned())
        );

        abby.update_local_variant("footer", "Z");
        assert_eq!(abby.get_test_variant("footer"), Some("C".to_owned()));

        abby.remove_local_variant("footer");
        assert_eq!(abby.get_test_variant("footer"), Some("C".to_owned()));

        abby.reset_test_assignment("footer");
        assert_eq!(storage.tests.get("__abby__ab__p1_footer"), None);
    }

    #[test]
    fn init_ignores_undeclared_entries() {
        let mut abby = config().to_engine(StoragePorts::in_memory());

        abby.init(snapshot());
        let data = abby.get_project_data();

        assert_eq!(data.tests.len(), 2);
        assert_eq!(data.tests["footer"], "B");
        assert_eq!(
            data.flags.keys().collect::<Vec<_>>(),
            vec!["beta", "darkMode"]
        );
        assert!(data.flags["darkMode"]);
        assert_eq!(data.remote_config.len(), 3);
    }

    #[test]
    fn cookie_source_seeds_overrides() {
        let cookies = [
            "__abby__ab__p1_footer=C",
            "__abby__ab__p1_pricing=free",
            "__abby__ff__p1_darkMode=false",
            "__abby__rc__p1_title=From%20cookie",
            "__abby__rc__p1_limit=abc",
            "__abby__cookie_consent__p1=false",
        ]
        .join("; ");
        let mut abby = config()
            .to_engine(StoragePorts::in_memory())
            .with_cookie_source(move || Some(cookies.clone()));

        abby.init(snapshot());

        assert_eq!(abby.get_test_variant("footer"), Some("C".to_owned()));
        assert_eq!(abby.get_test_variant("pricing"), Some("cheap".to_owned()));
        assert!(!abby.get_feature_flag("darkMode"));
        assert_eq!(abby.get_remote_config("title"), Some("From cookie".into()));
        assert_eq!(abby.get_remote_config("limit"), Some(0.0.into()));
        assert!(!abby.cookies_enabled());
    }

    #[test]
    fn listeners_receive_resolved_data() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let mut abby = config().to_engine(StoragePorts::in_memory());

        let subscription = {
            let received = received.clone();
            abby.subscribe(move |data: &ProjectData| received.lock().unwrap().push(data.clone()))
        };

        abby.init(snapshot());
        abby.update_flag("beta", true);
        abby.update_user_properties(props(&[("email", "jane@example.com".into())]))
            .unwrap();

        {
            let received = received.lock().unwrap();
            assert_eq!(received.len(), 3);
            assert!(!received[0].flags["beta"]);
            assert!(received[1].flags["beta"]);
            assert_eq!(received[2].tests["footer"], "B");
        }

        assert!(abby.unsubscribe(subscription));
        assert!(!abby.unsubscribe(subscription));

        abby.update_flag("beta", false);
        assert_eq!(received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn hydrates_once() {
        let fetcher = StaticFetcher::new(Ok(snapshot()));
        let mut abby = config().to_engine(StoragePorts::in_memory());

        let data = abby.get_project_data_async_with(&fetcher).await;
        assert!(data.flags["darkMode"]);

        abby.get_project_data_async_with(&fetcher).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_hydration_keeps_defaults() {
        let fetcher = StaticFetcher::new(Err(Error::UnexpectedStatus(500)));
        let mut abby = config()
            .flag_settings(FlagSettings {
                fallback_values: [("darkMode".to_owned(), true)].into_iter().collect(),
                ..FlagSettings::default()
            })
            .to_engine(StoragePorts::in_memory());

        let data = abby.get_project_data_async_with(&fetcher).await;
        assert!(data.flags["darkMode"]);
        assert_eq!(data.remote_config["limit"], 0.0.into());

        abby.get_project_data_async_with(&fetcher).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_keeps_defaults() {
        let mut abby = config()
            .base_url("http://127.0.0.1:9")
            .to_engine(StoragePorts::in_memory());

        let data = abby.get_project_data_async().await;

        assert!(!data.flags["darkMode"]);
        assert_eq!(data.remote_config["title"], "".into());
    }

    #[tokio::test]
    async fn init_prevents_fetching() {
        let fetcher = StaticFetcher::new(Ok(ServerSnapshot::default()));
        let mut abby = config().to_engine(StoragePorts::in_memory());
        abby.init(snapshot());

        let data = abby.get_project_data_async_with(&fetcher).await;

        assert!(data.flags["darkMode"]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
