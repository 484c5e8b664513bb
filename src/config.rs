use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    properties::PropertyValidator,
    snapshot::{RemoteConfigType, RemoteConfigValue},
    Abby, StoragePorts,
};

/// Declared configuration of a project: its tests, flags, remote-config entries, user properties
/// and the settings used when the server snapshot does not provide a value.
///
/// # Examples
/// ```
/// # use abby::{ProjectConfig, PropertyValidator, RemoteConfigType, StoragePorts};
/// let abby = ProjectConfig::new("project-id")
///     .environments(["development", "production"])
///     .current_environment("production")
///     .weighted_test("footer", ["A", "B"], [0.2, 0.8])
///     .flag("darkMode")
///     .remote_config("maxItems", RemoteConfigType::Number)
///     .user_property("email", PropertyValidator::string())
///     .to_engine(StoragePorts::in_memory());
/// ```
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub(crate) project_id: String,
    pub(crate) current_environment: String,
    pub(crate) environments: Vec<String>,
    pub(crate) tests: BTreeMap<String, TestConfig>,
    pub(crate) flags: BTreeSet<String>,
    pub(crate) remote_config: BTreeMap<String, RemoteConfigType>,
    pub(crate) user_properties: HashMap<String, PropertyValidator>,
    pub(crate) flag_settings: FlagSettings,
    pub(crate) remote_config_settings: RemoteConfigSettings,
    pub(crate) cookies: CookieSettings,
    pub(crate) base_url: String,
}

/// Declared variants of a test and their optional default weights.
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig {
    pub(crate) variants: Vec<String>,
    pub(crate) weights: Option<Vec<f64>>,
}

impl TestConfig {
    /// Declared variants, in order.
    pub fn variants(&self) -> &[String] {
        &self.variants
    }
}

/// Values used for flags when no hydrated value is available.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagSettings {
    /// Global default for every flag.
    pub default_value: Option<bool>,
    /// Per-flag fallback values, used in every environment.
    pub fallback_values: HashMap<String, bool>,
    /// Per-environment, per-flag fallback values. Take precedence over `fallback_values`.
    pub environment_fallbacks: HashMap<String, HashMap<String, bool>>,
    /// Values forced while running in the development environment.
    pub dev_overrides: HashMap<String, bool>,
}

/// Values used for remote-config entries when no hydrated value is available.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteConfigSettings {
    /// Defaults per declared type.
    pub default_values: RemoteConfigDefaults,
    /// Per-entry fallback values, used in every environment.
    pub fallback_values: HashMap<String, RemoteConfigValue>,
    /// Per-environment, per-entry fallback values. Take precedence over `fallback_values`.
    pub environment_fallbacks: HashMap<String, HashMap<String, RemoteConfigValue>>,
    /// Values forced while running in the development environment.
    pub dev_overrides: HashMap<String, RemoteConfigValue>,
}

/// Per-type defaults for remote-config entries. Unset types use `""`, `0` and `{}`; a `json`
/// default that is not an object is ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteConfigDefaults {
    /// Default of `String` entries.
    pub string: Option<String>,
    /// Default of `Number` entries.
    pub number: Option<f64>,
    /// Default of `JSON` entries.
    pub json: Option<serde_json::Value>,
}

impl RemoteConfigDefaults {
    pub(crate) fn get(&self, ty: RemoteConfigType) -> RemoteConfigValue {
        let configured = match ty {
            RemoteConfigType::String => self.string.clone().map(RemoteConfigValue::String),
            RemoteConfigType::Number => self.number.map(RemoteConfigValue::Number),
            RemoteConfigType::Json => self
                .json
                .clone()
                .filter(serde_json::Value::is_object)
                .map(RemoteConfigValue::Json),
        };
        configured.unwrap_or_else(|| ty.builtin_default())
    }
}

/// Storage consent and expiry of persisted values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CookieSettings {
    /// Withhold consent until [`Abby::enable_cookies`] is called (unless a consent marker was
    /// already persisted).
    pub disable_by_default: bool,
    /// Expiry of persisted values, passed to every storage write.
    pub expires_in_days: Option<u32>,
}

impl ProjectConfig {
    /// Default base URL of the delivery endpoint.
    pub const DEFAULT_BASE_URL: &'static str = "https://www.tryabby.com";

    /// Name of the environment in which dev overrides apply.
    pub const DEVELOPMENT_ENVIRONMENT: &'static str = "development";

    /// Create an empty configuration for `project_id`, running in the `production` environment.
    pub fn new(project_id: impl Into<String>) -> Self {
        ProjectConfig {
            project_id: project_id.into(),
            current_environment: "production".to_owned(),
            environments: Vec::new(),
            tests: BTreeMap::new(),
            flags: BTreeSet::new(),
            remote_config: BTreeMap::new(),
            user_properties: HashMap::new(),
            flag_settings: FlagSettings::default(),
            remote_config_settings: RemoteConfigSettings::default(),
            cookies: CookieSettings::default(),
            base_url: ProjectConfig::DEFAULT_BASE_URL.to_owned(),
        }
    }

    /// Declare the environments of the project.
    pub fn environments<I, S>(mut self, environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = environments.into_iter().map(Into::into).collect();
        self
    }

    /// Set the environment this engine runs in.
    pub fn current_environment(mut self, environment: impl Into<String>) -> Self {
        self.current_environment = environment.into();
        self
    }

    /// Declare a test whose variants are equally likely until the server sends weights.
    pub fn test<I, S>(mut self, name: impl Into<String>, variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tests.insert(
            name.into(),
            TestConfig {
                variants: variants.into_iter().map(Into::into).collect(),
                weights: None,
            },
        );
        self
    }

    /// Declare a test with default weights. Weights that do not align with the variants are
    /// treated as absent.
    pub fn weighted_test<I, S, W>(mut self, name: impl Into<String>, variants: I, weights: W) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        W: IntoIterator<Item = f64>,
    {
        self.tests.insert(
            name.into(),
            TestConfig {
                variants: variants.into_iter().map(Into::into).collect(),
                weights: Some(weights.into_iter().collect()),
            },
        );
        self
    }

    /// Declare a feature flag.
    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.flags.insert(name.into());
        self
    }

    /// Declare a remote-config entry and its type.
    pub fn remote_config(mut self, name: impl Into<String>, ty: RemoteConfigType) -> Self {
        self.remote_config.insert(name.into(), ty);
        self
    }

    /// Declare a user property accepted by [`Abby::update_user_properties`].
    pub fn user_property(mut self, name: impl Into<String>, validator: PropertyValidator) -> Self {
        self.user_properties.insert(name.into(), validator);
        self
    }

    /// Replace the flag fallback settings.
    pub fn flag_settings(mut self, settings: FlagSettings) -> Self {
        self.flag_settings = settings;
        self
    }

    /// Replace the remote-config fallback settings.
    pub fn remote_config_settings(mut self, settings: RemoteConfigSettings) -> Self {
        self.remote_config_settings = settings;
        self
    }

    /// Replace the consent and cookie settings.
    pub fn cookies(mut self, cookies: CookieSettings) -> Self {
        self.cookies = cookies;
        self
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a new [`Abby`] engine using this configuration.
    ///
    /// ```
    /// # use abby::{Abby, ProjectConfig, StoragePorts};
    /// let abby: Abby = ProjectConfig::new("project-id").to_engine(StoragePorts::noop());
    /// ```
    pub fn to_engine(self, storage: StoragePorts) -> Abby {
        Abby::new(self, storage)
    }

    /// Identifier of the project.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Environment the engine runs in.
    pub fn current_env(&self) -> &str {
        &self.current_environment
    }

    /// Declared tests, keyed by name.
    pub fn tests(&self) -> &BTreeMap<String, TestConfig> {
        &self.tests
    }

    pub(crate) fn is_development(&self) -> bool {
        self.current_environment == ProjectConfig::DEVELOPMENT_ENVIRONMENT
    }
}
