//! The Rust engine of Abby, an open-source A/B testing and feature flagging platform.
//!
//! # Overview
//!
//! The crate revolves around the [`Abby`] engine, built from a [`ProjectConfig`] that declares
//! the project's A/B tests, feature flags, typed remote-config entries and user properties. Once
//! hydrated with a [`ServerSnapshot`] (either fetched with [`Abby::get_project_data_async`] or
//! passed to [`Abby::init`]), the engine resolves:
//! - the variant of every test, drawn by weight and persisted through a [`StoragePort`] so that
//!   it is sticky;
//! - the value of every flag and remote-config entry, after applying local overrides,
//!   development overrides, [targeting rules](RuleSet) and configured fallbacks.
//!
//! Listeners registered with [`Abby::subscribe`] receive the resolved [`ProjectData`] after every
//! change.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation never returns an error: when the network or storage is unavailable, configured
//! defaults are served. Errors are only returned where the caller has to react, e.g.
//! [`Abby::update_user_properties`] with properties that do not match their declared validators.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, with the `abby` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into engine operations.
//!
//! # Examples
//!
//! ```
//! # use abby::{ProjectConfig, PropertyValidator, RemoteConfigType, StoragePorts};
//! let mut abby = ProjectConfig::new("project-id")
//!     .weighted_test("footer", ["A", "B"], [0.5, 0.5])
//!     .flag("darkMode")
//!     .remote_config("maxItems", RemoteConfigType::Number)
//!     .user_property("email", PropertyValidator::string())
//!     .to_engine(StoragePorts::in_memory());
//!
//! let variant = abby.get_test_variant("footer");
//! assert_eq!(abby.get_test_variant("footer"), variant);
//! ```
//!
//! A runnable program can be found in the `demos/` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod cache;
mod client;
mod codec;
mod config;
mod cookies;
mod error;
mod fetcher;
mod listener;
mod properties;
mod rules;
mod selector;
mod snapshot;
mod storage;

pub use cache::ConfigCache;
pub use client::{Abby, ProjectData};
pub use codec::{
    decode_window_data, encode_window_data, hash_string_to_int32, parse_abby_data,
    serialize_abby_data,
};
pub use config::{
    CookieSettings, FlagSettings, ProjectConfig, RemoteConfigDefaults, RemoteConfigSettings,
    TestConfig,
};
pub use cookies::{parse_cookie_string, CookieSource};
pub use error::{Error, Result};
pub use fetcher::{CachingFetcher, HttpFetcher, SnapshotFetcher};
pub use listener::{Listener, Subscription};
pub use properties::{
    PropertyType, PropertyValidator, PropertyValue, PropertyViolation, UserProperties,
};
pub use rules::{
    BooleanOperator, Condition, GroupOperator, NumberOperator, Rule, RuleGroup, RuleSet,
    RuleSetEntry, StringOperator,
};
pub use selector::{normalize_weights, select, select_deterministic, select_with_rng};
pub use snapshot::{
    FlagWire, RemoteConfigType, RemoteConfigValue, RemoteConfigWire, ServerSnapshot, TestWire,
};
pub use storage::{
    consent_key, MemoryStorage, NoopStorage, StorageKind, StorageOptions, StoragePort,
    StoragePorts, CONSENT_KEY_PREFIX, FLAG_KEY_PREFIX, REMOTE_CONFIG_KEY_PREFIX,
    TEST_KEY_PREFIX,
};
