//! The configuration value tree and its deep-merge semantics.
//!
//! The core never parses TOML/YAML/JSON text and never interprets
//! interpolation tokens — both are the caller's job. What the core *does*
//! own is combining already-parsed configuration trees: the `default` +
//! named-overlay [`Environment`] merge, and the
//! tap-over-target "accent" merge used by pipelines.

pub(crate) mod plugin;
pub mod projection;

pub use plugin::{Capability, PluginKind, PluginSpec, resolve_inherit_chain, validate_unique_names};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// An immutable configuration tree: map, sequence, or scalar.
///
/// Any literal `${...}`-shaped string is kept completely opaque here — this
/// type never tries to interpret interpolation syntax, it only merges and
/// canonicalizes whatever scalars it's given.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Seq(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Number(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl ConfigValue {
    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn empty_map() -> Self {
        ConfigValue::Map(BTreeMap::new())
    }

    /// Deep-merge `overlay` on top of `base`.
    ///
    /// - Two maps merge key-wise, recursing into shared keys.
    /// - Two sequences concatenate (`base` elements first).
    /// - Anything else: `overlay` wins outright, including when the shapes
    ///   of `base` and `overlay` at the same key disagree (e.g. a scalar
    ///   overlaid with a map) — the overlay's shape always wins, matching
    ///   "last layer wins" for scalars.
    pub fn merge(base: &ConfigValue, overlay: &ConfigValue) -> ConfigValue {
        match (base, overlay) {
            (ConfigValue::Map(base), ConfigValue::Map(overlay)) => {
                let mut merged = base.clone();
                for (key, value) in overlay {
                    let next = match merged.get(key) {
                        Some(existing) => ConfigValue::merge(existing, value),
                        None => value.clone(),
                    };
                    merged.insert(key.clone(), next);
                }
                ConfigValue::Map(merged)
            }
            (ConfigValue::Seq(base), ConfigValue::Seq(overlay)) => {
                let mut merged = base.clone();
                merged.extend(overlay.iter().cloned());
                ConfigValue::Seq(merged)
            }
            (_, overlay) => overlay.clone(),
        }
    }

    /// Merge many layers in order (each layer overlays everything before it).
    pub fn merge_all<'a, I>(layers: I) -> ConfigValue
    where
        I: IntoIterator<Item = &'a ConfigValue>,
    {
        layers
            .into_iter()
            .fold(ConfigValue::empty_map(), |acc, layer| {
                ConfigValue::merge(&acc, layer)
            })
    }

    /// Convert to a `serde_json::Value`, e.g. to materialize a plugin's
    /// configuration file to disk.
    pub fn to_json(&self) -> Json {
        match self {
            ConfigValue::Null => Json::Null,
            ConfigValue::Bool(b) => Json::Bool(*b),
            ConfigValue::Number(n) => {
                serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null)
            }
            ConfigValue::String(s) => Json::String(s.clone()),
            ConfigValue::Seq(items) => Json::Array(items.iter().map(ConfigValue::to_json).collect()),
            ConfigValue::Map(map) => {
                Json::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }

    /// Convert from a `serde_json::Value`, e.g. reading a plugin's raw
    /// configuration map off the wire from the (out-of-scope) config loader.
    pub fn from_json(value: &Json) -> ConfigValue {
        match value {
            Json::Null => ConfigValue::Null,
            Json::Bool(b) => ConfigValue::Bool(*b),
            Json::Number(n) => ConfigValue::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => ConfigValue::String(s.clone()),
            Json::Array(items) => ConfigValue::Seq(items.iter().map(ConfigValue::from_json).collect()),
            Json::Object(map) => ConfigValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), ConfigValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// A named configuration overlay set: `default` plus zero or more additional
/// named overlays, each a full [`ConfigValue`] tree.
///
/// The *effective configuration* (per the data model) is `default` merged
/// with the overlay selected by the active environment variable, if any.
#[derive(Clone, Debug, Default)]
pub struct Environments {
    layers: BTreeMap<String, ConfigValue>,
}

impl Environments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tree: ConfigValue) -> &mut Self {
        self.layers.insert(name.into(), tree);
        self
    }

    /// Compute the effective configuration for the given active overlay name
    /// (`None` means "default only").
    pub fn effective(&self, active: Option<&str>) -> ConfigValue {
        let default = self
            .layers
            .get("default")
            .cloned()
            .unwrap_or_else(ConfigValue::empty_map);

        match active {
            Some(name) if name != "default" => match self.layers.get(name) {
                Some(overlay) => ConfigValue::merge(&default, overlay),
                None => default,
            },
            _ => default,
        }
    }
}
