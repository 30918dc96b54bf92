//! [`PluginSpec`]: the declarative description of a tap, target, or utility.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::{Result, eyre::bail};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::ConfigValue;

/// What kind of Singer role a plugin fills.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Tap,
    Target,
    Utility,
}

/// A capability a plugin declares support for.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    State,
    Catalog,
    Properties,
    About,
    Test,
}

/// A glob → map overlay merged into matching catalog stream entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataOverlay {
    pub pattern: String,
    pub metadata: ConfigValue,
}

/// A stream-map declaration: an external filter script plus the selection
/// patterns it applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamMap {
    pub script: String,
    pub select: Vec<String>,
}

/// A plugin declaration, as produced by the (out-of-scope) config loader
/// after interpolation and environment-overlay merging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    pub kind: PluginKind,
    pub install_url: String,
    pub executable: Option<String>,
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default = "ConfigValue::empty_map")]
    pub config: ConfigValue,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub metadata: Vec<MetadataOverlay>,
    #[serde(default)]
    pub stream_maps: Vec<StreamMap>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub load_path: Option<String>,
    /// Per-target "accent" overlays keyed by target name (see Config
    /// Projection, §4.4): `accents["target-jsonl"]` is merged into
    /// `target-jsonl`'s configuration when this plugin is the tap half of
    /// that pipeline.
    #[serde(default)]
    pub accents: BTreeMap<String, ConfigValue>,
    pub inherit_from: Option<String>,
}

impl PluginSpec {
    /// The executable name or entrypoint that identifies the build target,
    /// per the fingerprint inputs: entrypoint takes precedence when present.
    pub fn executable_or_entrypoint(&self) -> &str {
        self.entrypoint
            .as_deref()
            .or(self.executable.as_deref())
            .unwrap_or(self.name.as_str())
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Resolve the `inherit_from` chain for `spec` against the given registry,
/// producing the fully-merged spec with no more `inherit_from` left to
/// resolve. Per the config-projection invariant, `inherit_from` is resolved
/// before any other overlay (selection patterns, metadata, accents, and
/// plain config all concatenate/merge from ancestor to descendant, with the
/// descendant's own fields winning last).
pub fn resolve_inherit_chain<'a>(
    spec: &'a PluginSpec,
    registry: &'a BTreeMap<String, PluginSpec>,
) -> Result<PluginSpec> {
    let mut chain = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current = spec;

    loop {
        if !seen.insert(current.name.clone()) {
            bail!(
                "inherit_from cycle detected while resolving `{}`: chain so far is {:?}",
                spec.name,
                chain.iter().map(|s: &&PluginSpec| s.name.as_str()).collect::<Vec<_>>()
            );
        }
        chain.push(current);
        match &current.inherit_from {
            Some(parent_name) => {
                current = registry.get(parent_name).ok_or_else(|| {
                    color_eyre::eyre::eyre!(
                        "plugin `{}` inherits from unknown plugin `{}`",
                        spec.name,
                        parent_name
                    )
                })?;
            }
            None => break,
        }
    }

    // `chain` is [descendant, ..., root-ancestor]; fold root-first so later
    // (more specific) entries override earlier ones.
    let mut resolved = chain.pop().cloned().expect("chain always has >= 1 entry");
    while let Some(next) = chain.pop() {
        resolved = merge_spec(&resolved, next);
    }
    Ok(resolved)
}

/// Merge `child` over `parent`: config deep-merges, selection/metadata/env
/// concatenate (child's entries evaluated after the parent's, so they take
/// precedence in the catalog engine's "more specific wins" tie-break), and
/// identity/kind/install fields are taken from the child outright.
fn merge_spec(parent: &PluginSpec, child: &PluginSpec) -> PluginSpec {
    let mut select = parent.select.clone();
    select.extend(child.select.iter().cloned());

    let mut metadata = parent.metadata.clone();
    metadata.extend(child.metadata.iter().cloned());

    let mut stream_maps = parent.stream_maps.clone();
    stream_maps.extend(child.stream_maps.iter().cloned());

    let mut env = parent.env.clone();
    env.extend(child.env.clone());

    let mut accents = parent.accents.clone();
    for (target, overlay) in &child.accents {
        let merged = match accents.get(target) {
            Some(existing) => ConfigValue::merge(existing, overlay),
            None => overlay.clone(),
        };
        accents.insert(target.clone(), merged);
    }

    let mut capabilities = parent.capabilities.clone();
    capabilities.extend(child.capabilities.iter().copied());

    PluginSpec {
        name: child.name.clone(),
        kind: child.kind,
        install_url: child.install_url.clone(),
        executable: child.executable.clone().or_else(|| parent.executable.clone()),
        entrypoint: child.entrypoint.clone().or_else(|| parent.entrypoint.clone()),
        capabilities,
        config: ConfigValue::merge(&parent.config, &child.config),
        select,
        metadata,
        stream_maps,
        env,
        load_path: child.load_path.clone().or_else(|| parent.load_path.clone()),
        accents,
        inherit_from: None,
    }
}

/// Validate that plugin names are unique within each kind — the data model's
/// uniqueness invariant.
pub fn validate_unique_names<'a>(specs: impl IntoIterator<Item = &'a PluginSpec>) -> Result<()> {
    let mut seen: BTreeSet<(PluginKind, &str)> = BTreeSet::new();
    for spec in specs {
        if !seen.insert((spec.kind, spec.name.as_str())) {
            bail!("duplicate plugin name `{}` for kind {}", spec.name, spec.kind);
        }
    }
    Ok(())
}
