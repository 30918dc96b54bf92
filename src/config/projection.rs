//! Config Projection: turn the effective configuration into per-plugin and
//! per-pipeline "views" materialized as files in a staging directory.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use tracing::instrument;

use super::ConfigValue;
use crate::config::plugin::PluginSpec;

/// What the task engine actually hands to a spawned process: a materialized
/// config file, a resolved environment, and the effective load-path.
#[derive(Clone, Debug)]
pub struct ProjectedPlugin {
    pub config_path: PathBuf,
    pub env: BTreeMap<String, String>,
    pub load_path: Option<String>,
}

/// Project a single plugin's effective configuration into the staging
/// directory, combining project-level and plugin-level environment maps.
///
/// `project_env` is the project-wide environment-variable map (lowest
/// precedence); `spec.env` overrides it key-wise.
#[instrument(skip(staging_dir, project_env))]
pub async fn project_plugin(
    spec: &PluginSpec,
    staging_dir: &Path,
    project_env: &BTreeMap<String, String>,
) -> Result<ProjectedPlugin> {
    project_plugin_with_accent(spec, None, staging_dir, project_env).await
}

/// Project a plugin's configuration, optionally applying an accent overlay
/// (the tap's per-target map merged into this plugin's config, tap-over-
/// target precedence) contributed by the tap side of a pipeline.
///
/// Invariant: this is called after `inherit_from` has already been resolved
/// on `spec` (see [`super::plugin::resolve_inherit_chain`]).
#[instrument(skip(staging_dir, project_env, accent))]
pub async fn project_plugin_with_accent(
    spec: &PluginSpec,
    accent: Option<&ConfigValue>,
    staging_dir: &Path,
    project_env: &BTreeMap<String, String>,
) -> Result<ProjectedPlugin> {
    let effective_config = match accent {
        // Accent: tap overrides target, so the accent overlay is applied
        // *on top of* the target's own config.
        Some(accent) => ConfigValue::merge(&spec.config, accent),
        None => spec.config.clone(),
    };

    let config_path = staging_dir.join(format!("{}.config.json", spec.name));
    let json = serde_json::to_vec_pretty(&effective_config.to_json()).context("serialize plugin config")?;
    tokio::fs::write(&config_path, &json)
        .await
        .with_context(|| format!("write projected config to {config_path:?}"))?;

    let mut env = project_env.clone();
    env.extend(spec.env.clone());

    Ok(ProjectedPlugin {
        config_path,
        env,
        load_path: spec.load_path.clone(),
    })
}

/// Project both halves of a `tap -> target` pipeline, applying the tap's
/// accent (if any) to the target's configuration.
///
/// Load-path resolution: a tap combined with a target inherits the tap's
/// effective load-path (the data model invariant), so the returned pair's
/// target load-path is overwritten with the tap's if the tap declares one.
#[instrument(skip(staging_dir, project_env))]
pub async fn project_pipeline(
    tap: &PluginSpec,
    target: &PluginSpec,
    staging_dir: &Path,
    project_env: &BTreeMap<String, String>,
) -> Result<(ProjectedPlugin, ProjectedPlugin)> {
    let tap_accent = tap.accents.get(&target.name);

    let projected_tap = project_plugin(tap, staging_dir, project_env).await?;
    let mut projected_target =
        project_plugin_with_accent(target, tap_accent, staging_dir, project_env).await?;

    if tap.load_path.is_some() {
        projected_target.load_path = tap.load_path.clone();
    }

    Ok((projected_tap, projected_target))
}
