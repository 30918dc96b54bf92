//! Top-level wiring: turn a registered set of plugins and an [`EngineConfig`]
//! into a task graph on demand, and run it.
//!
//! Everything in `task` is generic over what a task *is*; everything here is
//! specific to what Alto's tasks *are* — `build:<name>` calls the artifact
//! cache, `<tap>:<target>` calls the pipeline runner, and so on. The graph
//! itself is rebuilt fresh on every [`Engine::run`] call rather than held as
//! a fixed structure, because which tasks even exist is data-dependent on
//! the registered plugins, not a fixed finite set known at compile time.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use bon::Builder;
use color_eyre::{Result, eyre::Context, eyre::bail};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    cache::{ArtifactCache, Packager},
    catalog, clock,
    config::{self, PluginSpec},
    error::{self, AltoError},
    fingerprint::TaskInput,
    fs::{FsHandle, LocalFs},
    pipeline::{self, Invocation},
    state,
    task::{self, TaskBody, TaskDeclaration, TaskId},
};

/// Everything an [`Engine`] needs that isn't derivable from the plugin
/// registry itself: where the project lives, how to reach "remote" storage,
/// the project-wide PII salt, and the grace period given to a cancelled
/// process before it's force-killed. Constructed once by the (out-of-scope)
/// CLI/caller and handed to the engine as a plain value — not layered or
/// merged, since by the time it reaches here the caller has already resolved
/// it from whatever config file format it prefers.
#[derive(Clone, Debug, Builder)]
pub struct EngineConfig {
    pub project_root: PathBuf,
    /// Root of the "remote" object store. `None` (the `file`-scheme default
    /// for a bucketless remote) resolves to a user-home-rooted cache
    /// directory keyed by `project_name`.
    pub remote_root: Option<PathBuf>,
    /// Name the home-rooted cache default is keyed under when `remote_root`
    /// is `None`. Ignored otherwise.
    #[builder(default = "alto".to_string())]
    pub project_name: String,
    pub pii_salt: String,
    pub grace_period: Duration,
    pub interpreter_major_minor: String,
    pub arch_tag: String,
    pub active_environment: Option<String>,
    #[builder(default)]
    pub project_env: BTreeMap<String, String>,
}

impl EngineConfig {
    fn staging_dir(&self) -> PathBuf {
        self.project_root.join("staging")
    }

    fn ledger_path(&self) -> PathBuf {
        self.project_root.join(".alto-tasks.json")
    }

    fn env_name(&self) -> &str {
        self.active_environment.as_deref().unwrap_or("default")
    }

    /// Resolve the remote store's root: the configured path, or a
    /// user-home-rooted cache default when none was given.
    fn resolved_remote_root(&self) -> Result<PathBuf> {
        match &self.remote_root {
            Some(root) => Ok(root.clone()),
            None => crate::fs::default_root(&self.project_name),
        }
    }
}

/// Declares a task id never changes fingerprint given static inputs — used
/// for tasks whose whole point is to move new data on every invocation
/// (a pipeline run, a reservoir write/replay), where "up to date" has no
/// sensible meaning. The task engine has no "always run" escape hatch of its
/// own, so this is the established way to get one: feed it an input that's
/// never equal to its last value.
fn volatile_marker() -> TaskInput {
    TaskInput::Scalar(format!("{:?}", std::time::SystemTime::now()))
}

fn metadata_overlays(spec: &PluginSpec) -> Vec<(String, serde_json::Value)> {
    spec.metadata.iter().map(|m| (m.pattern.clone(), m.metadata.to_json())).collect()
}

/// Bytes that change whenever `spec`'s selection patterns or metadata
/// overlays change, for tasks whose identity depends on the runtime catalog
/// they'd compute rather than on a built artifact or a config file.
fn selection_fingerprint_bytes(spec: &PluginSpec) -> Vec<u8> {
    let mut bytes = spec.select.join("\n").into_bytes();
    for overlay in &spec.metadata {
        bytes.extend_from_slice(overlay.pattern.as_bytes());
        bytes.extend_from_slice(&crate::fingerprint::canonicalize(&overlay.metadata));
    }
    bytes
}

/// Find `a` and `b` such that `s == "{a}-{b}"` and both are known plugin
/// names. `reservoir:<tap>-<target>` task ids need this because both tap and
/// target names may themselves contain hyphens, so there's no fixed split
/// point — the plugin registry is what disambiguates it.
fn split_known_pair<'a>(s: &'a str, plugins: &BTreeMap<String, PluginSpec>) -> Option<(&'a str, &'a str)> {
    s.match_indices('-').find_map(|(i, _)| {
        let (a, b) = (&s[..i], &s[i + 1..]);
        (plugins.contains_key(a) && plugins.contains_key(b)).then_some((a, b))
    })
}

/// Owns the registered plugins and the subsystems they're run through.
/// `Clone` so a task body (which defaults to `'static` in
/// [`task::Engine::add_task`]) can clone the engine into itself rather than
/// borrow it.
#[derive(Clone)]
pub struct Engine<P: Packager> {
    config: EngineConfig,
    remote: LocalFs,
    cache: ArtifactCache<LocalFs, P>,
    plugins: BTreeMap<String, PluginSpec>,
}

impl<P: Packager> Engine<P> {
    /// Resolve every plugin's `inherit_from` chain and open the remote
    /// filesystem and artifact cache the engine will run tasks through.
    pub async fn new(config: EngineConfig, packager: P, declared: BTreeMap<String, PluginSpec>) -> Result<Self> {
        config::validate_unique_names(declared.values())?;
        let mut plugins = BTreeMap::new();
        for spec in declared.values() {
            let resolved = config::resolve_inherit_chain(spec, &declared)?;
            plugins.insert(resolved.name.clone(), resolved);
        }

        let remote = LocalFs::open(config.resolved_remote_root()?).await?;
        let cache = ArtifactCache::new(
            config.project_root.join("cache"),
            remote.clone(),
            packager,
            config.interpreter_major_minor.clone(),
            config.arch_tag.clone(),
        );
        Ok(Self { config, remote, cache, plugins })
    }

    fn spec(&self, name: &str) -> Result<&PluginSpec> {
        self.plugins.get(name).ok_or_else(|| color_eyre::eyre::eyre!("unknown plugin `{name}`"))
    }

    /// Run `task_id` and its transitive dependencies. Builds a fresh task
    /// graph rooted at `task_id` on every call — the set of declarable tasks
    /// depends on the plugin registry, not on any fixed universe, so there's
    /// nothing to cache across calls except the ledger itself.
    #[instrument(skip(self), fields(task_id))]
    pub async fn run(&self, task_id: &str) -> Result<task::RunReport> {
        let mut builder = task::Engine::<task::Building>::new();
        let mut declared = std::collections::BTreeSet::new();
        self.declare(task_id, &mut builder, &mut declared)?;
        let sealed = builder.seal()?;

        let ledger_path = self.config.ledger_path();
        let mut ledger = task::TaskLedger::load(&ledger_path).await.context("load task ledger")?;
        sealed.run(task_id, &self.remote, &mut ledger, &ledger_path).await
    }

    fn declare(&self, task_id: &str, builder: &mut task::Engine<task::Building>, declared: &mut std::collections::BTreeSet<TaskId>) -> Result<()> {
        if !declared.insert(task_id.to_string()) {
            return Ok(());
        }
        let (decl, deps, body) = self.build_node(task_id)?;
        for dep in &deps {
            self.declare(dep, builder, declared)?;
        }
        builder.add_task(task_id, decl, body, deps);
        Ok(())
    }

    /// Dispatch a task id to its declaration, dependencies, and body. This is
    /// the one place that knows the task-kind grammar: `build:<name>`,
    /// `config:<name>`, `catalog:<tap>`, `apply:<tap>`, `test:<tap>`,
    /// `about:<tap>`, `clean:<scope>`, `<tap>:reservoir`,
    /// `reservoir:<tap>-<target>`, and the fallback `<tap>:<target>`
    /// pipeline run.
    fn build_node(&self, task_id: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        if let Some(name) = task_id.strip_prefix("build:") {
            return self.build_task(name);
        }
        if let Some(name) = task_id.strip_prefix("config:") {
            return self.config_task(name);
        }
        if let Some(name) = task_id.strip_prefix("catalog:") {
            return self.catalog_task(name);
        }
        if let Some(name) = task_id.strip_prefix("apply:") {
            return self.apply_task(name);
        }
        if let Some(name) = task_id.strip_prefix("test:") {
            return self.probe_task(name, "--test");
        }
        if let Some(name) = task_id.strip_prefix("about:") {
            return self.probe_task(name, "--about");
        }
        if let Some(scope) = task_id.strip_prefix("clean:") {
            return self.clean_task(scope);
        }
        if let Some(rest) = task_id.strip_prefix("reservoir:") {
            let (tap_name, target_name) = split_known_pair(rest, &self.plugins)
                .ok_or_else(|| color_eyre::eyre::eyre!("task `{task_id}`: `{rest}` doesn't split into two known plugin names"))?;
            return self.replay_task(tap_name, target_name);
        }

        let (left, right) = task_id
            .split_once(':')
            .ok_or_else(|| color_eyre::eyre::eyre!("malformed task id `{task_id}`"))?;
        if right == "reservoir" {
            self.tap_to_reservoir_task(left)
        } else {
            self.pipeline_task(left, right)
        }
    }

    fn build_task(&self, name: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let spec = self.spec(name)?.clone();
        let cache = self.cache.clone();
        let decl = TaskDeclaration {
            inputs: vec![
                TaskInput::Scalar(spec.install_url.clone()),
                TaskInput::Scalar(spec.executable_or_entrypoint().to_string()),
            ],
            outputs: vec![cache.remote_object_path(&spec)],
        };

        let body: Box<dyn TaskBody> = Box::new(move || {
            let cache = cache.clone();
            let spec = spec.clone();
            async move {
                let result = cache.get_or_build(&spec).await.map(|_| ());
                error::classify(result, |message| AltoError::BuildFailure { plugin: spec.name.clone(), message, log: String::new() })
            }
        });
        Ok((decl, vec![], body))
    }

    fn config_task(&self, name: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let spec = self.spec(name)?.clone();
        let staging_dir = self.config.staging_dir();
        let project_env = self.config.project_env.clone();

        // Projection writes to the local staging directory, not the abstract
        // object store, so there's no output path the generic skip check can
        // confirm against; identity rests on the input fingerprint alone.
        // Re-running projection is a cheap, idempotent JSON write, so a
        // false "up to date" after someone deletes the staged file by hand
        // is a low-severity gap rather than a correctness one.
        let decl = TaskDeclaration {
            inputs: vec![TaskInput::FileContent(crate::fingerprint::canonicalize(&spec.config))],
            outputs: vec![],
        };

        let body: Box<dyn TaskBody> = Box::new(move || {
            let spec = spec.clone();
            let staging_dir = staging_dir.clone();
            let project_env = project_env.clone();
            async move {
                let result = config::projection::project_plugin(&spec, &staging_dir, &project_env).await.map(|_| ());
                error::classify(result, |message| AltoError::Config { key_path: spec.name.clone(), message })
            }
        });
        Ok((decl, vec![], body))
    }

    fn catalog_task(&self, tap_name: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let spec = self.spec(tap_name)?.clone();
        let cache = self.cache.clone();
        let remote = self.remote.clone();
        let staging_dir = self.config.staging_dir();
        let project_env = self.config.project_env.clone();

        let decl = TaskDeclaration {
            inputs: vec![TaskInput::Scalar(spec.install_url.clone())],
            outputs: vec![format!("catalogs/{}.base.json", spec.name)],
        };
        let deps = vec![format!("build:{}", spec.name), format!("config:{}", spec.name)];

        let body: Box<dyn TaskBody> = Box::new(move || {
            let spec = spec.clone();
            let cache = cache.clone();
            let remote = remote.clone();
            let staging_dir = staging_dir.clone();
            let project_env = project_env.clone();
            async move {
                let result = discover(&spec, &cache, &remote, &staging_dir, &project_env).await;
                error::classify(result, |message| AltoError::DiscoveryFailure { tap: spec.name.clone(), message })
            }
        });
        Ok((decl, deps, body))
    }

    fn apply_task(&self, tap_name: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let spec = self.spec(tap_name)?.clone();
        let remote = self.remote.clone();

        let decl = TaskDeclaration {
            inputs: vec![TaskInput::FileContent(selection_fingerprint_bytes(&spec))],
            outputs: vec![format!("catalogs/{}.runtime.json", spec.name)],
        };
        let deps = vec![format!("catalog:{}", spec.name)];

        let body: Box<dyn TaskBody> = Box::new(move || {
            let spec = spec.clone();
            let remote = remote.clone();
            async move {
                let result = materialize_runtime_catalog(&spec, &remote).await;
                error::classify(result, |message| AltoError::Config { key_path: spec.name.clone(), message })
            }
        });
        Ok((decl, deps, body))
    }

    fn pipeline_task(&self, tap_name: &str, target_name: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let tap = self.spec(tap_name)?.clone();
        let target = self.spec(target_name)?.clone();
        let cache = self.cache.clone();
        let remote = self.remote.clone();
        let staging_dir = self.config.staging_dir();
        let project_env = self.config.project_env.clone();
        let salt = self.config.pii_salt.clone();
        let grace_period = self.config.grace_period;
        let env = self.config.env_name().to_string();

        let decl = TaskDeclaration {
            inputs: vec![TaskInput::Scalar(tap.install_url.clone()), TaskInput::Scalar(target.install_url.clone()), volatile_marker()],
            outputs: vec![],
        };
        let deps = vec![
            format!("build:{}", tap.name),
            format!("build:{}", target.name),
            format!("config:{}", tap.name),
            format!("config:{}", target.name),
            format!("apply:{}", tap.name),
        ];

        let body: Box<dyn TaskBody> = Box::new(move || {
            let tap = tap.clone();
            let target = target.clone();
            let cache = cache.clone();
            let remote = remote.clone();
            let staging_dir = staging_dir.clone();
            let project_env = project_env.clone();
            let salt = salt.clone();
            let env = env.clone();
            async move {
                let result = run_pipeline(&tap, &target, &cache, &remote, &staging_dir, &project_env, &salt, grace_period, &env).await;
                error::classify(result, |message| AltoError::PipelineFailure { tap: tap.name.clone(), target: target.name.clone(), message })
            }
        });
        Ok((decl, deps, body))
    }

    fn tap_to_reservoir_task(&self, tap_name: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let tap = self.spec(tap_name)?.clone();
        let cache = self.cache.clone();
        let remote = self.remote.clone();
        let staging_dir = self.config.staging_dir();
        let project_env = self.config.project_env.clone();
        let env = self.config.env_name().to_string();

        let decl = TaskDeclaration { inputs: vec![TaskInput::Scalar(tap.install_url.clone()), volatile_marker()], outputs: vec![] };
        let deps = vec![format!("build:{}", tap.name), format!("config:{}", tap.name)];

        let body: Box<dyn TaskBody> = Box::new(move || {
            let tap = tap.clone();
            let cache = cache.clone();
            let remote = remote.clone();
            let staging_dir = staging_dir.clone();
            let project_env = project_env.clone();
            let env = env.clone();
            async move {
                let result = write_to_reservoir(&tap, &cache, &remote, &staging_dir, &project_env, &env).await;
                error::classify(result, |message| AltoError::PipelineFailure { tap: tap.name.clone(), target: "reservoir".to_string(), message })
            }
        });
        Ok((decl, deps, body))
    }

    fn replay_task(&self, tap_name: &str, target_name: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let tap = self.spec(tap_name)?.clone();
        let target = self.spec(target_name)?.clone();
        let cache = self.cache.clone();
        let remote = self.remote.clone();
        let staging_dir = self.config.staging_dir();
        let project_env = self.config.project_env.clone();
        let env = self.config.env_name().to_string();

        let decl = TaskDeclaration { inputs: vec![volatile_marker()], outputs: vec![] };
        let deps = vec![format!("build:{}", target.name), format!("config:{}", target.name)];

        let body: Box<dyn TaskBody> = Box::new(move || {
            let tap = tap.clone();
            let target = target.clone();
            let cache = cache.clone();
            let remote = remote.clone();
            let staging_dir = staging_dir.clone();
            let project_env = project_env.clone();
            let env = env.clone();
            async move {
                let result = replay_reservoir(&tap, &target, &cache, &remote, &staging_dir, &project_env, &env).await;
                error::classify(result, |message| AltoError::PipelineFailure { tap: tap.name.clone(), target: target.name.clone(), message })
            }
        });
        Ok((decl, deps, body))
    }

    fn probe_task(&self, name: &str, flag: &'static str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let spec = self.spec(name)?.clone();
        let cache = self.cache.clone();
        let staging_dir = self.config.staging_dir();
        let project_env = self.config.project_env.clone();

        let decl = TaskDeclaration { inputs: vec![volatile_marker()], outputs: vec![] };
        let deps = vec![format!("build:{}", spec.name), format!("config:{}", spec.name)];

        let body: Box<dyn TaskBody> = Box::new(move || {
            let spec = spec.clone();
            let cache = cache.clone();
            let staging_dir = staging_dir.clone();
            let project_env = project_env.clone();
            async move {
                let result = probe(&spec, flag, &cache, &staging_dir, &project_env).await;
                error::classify(result, |message| AltoError::PipelineFailure { tap: spec.name.clone(), target: flag.to_string(), message })
            }
        });
        Ok((decl, deps, body))
    }

    /// `clean:<name>` drops a plugin's cached base catalog and runtime
    /// catalog introspection file, forcing the next `catalog:`/`apply:` to
    /// rediscover from scratch. It does not touch state or the reservoir —
    /// those are a project's data history, not a build artifact, and
    /// clearing them isn't what "clean" means for a cache-like task graph.
    fn clean_task(&self, name: &str) -> Result<(TaskDeclaration, Vec<TaskId>, Box<dyn TaskBody>)> {
        let spec = self.spec(name)?.clone();
        let remote = self.remote.clone();
        let decl = TaskDeclaration { inputs: vec![volatile_marker()], outputs: vec![] };

        let body: Box<dyn TaskBody> = Box::new(move || {
            let spec = spec.clone();
            let remote = remote.clone();
            async move {
                let result: Result<()> = async {
                    remote.remove(&format!("catalogs/{}.base.json", spec.name)).await?;
                    remote.remove(&format!("catalogs/{}.runtime.json", spec.name)).await?;
                    Ok(())
                }
                .await;
                error::classify(result, |message| AltoError::Config { key_path: spec.name.clone(), message })
            }
        });
        Ok((decl, vec![], body))
    }
}

async fn discover<P: Packager>(
    spec: &PluginSpec,
    cache: &ArtifactCache<LocalFs, P>,
    remote: &LocalFs,
    staging_dir: &std::path::Path,
    project_env: &BTreeMap<String, String>,
) -> Result<()> {
    let artifact = cache.get_or_build(spec).await?;
    let projected = config::projection::project_plugin(spec, staging_dir, project_env).await?;
    let invocation = Invocation {
        executable: artifact,
        args: vec!["--config".to_string(), projected.config_path.display().to_string(), "--discover".to_string()],
        env: projected.env,
        working_dir: None,
    };

    tokio::fs::create_dir_all(staging_dir).await.context("create staging directory")?;
    let log_path = staging_dir.join(format!("{}.discover.log", spec.name));
    let log = tokio::fs::File::create(&log_path).await.context("create discovery log")?;
    let (status, stdout) = pipeline::run_capture_stdout(&invocation, log).await?;
    if !status.success() {
        bail!("discovery for `{}` exited {status}", spec.name);
    }
    catalog::store_base(remote, &spec.name, &stdout).await?;
    Ok(())
}

async fn materialize_runtime_catalog(spec: &PluginSpec, remote: &LocalFs) -> Result<()> {
    let base = catalog::load_base(remote, &spec.name)
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("no base catalog cached for `{}`; run catalog:{} first", spec.name, spec.name))?;
    let (runtime, _pii) = catalog::compute_runtime(&base, &spec.select, &metadata_overlays(spec))?;
    let bytes = serde_json::to_vec_pretty(&runtime).context("serialize runtime catalog")?;
    remote.put(&format!("catalogs/{}.runtime.json", spec.name), &bytes).await?;
    Ok(())
}

/// The full tap→target run: projects both sides' config, recomputes the
/// runtime catalog from the cached base catalog (rather than reading back
/// `apply:<tap>`'s materialized file — the task engine passes no values
/// between tasks, only ordering, so this is the cheapest way to keep the
/// declared `apply:<tap>` dependency meaningful without a second engine
/// concept for inter-task data), feeds in the prior active state if any, and
/// commits whatever state the target emits.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline<P: Packager>(
    tap: &PluginSpec,
    target: &PluginSpec,
    cache: &ArtifactCache<LocalFs, P>,
    remote: &LocalFs,
    staging_dir: &std::path::Path,
    project_env: &BTreeMap<String, String>,
    salt: &str,
    grace_period: Duration,
    env: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(staging_dir).await.context("create staging directory")?;

    let tap_artifact = cache.get_or_build(tap).await?;
    let target_artifact = cache.get_or_build(target).await?;
    let (projected_tap, projected_target) = config::projection::project_pipeline(tap, target, staging_dir, project_env).await?;

    let base = catalog::load_base(remote, &tap.name)
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("no base catalog cached for `{}`; run catalog:{} first", tap.name, tap.name))?;
    let (runtime, pii) = catalog::compute_runtime(&base, &tap.select, &metadata_overlays(tap))?;
    let catalog_path = staging_dir.join(format!("{}.catalog.json", tap.name));
    tokio::fs::write(&catalog_path, serde_json::to_vec_pretty(&runtime)?).await.context("write runtime catalog")?;

    let active_state = state::load_active(remote, env, &tap.name, &target.name).await?;
    let state_path = match &active_state {
        Some(value) => {
            let path = staging_dir.join(format!("{}-to-{}.state.json", tap.name, target.name));
            tokio::fs::write(&path, serde_json::to_vec_pretty(value)?).await.context("write input state")?;
            Some(path)
        }
        None => None,
    };

    let mut tap_args = vec!["--config".to_string(), projected_tap.config_path.display().to_string(), "--catalog".to_string(), catalog_path.display().to_string()];
    if let Some(path) = &state_path {
        tap_args.push("--state".to_string());
        tap_args.push(path.display().to_string());
    }
    let tap_invocation = Invocation { executable: tap_artifact, args: tap_args, env: projected_tap.env, working_dir: None };
    let target_invocation = Invocation {
        executable: target_artifact,
        args: vec!["--config".to_string(), projected_target.config_path.display().to_string()],
        env: projected_target.env,
        working_dir: None,
    };
    let stream_map_invocation = tap.stream_maps.first().map(|stream_map| Invocation {
        executable: PathBuf::from(&stream_map.script),
        args: vec![],
        env: BTreeMap::new(),
        working_dir: None,
    });

    let tap_log = tokio::fs::File::create(staging_dir.join(format!("{}.log", tap.name))).await.context("create tap log")?;
    let target_log = tokio::fs::File::create(staging_dir.join(format!("{}.log", target.name))).await.context("create target log")?;
    let stream_map_log = tokio::fs::File::create(staging_dir.join(format!("{}.stream-map.log", tap.name))).await.context("create stream-map log")?;

    let outcome = pipeline::run(
        &tap_invocation,
        &target_invocation,
        stream_map_invocation.as_ref(),
        &pii,
        salt,
        tap_log,
        target_log,
        stream_map_log,
        CancellationToken::new(),
        grace_period,
    )
    .await?;

    if let Some(final_state) = outcome.final_state {
        state::commit(remote, env, &tap.name, &target.name, &final_state, &clock::compact()).await?;
    }
    Ok(())
}

async fn write_to_reservoir<P: Packager>(
    tap: &PluginSpec,
    cache: &ArtifactCache<LocalFs, P>,
    remote: &LocalFs,
    staging_dir: &std::path::Path,
    project_env: &BTreeMap<String, String>,
    env: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(staging_dir).await.context("create staging directory")?;

    let artifact = cache.get_or_build(tap).await?;
    let projected = config::projection::project_plugin(tap, staging_dir, project_env).await?;
    let invocation = Invocation {
        executable: artifact,
        args: vec!["--config".to_string(), projected.config_path.display().to_string()],
        env: projected.env,
        working_dir: None,
    };

    let log = tokio::fs::File::create(staging_dir.join(format!("{}.reservoir.log", tap.name))).await.context("create reservoir log")?;
    pipeline::run_to_reservoir(remote, &invocation, env, &tap.name, &clock::compact_micros(), log).await
}

async fn replay_reservoir<P: Packager>(
    tap: &PluginSpec,
    target: &PluginSpec,
    cache: &ArtifactCache<LocalFs, P>,
    remote: &LocalFs,
    staging_dir: &std::path::Path,
    project_env: &BTreeMap<String, String>,
    env: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(staging_dir).await.context("create staging directory")?;

    let artifact = cache.get_or_build(target).await?;
    let projected = config::projection::project_plugin(target, staging_dir, project_env).await?;
    let invocation = Invocation {
        executable: artifact,
        args: vec!["--config".to_string(), projected.config_path.display().to_string()],
        env: projected.env,
        working_dir: None,
    };

    let target_name = target.name.clone();
    let staging_dir_owned = staging_dir.to_path_buf();
    let log_factory = move || {
        let path = staging_dir_owned.join(format!("{target_name}.replay.log"));
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(tokio::fs::File::from_std)
            .expect("open replay log file")
    };

    let parallel = target
        .config
        .as_map()
        .and_then(|map| map.get("idempotent"))
        .is_some_and(|value| matches!(value, crate::config::ConfigValue::Bool(true)));
    let outcomes = pipeline::run_from_reservoir(remote, env, &tap.name, &invocation, log_factory, parallel).await?;
    for outcome in outcomes {
        if let Some(final_state) = outcome.final_state {
            state::commit(remote, env, &tap.name, &target.name, &final_state, &clock::compact()).await?;
        }
    }
    Ok(())
}

async fn probe<P: Packager>(
    spec: &PluginSpec,
    flag: &str,
    cache: &ArtifactCache<LocalFs, P>,
    staging_dir: &std::path::Path,
    project_env: &BTreeMap<String, String>,
) -> Result<()> {
    tokio::fs::create_dir_all(staging_dir).await.context("create staging directory")?;

    let artifact = cache.get_or_build(spec).await?;
    let projected = config::projection::project_plugin(spec, staging_dir, project_env).await?;
    let invocation = Invocation {
        executable: artifact,
        args: vec!["--config".to_string(), projected.config_path.display().to_string(), flag.to_string()],
        env: projected.env,
        working_dir: None,
    };

    let suffix = flag.trim_start_matches("--");
    let log_path = staging_dir.join(format!("{}.{suffix}.log", spec.name));
    let log = tokio::fs::File::create(&log_path).await.context("create probe log")?;
    let (status, stdout) = pipeline::run_capture_stdout(&invocation, log).await?;
    let out_path = staging_dir.join(format!("{}.{suffix}.json", spec.name));
    tokio::fs::write(&out_path, &stdout).await.context("write probe output")?;

    if !status.success() {
        bail!("{flag} for `{}` exited {status}", spec.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginKind;
    use std::collections::BTreeSet;

    fn spec(name: &str, kind: PluginKind) -> PluginSpec {
        PluginSpec {
            name: name.to_string(),
            kind,
            install_url: format!("{name}==1.0"),
            executable: Some(name.to_string()),
            entrypoint: None,
            capabilities: BTreeSet::new(),
            config: crate::config::ConfigValue::empty_map(),
            select: vec!["*.*".to_string()],
            metadata: Vec::new(),
            stream_maps: Vec::new(),
            env: BTreeMap::new(),
            load_path: None,
            accents: BTreeMap::new(),
            inherit_from: None,
        }
    }

    #[derive(Clone)]
    struct ShellPackager;

    impl Packager for ShellPackager {
        async fn build(&self, _spec: &PluginSpec) -> Result<Vec<u8>, AltoError> {
            let catalog = r#"{"streams":[{"tap_stream_name":"orders","schema":{"properties":{"id":{"type":"string"}}},"metadata":[]}]}"#;
            Ok(format!("#!/bin/sh\necho '{catalog}'\n").into_bytes())
        }
    }

    async fn engine(dir: &std::path::Path, plugins: BTreeMap<String, PluginSpec>) -> Engine<ShellPackager> {
        let config = EngineConfig {
            project_root: dir.join("project"),
            remote_root: Some(dir.join("remote")),
            project_name: "alto-test".to_string(),
            pii_salt: "test-salt".to_string(),
            grace_period: Duration::from_secs(1),
            interpreter_major_minor: "3.11".to_string(),
            arch_tag: "x86_64-linux".to_string(),
            active_environment: None,
            project_env: BTreeMap::new(),
        };
        Engine::new(config, ShellPackager, plugins).await.unwrap()
    }

    #[tokio::test]
    async fn builder_fills_remote_root_and_project_env_defaults() {
        let config = EngineConfig::builder()
            .project_root(PathBuf::from("/tmp/proj"))
            .pii_salt("salt".to_string())
            .grace_period(Duration::from_secs(1))
            .interpreter_major_minor("3.11".to_string())
            .arch_tag("x86_64-linux".to_string())
            .build();
        assert!(config.remote_root.is_none());
        assert_eq!(config.project_name, "alto");
        assert!(config.project_env.is_empty());
    }

    #[tokio::test]
    async fn unset_remote_root_resolves_to_home_rooted_default() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: this test owns the variable; no other test reads it concurrently.
        unsafe { std::env::set_var("ALTO_CACHE_DIR", dir.path()) };
        let config = EngineConfig::builder()
            .project_root(dir.path().join("project"))
            .project_name("alto-home-default-test".to_string())
            .pii_salt("salt".to_string())
            .grace_period(Duration::from_secs(1))
            .interpreter_major_minor("3.11".to_string())
            .arch_tag("x86_64-linux".to_string())
            .build();
        let resolved = config.resolved_remote_root().unwrap();
        unsafe { std::env::remove_var("ALTO_CACHE_DIR") };
        assert_eq!(resolved, dir.path());
    }

    #[tokio::test]
    async fn build_task_declares_no_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let tap = spec("tap-x", PluginKind::Tap);
        let plugins = [(tap.name.clone(), tap)].into_iter().collect();
        let engine = engine(dir.path(), plugins).await;

        let (_, deps, _) = engine.build_node("build:tap-x").unwrap();
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn pipeline_task_depends_on_build_config_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let tap = spec("tap-x", PluginKind::Tap);
        let target = spec("target-jsonl", PluginKind::Target);
        let plugins = [(tap.name.clone(), tap), (target.name.clone(), target)].into_iter().collect();
        let engine = engine(dir.path(), plugins).await;

        let (_, deps, _) = engine.build_node("tap-x:target-jsonl").unwrap();
        assert!(deps.contains(&"build:tap-x".to_string()));
        assert!(deps.contains(&"build:target-jsonl".to_string()));
        assert!(deps.contains(&"config:tap-x".to_string()));
        assert!(deps.contains(&"config:target-jsonl".to_string()));
        assert!(deps.contains(&"apply:tap-x".to_string()));
    }

    #[tokio::test]
    async fn reservoir_replay_task_splits_hyphenated_names() {
        let dir = tempfile::tempdir().unwrap();
        let tap = spec("tap-salesforce", PluginKind::Tap);
        let target = spec("target-big-query", PluginKind::Target);
        let plugins = [(tap.name.clone(), tap), (target.name.clone(), target)].into_iter().collect();
        let engine = engine(dir.path(), plugins).await;

        let (_, deps, _) = engine.build_node("reservoir:tap-salesforce-target-big-query").unwrap();
        assert!(deps.contains(&"build:target-big-query".to_string()));
    }

    #[tokio::test]
    async fn unknown_task_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), BTreeMap::new()).await;
        assert!(engine.build_node("build:nonexistent").is_err());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn discover_then_apply_runs_a_real_shell_tap() {
        let dir = tempfile::tempdir().unwrap();
        let mut tap = spec("tap-x", PluginKind::Tap);
        tap.capabilities = [crate::config::Capability::Catalog].into_iter().collect();
        let plugins = [(tap.name.clone(), tap)].into_iter().collect();
        let engine = engine(dir.path(), plugins).await;

        let report = engine.run("apply:tap-x").await.unwrap();
        assert!(report.all_succeeded_or_skipped());
        assert_eq!(report.outcome_of("catalog:tap-x"), Some(task::Outcome::Succeeded));
        assert_eq!(report.outcome_of("apply:tap-x"), Some(task::Outcome::Succeeded));

        let runtime = engine.remote.get("catalogs/tap-x.runtime.json").await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&runtime).unwrap();
        assert_eq!(value["streams"][0]["tap_stream_name"], "orders");
    }
}
