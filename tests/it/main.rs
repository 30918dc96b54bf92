//! Harness root for `alto`'s integration suite: real subprocesses spawned
//! against tiny fixture shell-script taps/targets, each test in its own temp
//! project/remote root pair.

pub mod catalog;
pub mod pipeline;
pub mod reservoir;

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::Duration,
};

use alto::{
    AltoError,
    cache::Packager,
    config::{ConfigValue, PluginKind, PluginSpec},
    engine::{Engine, EngineConfig},
};

/// Hands back whichever fixture script was registered for a plugin's name,
/// rather than actually invoking pip/npm — the artifact cache only cares
/// that `build` returns executable bytes.
#[derive(Clone)]
pub struct FixturePackager {
    scripts: BTreeMap<String, String>,
}

impl Packager for FixturePackager {
    async fn build(&self, spec: &PluginSpec) -> Result<Vec<u8>, AltoError> {
        let script = self.scripts.get(&spec.name).cloned().unwrap_or_else(|| "#!/bin/sh\nexit 0\n".to_string());
        Ok(script.into_bytes())
    }
}

/// A minimal plugin declaration with every required field filled in; tests
/// mutate the fields they care about.
pub fn plugin(name: &str, kind: PluginKind) -> PluginSpec {
    PluginSpec {
        name: name.to_string(),
        kind,
        install_url: format!("{name}==1.0"),
        executable: Some(name.to_string()),
        entrypoint: None,
        capabilities: BTreeSet::new(),
        config: ConfigValue::empty_map(),
        select: Vec::new(),
        metadata: Vec::new(),
        stream_maps: Vec::new(),
        env: BTreeMap::new(),
        load_path: None,
        accents: BTreeMap::new(),
        inherit_from: None,
    }
}

pub async fn build_engine(
    project_root: &Path,
    remote_root: &Path,
    plugins: BTreeMap<String, PluginSpec>,
    scripts: BTreeMap<String, String>,
) -> Engine<FixturePackager> {
    let config = EngineConfig {
        project_root: project_root.to_path_buf(),
        remote_root: Some(remote_root.to_path_buf()),
        project_name: "alto-it".to_string(),
        pii_salt: "test-salt".to_string(),
        grace_period: Duration::from_secs(2),
        interpreter_major_minor: "3.11".to_string(),
        arch_tag: "x86_64-linux".to_string(),
        active_environment: None,
        project_env: BTreeMap::new(),
    };
    Engine::new(config, FixturePackager { scripts }, plugins).await.expect("build engine over fixture plugins")
}

/// A tap that discovers one `orders` stream (`id`, `email`), and on a normal
/// invocation emits SCHEMA, two RECORDs, and a STATE line. Branches on which
/// flag it was invoked with, same as a real Singer tap would via argparse.
pub fn tap_script() -> String {
    r#"#!/bin/sh
set -e
case "$*" in
  *--discover*)
    echo '{"streams":[{"tap_stream_name":"orders","schema":{"properties":{"id":{"type":"string"},"email":{"type":"string"}}},"metadata":[]}]}'
    ;;
  *--test*)
    echo '{"ok":true}'
    ;;
  *--about*)
    echo '{"about":true}'
    ;;
  *)
    echo '{"type":"SCHEMA","stream":"orders","schema":{"properties":{"id":{"type":"string"},"email":{"type":"string"}}}}'
    echo '{"type":"RECORD","stream":"orders","record":{"id":"1","email":"alice@example.com"}}'
    echo '{"type":"RECORD","stream":"orders","record":{"id":"2","email":"bob@example.com"}}'
    echo '{"type":"STATE","value":{"bookmarks":{"orders":"cursor-1"}}}'
    ;;
esac
"#
    .to_string()
}

/// A target that appends every stdin line to `$TARGET_OUTPUT` verbatim, then
/// emits a STATE line of its own once stdin closes.
pub fn target_script() -> String {
    r#"#!/bin/sh
set -e
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$TARGET_OUTPUT"
done
echo '{"type":"STATE","value":{"bookmarks":{"orders":"cursor-1"}}}'
"#
    .to_string()
}
