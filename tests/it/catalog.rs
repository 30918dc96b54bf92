//! `catalog:`/`apply:` selection-pattern behavior through the full task
//! graph, as opposed to `catalog::compute_runtime` in isolation.

use std::collections::BTreeMap;

use alto::config::PluginKind;
use color_eyre::{Result, eyre::Context};

use crate::{build_engine, plugin, tap_script};

fn selected(catalog: &serde_json::Value, field: &str) -> bool {
    catalog["streams"][0]["metadata"]
        .as_array()
        .unwrap()
        .iter()
        .find(|entry| entry["breadcrumb"] == serde_json::json!(["properties", field]))
        .and_then(|entry| entry["metadata"]["selected"].as_bool())
        .unwrap_or(false)
}

#[test_log::test(tokio::test)]
async fn apply_excludes_a_named_field_end_to_end() -> Result<()> {
    let project = tempfile::tempdir().context("create project tempdir")?;
    let remote = tempfile::tempdir().context("create remote tempdir")?;

    let mut tap = plugin("tap-x", PluginKind::Tap);
    tap.select = vec!["*.*".to_string(), "!orders.email".to_string()];
    let plugins: BTreeMap<_, _> = [(tap.name.clone(), tap)].into_iter().collect();
    let scripts: BTreeMap<_, _> = [("tap-x".to_string(), tap_script())].into_iter().collect();
    let engine = build_engine(project.path(), remote.path(), plugins, scripts).await;

    let report = engine.run("apply:tap-x").await.context("run apply:tap-x")?;
    assert!(report.all_succeeded_or_skipped());

    let remote_fs = alto::fs::LocalFs::open(remote.path()).await.context("open remote fs")?;
    let bytes = remote_fs
        .get("catalogs/tap-x.runtime.json")
        .await
        .context("read runtime catalog")?
        .expect("apply writes a runtime catalog");
    let catalog: serde_json::Value = serde_json::from_slice(&bytes).context("parse runtime catalog")?;

    assert!(selected(&catalog, "id"));
    assert!(!selected(&catalog, "email"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn clean_task_forces_catalog_rediscovery() -> Result<()> {
    let project = tempfile::tempdir().context("create project tempdir")?;
    let remote = tempfile::tempdir().context("create remote tempdir")?;

    let tap = plugin("tap-x", PluginKind::Tap);
    let plugins: BTreeMap<_, _> = [(tap.name.clone(), tap)].into_iter().collect();
    let scripts: BTreeMap<_, _> = [("tap-x".to_string(), tap_script())].into_iter().collect();
    let engine = build_engine(project.path(), remote.path(), plugins, scripts).await;

    engine.run("catalog:tap-x").await.context("first discovery")?;
    let remote_fs = alto::fs::LocalFs::open(remote.path()).await.context("open remote fs")?;
    assert!(remote_fs.exists("catalogs/tap-x.base.json").await.context("check base catalog")?);

    engine.run("clean:tap-x").await.context("clean")?;
    assert!(!remote_fs.exists("catalogs/tap-x.base.json").await.context("check base catalog removed")?);

    let rerun = engine.run("catalog:tap-x").await.context("rediscovery after clean")?;
    assert!(rerun.all_succeeded_or_skipped());
    assert!(remote_fs.exists("catalogs/tap-x.base.json").await.context("check base catalog recreated")?);

    Ok(())
}
