//! Full tap -> target runs through `alto::engine::Engine`, against fixture
//! shell-script plugins.

use std::collections::BTreeMap;

use alto::config::PluginKind;
use color_eyre::{Result, eyre::Context};
use pretty_assertions::assert_eq;

use crate::{build_engine, plugin, tap_script, target_script};

#[test_log::test(tokio::test)]
async fn full_run_hashes_pii_fields_and_commits_state() -> Result<()> {
    let project = tempfile::tempdir().context("create project tempdir")?;
    let remote = tempfile::tempdir().context("create remote tempdir")?;
    let output = project.path().join("target-output.ndjson");

    let mut tap = plugin("tap-x", PluginKind::Tap);
    tap.select = vec!["*.*".to_string(), "~orders.email".to_string()];

    let mut target = plugin("target-jsonl", PluginKind::Target);
    target.env.insert("TARGET_OUTPUT".to_string(), output.display().to_string());

    let plugins: BTreeMap<_, _> = [(tap.name.clone(), tap), (target.name.clone(), target)].into_iter().collect();
    let scripts: BTreeMap<_, _> =
        [("tap-x".to_string(), tap_script()), ("target-jsonl".to_string(), target_script())].into_iter().collect();
    let engine = build_engine(project.path(), remote.path(), plugins, scripts).await;

    let report = engine.run("tap-x:target-jsonl").await.context("run tap-x:target-jsonl")?;
    assert!(report.all_succeeded_or_skipped());

    let written = tokio::fs::read_to_string(&output).await.context("read target output")?;
    let records: Vec<serde_json::Value> =
        written.lines().map(serde_json::from_str).collect::<std::result::Result<_, _>>().context("parse target output lines")?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["record"]["id"], "1");
    assert_ne!(records[0]["record"]["email"], "alice@example.com");
    assert_eq!(records[0]["record"]["email"].as_str().unwrap().len(), 64);
    assert_eq!(records[1]["record"]["id"], "2");

    let remote_fs = alto::fs::LocalFs::open(remote.path()).await.context("open remote fs")?;
    let active = alto::state::load_active(&remote_fs, "default", "tap-x", "target-jsonl")
        .await
        .context("load active state")?
        .expect("a successful run commits active state");
    assert_eq!(active["bookmarks"]["orders"], "cursor-1");

    // Pipeline tasks are always run (their fingerprint includes a volatile
    // marker), so a second call re-executes and rotates the prior state.
    let second = engine.run("tap-x:target-jsonl").await.context("run tap-x:target-jsonl again")?;
    assert!(second.all_succeeded_or_skipped());
    let state_files = remote_fs.list("state/default").await.context("list state directory")?;
    assert!(state_files.len() >= 2, "expected a rotated historical state file alongside the active one, got {state_files:?}");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn build_and_config_tasks_are_cached_across_runs() -> Result<()> {
    let project = tempfile::tempdir().context("create project tempdir")?;
    let remote = tempfile::tempdir().context("create remote tempdir")?;
    let output = project.path().join("target-output.ndjson");

    let tap = plugin("tap-x", PluginKind::Tap);
    let mut target = plugin("target-jsonl", PluginKind::Target);
    target.env.insert("TARGET_OUTPUT".to_string(), output.display().to_string());

    let plugins: BTreeMap<_, _> = [(tap.name.clone(), tap), (target.name.clone(), target)].into_iter().collect();
    let scripts: BTreeMap<_, _> =
        [("tap-x".to_string(), tap_script()), ("target-jsonl".to_string(), target_script())].into_iter().collect();
    let engine = build_engine(project.path(), remote.path(), plugins, scripts).await;

    engine.run("tap-x:target-jsonl").await.context("first run")?;
    let second = engine.run("tap-x:target-jsonl").await.context("second run")?;

    assert_eq!(second.outcome_of("build:tap-x"), Some(alto::task::Outcome::Skipped));
    assert_eq!(second.outcome_of("build:target-jsonl"), Some(alto::task::Outcome::Skipped));
    assert_eq!(second.outcome_of("catalog:tap-x"), Some(alto::task::Outcome::Skipped));
    assert_eq!(second.outcome_of("apply:tap-x"), Some(alto::task::Outcome::Skipped));

    Ok(())
}
