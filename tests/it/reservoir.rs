//! Tap -> reservoir -> target, through `alto::engine::Engine`.

use std::collections::BTreeMap;

use alto::config::PluginKind;
use color_eyre::{Result, eyre::Context};
use pretty_assertions::assert_eq;

use crate::{build_engine, plugin, tap_script, target_script};

#[test_log::test(tokio::test)]
async fn replay_preserves_record_order_across_partitions() -> Result<()> {
    let project = tempfile::tempdir().context("create project tempdir")?;
    let remote = tempfile::tempdir().context("create remote tempdir")?;
    let output = project.path().join("replayed.ndjson");

    let tap = plugin("tap-x", PluginKind::Tap);
    let mut target = plugin("target-jsonl", PluginKind::Target);
    target.env.insert("TARGET_OUTPUT".to_string(), output.display().to_string());

    let plugins: BTreeMap<_, _> = [(tap.name.clone(), tap), (target.name.clone(), target)].into_iter().collect();
    let scripts: BTreeMap<_, _> =
        [("tap-x".to_string(), tap_script()), ("target-jsonl".to_string(), target_script())].into_iter().collect();
    let engine = build_engine(project.path(), remote.path(), plugins, scripts).await;

    let write_report = engine.run("tap-x:reservoir").await.context("write to reservoir")?;
    assert!(write_report.all_succeeded_or_skipped());

    let remote_fs = alto::fs::LocalFs::open(remote.path()).await.context("open remote fs")?;
    let partitions = alto::reservoir::enumerate_partitions(&remote_fs, "default", "tap-x").await.context("enumerate partitions")?;
    assert_eq!(partitions.len(), 1, "both records share one orders-stream/schema partition");

    let replay_report = engine.run("reservoir:tap-x-target-jsonl").await.context("replay reservoir")?;
    assert!(replay_report.all_succeeded_or_skipped());

    let written = tokio::fs::read_to_string(&output).await.context("read replayed output")?;
    let ids: Vec<String> = written
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line)
                .map(|value| value["record"]["id"].as_str().unwrap_or_default().to_string())
        })
        .collect::<std::result::Result<_, _>>()
        .context("parse replayed lines")?;
    assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn writing_twice_appends_a_second_partition() -> Result<()> {
    let project = tempfile::tempdir().context("create project tempdir")?;
    let remote = tempfile::tempdir().context("create remote tempdir")?;

    let tap = plugin("tap-x", PluginKind::Tap);
    let plugins: BTreeMap<_, _> = [(tap.name.clone(), tap)].into_iter().collect();
    let scripts: BTreeMap<_, _> = [("tap-x".to_string(), tap_script())].into_iter().collect();
    let engine = build_engine(project.path(), remote.path(), plugins, scripts).await;

    engine.run("tap-x:reservoir").await.context("first reservoir write")?;
    engine.run("tap-x:reservoir").await.context("second reservoir write")?;

    let remote_fs = alto::fs::LocalFs::open(remote.path()).await.context("open remote fs")?;
    let partitions = alto::reservoir::enumerate_partitions(&remote_fs, "default", "tap-x").await.context("enumerate partitions")?;
    assert_eq!(partitions.len(), 2);

    Ok(())
}
