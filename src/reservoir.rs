//! Reservoir: a content-addressed, stream+schema-partitioned archive that
//! decouples extraction from loading.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use color_eyre::{Result, eyre::Context};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::task::spawn_blocking;
use tracing::instrument;

use crate::{config::ConfigValue, fingerprint::Fingerprint, fs::FsHandle};

/// One partition's entry in a stream's index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub key: String,
    pub count: usize,
    pub written_at: String,
}

/// `_reservoir.json`: stream name → partitions written so far, in write order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservoirIndex {
    #[serde(flatten)]
    pub streams: BTreeMap<String, Vec<PartitionEntry>>,
}

fn index_path(env: &str, tap: &str) -> String {
    format!("reservoir/{env}/{tap}/_reservoir.json")
}

fn partition_path(env: &str, tap: &str, stream: &str, schema_fp: Fingerprint, written_at: &str) -> String {
    format!("reservoir/{env}/{tap}/{stream}/{}/{written_at}.singer.gz", schema_fp.as_hex())
}

/// Partition key: a hash over the stream name and its schema, so a schema
/// change is a new partition and prior data stays replayable under its own
/// schema.
pub fn partition_key(stream: &str, schema: &Json) -> Fingerprint {
    let canonical = crate::fingerprint::canonicalize(&ConfigValue::from_json(schema));
    Fingerprint::of_parts([stream.as_bytes(), &canonical])
}

#[instrument(skip(fs))]
async fn load_index(fs: &impl FsHandle, env: &str, tap: &str) -> Result<ReservoirIndex> {
    match fs.get(&index_path(env, tap)).await? {
        Some(bytes) => serde_json::from_slice(&bytes).context("parse reservoir index"),
        None => Ok(ReservoirIndex::default()),
    }
}

#[instrument(skip(fs, index))]
async fn store_index(fs: &impl FsHandle, env: &str, tap: &str, index: &ReservoirIndex) -> Result<()> {
    let path = index_path(env, tap);
    let tmp = format!("{path}.tmp");
    let bytes = serde_json::to_vec_pretty(index).context("serialize reservoir index")?;
    fs.put(&tmp, &bytes).await.with_context(|| format!("stage reservoir index at {tmp}"))?;
    fs.rename(&tmp, &path).await.with_context(|| format!("commit reservoir index to {path}"))?;
    Ok(())
}

/// Append one partition of Singer-message lines for `stream`, gzip-compress
/// it, and atomically record it in the index. `lines` must be the raw NDJSON
/// lines as emitted by the tap for this stream, in emission order — the
/// reservoir never rewrites them.
#[instrument(skip(fs, lines))]
pub async fn write_partition(
    fs: &impl FsHandle,
    env: &str,
    tap: &str,
    stream: &str,
    schema: &Json,
    written_at: &str,
    lines: &[String],
) -> Result<()> {
    let schema_fp = partition_key(stream, schema);
    let path = partition_path(env, tap, stream, schema_fp, written_at);

    let file = fs.open_write(&path).await.with_context(|| format!("open reservoir partition {path} for writing"))?;
    let lines = lines.to_vec();
    spawn_blocking(move || -> Result<()> {
        let file = file.try_into_std().map_err(|_| color_eyre::eyre::eyre!("reservoir partition file has in-flight async operations"))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        for line in &lines {
            encoder.write_all(line.as_bytes()).context("write reservoir partition")?;
            encoder.write_all(b"\n").context("write reservoir partition")?;
        }
        encoder.finish().context("finish reservoir partition gzip stream")?;
        Ok(())
    })
    .await
    .context("join reservoir partition writer task")??;

    let mut index = load_index(fs, env, tap).await?;
    index.streams.entry(stream.to_string()).or_default().push(PartitionEntry {
        key: schema_fp.as_hex(),
        count: lines.len(),
        written_at: written_at.to_string(),
    });
    store_index(fs, env, tap, &index).await?;
    Ok(())
}

/// One previously written partition, ready for replay.
pub struct ReplayPartition {
    pub stream: String,
    pub schema_fp: String,
    pub written_at: String,
    path: String,
}

/// Enumerate all partitions for `tap` across every stream, in write-time
/// order (the order partitions were appended to the index).
#[instrument(skip(fs))]
pub async fn enumerate_partitions(fs: &impl FsHandle, env: &str, tap: &str) -> Result<Vec<ReplayPartition>> {
    let index = load_index(fs, env, tap).await?;
    let mut partitions = Vec::new();
    for (stream, entries) in &index.streams {
        for entry in entries {
            partitions.push(ReplayPartition {
                stream: stream.clone(),
                schema_fp: entry.key.clone(),
                written_at: entry.written_at.clone(),
                path: format!("reservoir/{env}/{tap}/{stream}/{}/{}.singer.gz", entry.key, entry.written_at),
            });
        }
    }
    partitions.sort_by(|a, b| a.written_at.cmp(&b.written_at));
    Ok(partitions)
}

/// Decompress a partition back into its original NDJSON lines, in the order
/// they were written.
#[instrument(skip(fs, partition))]
pub async fn read_partition(fs: &impl FsHandle, partition: &ReplayPartition) -> Result<Vec<String>> {
    let file = fs
        .open_read(&partition.path)
        .await
        .with_context(|| format!("reservoir partition {} is indexed but missing", partition.path))?;

    let text = spawn_blocking(move || -> Result<String> {
        let file = file.try_into_std().map_err(|_| color_eyre::eyre::eyre!("reservoir partition file has in-flight async operations"))?;
        let mut decoder = GzDecoder::new(file);
        let mut text = String::new();
        decoder.read_to_string(&mut text).context("decompress reservoir partition")?;
        Ok(text)
    })
    .await
    .context("join reservoir partition reader task")??;

    Ok(text.lines().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;

    fn schema(kind: &str) -> Json {
        serde_json::json!({"properties": {"id": {"type": kind}}})
    }

    #[tokio::test]
    async fn written_partitions_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::open(dir.path()).await.unwrap();

        let orders = schema("string");
        write_partition(
            &fs,
            "prod",
            "tap-x",
            "orders",
            &orders,
            "20240101000000000000",
            &[r#"{"type":"RECORD","stream":"orders","record":{"id":"1"}}"#.to_string()],
        )
        .await
        .unwrap();
        write_partition(
            &fs,
            "prod",
            "tap-x",
            "orders",
            &orders,
            "20240101000001000000",
            &[r#"{"type":"RECORD","stream":"orders","record":{"id":"2"}}"#.to_string()],
        )
        .await
        .unwrap();

        let partitions = enumerate_partitions(&fs, "prod", "tap-x").await.unwrap();
        assert_eq!(partitions.len(), 2);

        let first = read_partition(&fs, &partitions[0]).await.unwrap();
        assert_eq!(first, vec![r#"{"type":"RECORD","stream":"orders","record":{"id":"1"}}"#.to_string()]);
    }

    #[tokio::test]
    async fn schema_change_yields_new_partition_key() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::open(dir.path()).await.unwrap();

        write_partition(&fs, "prod", "tap-x", "orders", &schema("string"), "20240101000000000000", &[]).await.unwrap();
        write_partition(&fs, "prod", "tap-x", "orders", &schema("integer"), "20240101000001000000", &[]).await.unwrap();

        let partitions = enumerate_partitions(&fs, "prod", "tap-x").await.unwrap();
        assert_ne!(partitions[0].schema_fp, partitions[1].schema_fp);
    }

    #[tokio::test]
    async fn existing_partitions_are_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::open(dir.path()).await.unwrap();

        write_partition(
            &fs,
            "prod",
            "tap-x",
            "orders",
            &schema("string"),
            "20240101000000000000",
            &["a".to_string()],
        )
        .await
        .unwrap();
        let before = fs.list("reservoir/prod/tap-x/orders").await.unwrap();

        write_partition(
            &fs,
            "prod",
            "tap-x",
            "customers",
            &schema("string"),
            "20240101000001000000",
            &["b".to_string()],
        )
        .await
        .unwrap();

        for path in &before {
            assert!(fs.exists(path).await.unwrap());
        }
    }
}
