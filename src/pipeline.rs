//! Pipeline Runner: spawn a tap into a target (or a reservoir writer),
//! intercepting STATE along the way.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::{error::AltoError, state::StateCapture};

/// One resolved process invocation: executable, arguments, environment, and
/// working directory, as produced by Config Projection.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

fn spawn(invocation: &Invocation, stdin: Stdio, stdout: Stdio, stderr: Stdio) -> Result<Child> {
    let mut cmd = Command::new(&invocation.executable);
    cmd.args(&invocation.args);
    cmd.envs(&invocation.env);
    if let Some(dir) = &invocation.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(stdin).stdout(stdout).stderr(stderr);
    cmd.spawn().with_context(|| format!("spawn {:?}", invocation.executable))
}

/// Fields subject to inline PII hashing, identified by stream name.
pub type PiiFields = BTreeSet<(String, String)>;

/// Replace every PII field on a RECORD message with a stable, project-salted
/// hex digest. Any line that doesn't parse as a RECORD on a marked stream (or
/// has no marked fields) passes through byte-identical.
fn hash_record_fields(line: &str, stream_fields: &[&str], salt: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(line) else {
        return line.to_string();
    };
    let Some(record) = value.get_mut("record").and_then(serde_json::Value::as_object_mut) else {
        return line.to_string();
    };

    let mut touched = false;
    for field in stream_fields {
        if let Some(existing) = record.get(*field) {
            if !existing.is_null() {
                let input = existing.as_str().map(str::to_string).unwrap_or_else(|| existing.to_string());
                record.insert((*field).to_string(), serde_json::Value::String(pii_hash(salt, &input)));
                touched = true;
            }
        }
    }

    if touched { value.to_string() } else { line.to_string() }
}

/// Stable 64-hex digest of `value`, salted per-project so the same input
/// always produces the same output within one project.
pub fn pii_hash(salt: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Transform one line of the tap's output per the PII field set.
fn transform_line(line: &str, pii: &PiiFields, salt: &str) -> String {
    let Some(header) = crate::singer::parse_line(line) else { return line.to_string() };
    if header.kind != crate::singer::MessageType::Record {
        return line.to_string();
    }
    let Some(stream) = header.stream.as_deref() else { return line.to_string() };

    let fields: Vec<&str> = pii
        .iter()
        .filter(|(s, _)| s == stream)
        .map(|(_, field)| field.as_str())
        .collect();
    if fields.is_empty() {
        return line.to_string();
    }
    hash_record_fields(line, &fields, salt)
}

/// Outcome of a tap→target pipeline run: the final captured state, if the
/// target emitted any STATE lines.
pub struct PipelineOutcome {
    pub final_state: Option<serde_json::Value>,
}

/// Run `tap -> target`, applying PII hashing inline and capturing STATE from
/// the target's stdout. `grace_period` bounds how long the tap/target are
/// given to exit cleanly after cancellation before being force-killed.
#[instrument(skip(tap, target, stream_map, pii, cancel))]
pub async fn run(
    tap: &Invocation,
    target: &Invocation,
    stream_map: Option<&Invocation>,
    pii: &PiiFields,
    salt: &str,
    tap_log: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
    target_log: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
    stream_map_log: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
    cancel: CancellationToken,
    grace_period: Duration,
) -> Result<PipelineOutcome> {
    let mut tap_child = spawn(tap, Stdio::null(), Stdio::piped(), Stdio::piped())?;
    let mut target_child = spawn(target, Stdio::piped(), Stdio::piped(), Stdio::piped())?;

    let tap_stdout = tap_child.stdout.take().expect("tap stdout piped");
    let tap_stderr = tap_child.stderr.take().expect("tap stderr piped");
    let target_stdin = target_child.stdin.take().expect("target stdin piped");
    let target_stdout = target_child.stdout.take().expect("target stdout piped");
    let target_stderr = target_child.stderr.take().expect("target stderr piped");

    // The stream-map script, if declared, is a long-lived filter spliced
    // between the PII transformer and the target: T writes into its stdin,
    // its stdout is forwarded verbatim into the target's stdin. It is never
    // restarted mid-pipeline.
    let (mut stream_map_child, sink_stdin) = match stream_map {
        Some(invocation) => {
            let mut child = spawn(invocation, Stdio::piped(), Stdio::piped(), Stdio::piped())?;
            let sm_stdin = child.stdin.take().expect("stream-map stdin piped");
            let sm_stdout = child.stdout.take().expect("stream-map stdout piped");
            let sm_stderr = child.stderr.take().expect("stream-map stderr piped");
            tokio::spawn(drain_stderr(sm_stderr, stream_map_log));

            let mut target_stdin = target_stdin;
            tokio::spawn(async move {
                let mut lines = BufReader::new(sm_stdout).lines();
                while let Some(line) = lines.next_line().await.context("read stream-map stdout")? {
                    target_stdin.write_all(line.as_bytes()).await.context("write target stdin")?;
                    target_stdin.write_all(b"\n").await.context("write target stdin")?;
                }
                target_stdin.shutdown().await.context("close target stdin")?;
                Ok::<_, color_eyre::Report>(())
            });
            (Some(child), sm_stdin)
        }
        None => (None, target_stdin),
    };

    let pii = pii.clone();
    let salt = salt.to_string();
    let mut sink_stdin = sink_stdin;
    let copy_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tap_stdout).lines();
        while let Some(line) = lines.next_line().await.context("read tap stdout")? {
            let transformed = transform_line(&line, &pii, &salt);
            sink_stdin.write_all(transformed.as_bytes()).await.context("write pipeline sink")?;
            sink_stdin.write_all(b"\n").await.context("write pipeline sink")?;
        }
        sink_stdin.shutdown().await.context("close pipeline sink")?;
        Ok::<_, color_eyre::Report>(())
    });

    let state_task = tokio::spawn(async move {
        let mut capture = StateCapture::new();
        let mut lines = BufReader::new(target_stdout).lines();
        while let Some(line) = lines.next_line().await.context("read target stdout")? {
            capture.observe_line(&line);
        }
        Ok::<_, color_eyre::Report>(capture.into_value())
    });

    tokio::spawn(drain_stderr(tap_stderr, tap_log));
    tokio::spawn(drain_stderr(target_stderr, target_log));

    let tap_status = tokio::select! {
        status = tap_child.wait() => status.context("wait for tap")?,
        _ = cancel.cancelled() => {
            terminate(&mut tap_child, grace_period).await;
            return Err(AltoError::PipelineFailure {
                tap: format!("{:?}", tap.executable),
                target: format!("{:?}", target.executable),
                message: "cancelled before tap exited".to_string(),
            }
            .into());
        }
    };
    copy_task.await.context("join copy task")??;

    if let Some(child) = stream_map_child.as_mut() {
        let status = child.wait().await.context("wait for stream-map")?;
        if !status.success() {
            return Err(AltoError::PipelineFailure {
                tap: format!("{:?}", tap.executable),
                target: format!("{:?}", target.executable),
                message: format!("stream-map exited {status}"),
            }
            .into());
        }
    }

    let target_status = tokio::select! {
        status = target_child.wait() => status.context("wait for target")?,
        _ = cancel.cancelled() => {
            terminate(&mut target_child, grace_period).await;
            return Err(AltoError::PipelineFailure {
                tap: format!("{:?}", tap.executable),
                target: format!("{:?}", target.executable),
                message: "cancelled before target exited".to_string(),
            }
            .into());
        }
    };
    let final_state = state_task.await.context("join state task")??;

    if !tap_status.success() || !target_status.success() {
        return Err(AltoError::PipelineFailure {
            tap: format!("{:?}", tap.executable),
            target: format!("{:?}", target.executable),
            message: format!("tap exited {tap_status}, target exited {target_status}"),
        }
        .into());
    }

    Ok(PipelineOutcome { final_state })
}

/// Spawn `invocation` alone and capture its stdout in full, rather than
/// streaming it line by line: discovery (`--discover`) and capability probes
/// (`--about`, `--test`) each produce one JSON document, not an NDJSON
/// stream, so there's no STATE to intercept and nothing to pipe onward.
#[instrument(skip(invocation, log))]
pub async fn run_capture_stdout(
    invocation: &Invocation,
    log: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
) -> Result<(std::process::ExitStatus, Vec<u8>)> {
    let mut child = spawn(invocation, Stdio::null(), Stdio::piped(), Stdio::piped())?;
    let mut stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    tokio::spawn(drain_stderr(stderr, log));

    let mut bytes = Vec::new();
    stdout.read_to_end(&mut bytes).await.context("read stdout")?;
    let status = child.wait().await.context("wait for process")?;
    Ok((status, bytes))
}

/// Run a tap alone, substituting the reservoir for process `B`: group
/// its output by stream and hand each stream's lines to
/// [`crate::reservoir::write_partition`] under one timestamp for this run.
#[instrument(skip(fs, tap, tap_log, written_at))]
pub async fn run_to_reservoir(
    fs: &impl crate::fs::FsHandle,
    tap: &Invocation,
    env: &str,
    tap_name: &str,
    written_at: &str,
    tap_log: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
) -> Result<()> {
    let mut tap_child = spawn(tap, Stdio::null(), Stdio::piped(), Stdio::piped())?;
    let tap_stdout = tap_child.stdout.take().expect("tap stdout piped");
    let tap_stderr = tap_child.stderr.take().expect("tap stderr piped");
    tokio::spawn(drain_stderr(tap_stderr, tap_log));

    let mut by_stream: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut schemas: BTreeMap<String, serde_json::Value> = BTreeMap::new();

    let mut lines = BufReader::new(tap_stdout).lines();
    while let Some(line) = lines.next_line().await.context("read tap stdout")? {
        let Some(header) = crate::singer::parse_line(&line) else { continue };
        let Some(stream) = header.stream.clone() else { continue };
        match header.kind {
            crate::singer::MessageType::Schema => {
                if let Ok(full) = serde_json::from_str::<serde_json::Value>(&line) {
                    if let Some(schema) = full.get("schema") {
                        schemas.insert(stream, schema.clone());
                    }
                }
            }
            crate::singer::MessageType::Record => {
                by_stream.entry(stream).or_default().push(line);
            }
            _ => {}
        }
    }

    let status = tap_child.wait().await.context("wait for tap")?;
    if !status.success() {
        return Err(AltoError::PipelineFailure {
            tap: format!("{:?}", tap.executable),
            target: "reservoir".to_string(),
            message: format!("tap exited {status}"),
        }
        .into());
    }

    for (stream, lines) in by_stream {
        let schema = schemas.get(&stream).cloned().unwrap_or(serde_json::Value::Null);
        crate::reservoir::write_partition(fs, env, tap_name, &stream, &schema, written_at, &lines).await?;
    }

    Ok(())
}

/// Replay a tap's reservoir into `target`, grouped by schema fingerprint:
/// each group's partitions are concatenated in write-time order.
/// Groups run one at a time unless `parallel` is set, which is only safe for
/// a target declared idempotent by configuration.
#[instrument(skip(fs, target, target_log))]
pub async fn run_from_reservoir<L>(
    fs: &impl crate::fs::FsHandle,
    env: &str,
    tap_name: &str,
    target: &Invocation,
    target_log: impl Fn() -> L + Send + Sync,
    parallel: bool,
) -> Result<Vec<PipelineOutcome>>
where
    L: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let partitions = crate::reservoir::enumerate_partitions(fs, env, tap_name).await?;

    let mut groups: BTreeMap<String, Vec<&crate::reservoir::ReplayPartition>> = BTreeMap::new();
    for partition in &partitions {
        groups.entry(partition.schema_fp.clone()).or_default().push(partition);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.written_at.cmp(&b.written_at));
    }

    if parallel {
        let futures = groups
            .into_values()
            .map(|group| replay_group(fs, target, group, target_log()));
        futures::future::try_join_all(futures).await
    } else {
        let mut outcomes = Vec::new();
        for group in groups.into_values() {
            outcomes.push(replay_group(fs, target, group, target_log()).await?);
        }
        Ok(outcomes)
    }
}

async fn replay_group<L>(
    fs: &impl crate::fs::FsHandle,
    target: &Invocation,
    group: Vec<&crate::reservoir::ReplayPartition>,
    target_log: L,
) -> Result<PipelineOutcome>
where
    L: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = Vec::new();
    for partition in group {
        lines.extend(crate::reservoir::read_partition(fs, partition).await?);
    }
    replay_lines_to_target(target, &lines, target_log).await
}

async fn replay_lines_to_target(
    target: &Invocation,
    lines: &[String],
    target_log: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
) -> Result<PipelineOutcome> {
    let mut target_child = spawn(target, Stdio::piped(), Stdio::piped(), Stdio::piped())?;
    let mut target_stdin = target_child.stdin.take().expect("target stdin piped");
    let target_stdout = target_child.stdout.take().expect("target stdout piped");
    let target_stderr = target_child.stderr.take().expect("target stderr piped");
    tokio::spawn(drain_stderr(target_stderr, target_log));

    for line in lines {
        target_stdin.write_all(line.as_bytes()).await.context("write target stdin")?;
        target_stdin.write_all(b"\n").await.context("write target stdin")?;
    }
    target_stdin.shutdown().await.context("close target stdin")?;
    drop(target_stdin);

    let mut capture = StateCapture::new();
    let mut stdout_lines = BufReader::new(target_stdout).lines();
    while let Some(line) = stdout_lines.next_line().await.context("read target stdout")? {
        capture.observe_line(&line);
    }

    let status = target_child.wait().await.context("wait for target")?;
    if !status.success() {
        return Err(AltoError::PipelineFailure {
            tap: "reservoir".to_string(),
            target: format!("{:?}", target.executable),
            message: format!("target exited {status}"),
        }
        .into());
    }

    Ok(PipelineOutcome { final_state: capture.into_value() })
}

async fn drain_stderr(stderr: impl tokio::io::AsyncRead + Unpin, mut log: impl tokio::io::AsyncWrite + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if log.write_all(line.as_bytes()).await.is_err() || log.write_all(b"\n").await.is_err() {
                    warn!("failed writing pipeline stderr log");
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(%err, "error reading pipeline stderr");
                return;
            }
        }
    }
}

/// Send a termination request and wait up to `grace_period` before force-
/// killing (the tap gets this treatment first, then the target, per the
/// cancellation ordering invariant — callers invoke this once per process).
async fn terminate(child: &mut Child, grace_period: Duration) {
    #[cfg(unix)]
    if let Some(id) = child.id() {
        // SAFETY: `id` is this child's own pid, valid for the duration of
        // this call; SIGTERM asks it to exit cleanly before the kill below.
        unsafe {
            libc::kill(id as libc::pid_t, libc::SIGTERM);
        }
    }

    if tokio::time::timeout(grace_period, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}
