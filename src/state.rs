//! State Store: the active-state path convention, STATE-line capture during
//! a pipeline run, and rotate-then-atomic-write on success only.

use color_eyre::{Result, eyre::Context};
use serde_json::Value as Json;
use tracing::instrument;

use crate::{error::AltoError, fs::FsHandle, singer};

/// The active-state object path for a `(tap, target)` pair in an environment.
pub fn active_path(env: &str, tap: &str, target: &str) -> String {
    format!("state/{env}/{tap}-to-{target}.json")
}

fn historical_path(env: &str, tap: &str, target: &str, rotated_at: &str) -> String {
    format!("state/{env}/{tap}-to-{target}.{rotated_at}.json")
}

/// Load the active state document, if any. A present-but-unparseable
/// document is a [`AltoError::StateCorruption`], not a missing-state
/// full-refresh signal.
#[instrument(skip(fs))]
pub async fn load_active(
    fs: &impl FsHandle,
    env: &str,
    tap: &str,
    target: &str,
) -> Result<Option<Json>> {
    let path = active_path(env, tap, target);
    let Some(bytes) = fs.get(&path).await? else {
        return Ok(None);
    };
    let value: Json = serde_json::from_slice(&bytes).map_err(|err| AltoError::StateCorruption {
        path: path.clone().into(),
        message: err.to_string(),
    })?;
    Ok(Some(value))
}

/// Scans target stdout line-by-line for STATE messages, retaining the `value`
/// of the last one successfully parsed. Lines that aren't valid STATE
/// messages are silently skipped — they're either other message types
/// passing through, or partial/garbled output the target will correct on its
/// next line.
#[derive(Default, Debug)]
pub struct StateCapture {
    last_value: Option<Json>,
}

impl StateCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of the target's stdout. Returns `true` if this line
    /// updated the captured state.
    pub fn observe_line(&mut self, line: &str) -> bool {
        match singer::parse_line(line) {
            Some(header) if header.kind == singer::MessageType::State => {
                if let Some(value) = header.value {
                    self.last_value = Some(value);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    pub fn into_value(self) -> Option<Json> {
        self.last_value
    }
}

/// Commit a captured state as the new active state, rotating any existing
/// active state to a historical snapshot first. Only called after a
/// successful pipeline run — callers must not invoke this on failure.
#[instrument(skip(fs, new_state))]
pub async fn commit(
    fs: &impl FsHandle,
    env: &str,
    tap: &str,
    target: &str,
    new_state: &Json,
    rotated_at: &str,
) -> Result<()> {
    let active = active_path(env, tap, target);

    if let Some(existing) = fs.get(&active).await? {
        let historical = historical_path(env, tap, target, rotated_at);
        fs.put(&historical, &existing)
            .await
            .with_context(|| format!("rotate prior active state to {historical}"))?;
    }

    let bytes = serde_json::to_vec_pretty(new_state).context("serialize new active state")?;
    let tmp = format!("{active}.tmp");
    fs.put(&tmp, &bytes).await.with_context(|| format!("stage new active state at {tmp}"))?;
    fs.rename(&tmp, &active)
        .await
        .with_context(|| format!("commit new active state to {active}"))?;
    Ok(())
}
