//! The typed error taxonomy used across `alto`.
//!
//! Subsystems return [`color_eyre::Result`] at their public boundary so that
//! callers get rich, chained context via [`color_eyre::eyre::Context`], but
//! internally they raise one of the variants below so that a caller which
//! cares can recover the classification with `downcast_ref::<AltoError>()`
//! instead of matching on rendered strings.

use std::path::PathBuf;

use thiserror::Error;

/// The error taxonomy from the design's error handling section.
#[derive(Debug, Clone, Error)]
pub enum AltoError {
    /// An invalid reference, an unresolvable `inherit_from`, or a missing
    /// required field in a plugin or pipeline declaration.
    #[error("config error at `{key_path}`: {message}")]
    Config { key_path: String, message: String },

    /// The packager invoked to build a plugin artifact exited non-zero.
    #[error("build failed for plugin `{plugin}`: {message}")]
    BuildFailure {
        plugin: String,
        message: String,
        /// Captured installer output, preserved for the caller's log file.
        log: String,
    },

    /// Tap discovery exited non-zero or produced no output.
    #[error("discovery failed for tap `{tap}`: {message}")]
    DiscoveryFailure { tap: String, message: String },

    /// The tap, target, or transformer in a pipeline exited non-zero, or a
    /// pipe between them broke.
    #[error("pipeline `{tap}:{target}` failed: {message}")]
    PipelineFailure {
        tap: String,
        target: String,
        message: String,
    },

    /// The active state file exists but does not parse as JSON.
    #[error("state at `{path}` is corrupt: {message}")]
    StateCorruption { path: PathBuf, message: String },

    /// A remote filesystem operation failed after exhausting retries.
    #[error("remote unavailable at `{path}` after {attempts} attempts: {message}")]
    RemoteUnavailable {
        path: String,
        attempts: u32,
        message: String,
    },
}

/// Recover the typed classification from a `color_eyre::Result`'s error if
/// it carries one; otherwise build a fallback variant from the rendered
/// error chain. Task bodies need `AltoError` specifically (not an arbitrary
/// report) at their boundary with the task engine.
pub fn classify<T>(result: color_eyre::Result<T>, fallback: impl FnOnce(String) -> AltoError) -> Result<T, AltoError> {
    result.map_err(|report| match report.downcast_ref::<AltoError>() {
        Some(err) => err.clone(),
        None => fallback(format!("{report:#}")),
    })
}
