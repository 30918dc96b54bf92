//! Stable content fingerprinting.
//!
//! A [`Fingerprint`] is the one vetted 40-hex-digit identity primitive used
//! everywhere the design calls for a stable, cross-machine digest: plugin
//! identity (`plugin_fingerprint`), task up-to-dateness (`task_fingerprint`),
//! and reservoir partition schema keys. Having a single implementation means
//! there's one place that has to get "stable under map reordering" right.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::config::ConfigValue;

/// A 40-hex-digit stable digest.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    /// Hash arbitrary canonical bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Hash the concatenation of several canonical fragments, each
    /// length-prefixed so that `["ab", "c"]` and `["a", "bc"]` never collide.
    pub fn of_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut hasher = Sha1::new();
        for part in parts {
            let part = part.as_ref();
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.as_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// Canonicalize a [`ConfigValue`] tree into a byte string that is stable
/// regardless of map key insertion order: maps are sorted by key, and every
/// value is length-prefixed.
///
/// This is the core of fingerprint stability (design invariant P1): Rust's
/// `HashMap`/insertion order never leaks into the digest because the
/// representation we hash is `BTreeMap`-sorted.
pub fn canonicalize(value: &ConfigValue) -> Vec<u8> {
    let mut out = Vec::new();
    canonicalize_into(value, &mut out);
    out
}

fn canonicalize_into(value: &ConfigValue, out: &mut Vec<u8>) {
    match value {
        ConfigValue::Null => out.push(0),
        ConfigValue::Bool(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        ConfigValue::Number(n) => {
            out.push(2);
            out.extend_from_slice(&n.to_bits().to_le_bytes());
        }
        ConfigValue::String(s) => {
            out.push(3);
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        ConfigValue::Seq(items) => {
            out.push(4);
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                canonicalize_into(item, out);
            }
        }
        ConfigValue::Map(map) => {
            out.push(5);
            // BTreeMap already iterates in sorted key order, which is what
            // gives us insertion-order independence.
            let sorted: BTreeMap<&String, &ConfigValue> = map.iter().collect();
            out.extend_from_slice(&(sorted.len() as u64).to_le_bytes());
            for (key, value) in sorted {
                out.extend_from_slice(&(key.len() as u64).to_le_bytes());
                out.extend_from_slice(key.as_bytes());
                canonicalize_into(value, out);
            }
        }
    }
}

/// Inputs to a plugin artifact's identity, per the data model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PluginFingerprintInputs<'a> {
    pub install_url: &'a str,
    /// Either the entrypoint or the executable name, whichever is declared
    /// as the build target.
    pub executable_or_entrypoint: &'a str,
    pub interpreter_major_minor: &'a str,
    pub arch_tag: &'a str,
}

/// Compute the 40-hex plugin artifact fingerprint.
pub fn plugin_fingerprint(inputs: PluginFingerprintInputs<'_>) -> Fingerprint {
    Fingerprint::of_parts([
        inputs.install_url,
        inputs.executable_or_entrypoint,
        inputs.interpreter_major_minor,
        inputs.arch_tag,
    ])
}

/// One declared input to a task: either the content of a file, or a scalar
/// parameter that participates in the task's identity without being a file.
#[derive(Clone, Debug)]
pub enum TaskInput {
    FileContent(Vec<u8>),
    Scalar(String),
}

/// Compute the 40-hex task fingerprint over its declared inputs, per the
/// order the caller provides (declaration order is significant: inputs are
/// declared, not discovered, so there is no reordering concern for this
/// function specifically — `canonicalize` is what handles map-shaped data
/// upstream of this call).
pub fn task_fingerprint<'a, I>(inputs: I) -> Fingerprint
where
    I: IntoIterator<Item = &'a TaskInput>,
{
    let mut hasher = Sha1::new();
    for input in inputs {
        match input {
            TaskInput::FileContent(bytes) => {
                hasher.update(b"file:");
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(bytes);
            }
            TaskInput::Scalar(value) => {
                hasher.update(b"scalar:");
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value.as_bytes());
            }
        }
    }
    Fingerprint(hasher.finalize().into())
}
