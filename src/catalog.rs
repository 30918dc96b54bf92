//! Catalog Engine: base-catalog discovery/caching and the runtime-catalog
//! selection/metadata pipeline.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::{Result, eyre::Context};
use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::instrument;

use crate::{error::AltoError, fs::FsHandle};

/// One `{breadcrumb, metadata}` entry in a stream's `metadata` array.
/// `breadcrumb: []` is the stream-level entry; `breadcrumb: ["properties", p]`
/// scopes a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub breadcrumb: Vec<String>,
    pub metadata: Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub tap_stream_name: String,
    pub schema: Json,
    pub metadata: Vec<MetadataEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<Stream>,
}

fn base_catalog_path(tap: &str) -> String {
    format!("catalogs/{tap}.base.json")
}

/// Fetch the cached base catalog for `tap`, if discovery has already run.
#[instrument(skip(fs))]
pub async fn load_base(fs: &impl FsHandle, tap: &str) -> Result<Option<Catalog>> {
    let Some(bytes) = fs.get(&base_catalog_path(tap)).await? else {
        return Ok(None);
    };
    let catalog = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse cached base catalog for `{tap}`"))?;
    Ok(Some(catalog))
}

/// Record `raw_discovery_output` (the tap's `--discover` stdout, verbatim
/// bytes) as the cached base catalog for `tap`. Discovery failure (non-zero
/// exit or unparseable/empty output) must be reported by the caller as
/// [`AltoError::DiscoveryFailure`] *before* calling this — the cache is never
/// written on a failed discovery.
#[instrument(skip(fs, raw_discovery_output))]
pub async fn store_base(fs: &impl FsHandle, tap: &str, raw_discovery_output: &[u8]) -> Result<Catalog> {
    let catalog: Catalog = serde_json::from_slice(raw_discovery_output).map_err(|err| AltoError::DiscoveryFailure {
        tap: tap.to_string(),
        message: format!("discovery output did not parse as a catalog: {err}"),
    })?;
    fs.put(&base_catalog_path(tap), raw_discovery_output).await?;
    Ok(catalog)
}

/// Leading modifier on a selection pattern.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum PatternMode {
    Select,
    Exclude,
    SelectAndHash,
}

struct ParsedPattern {
    mode: PatternMode,
    stream_glob: Glob,
    prop_glob: Glob,
    /// Length of the literal (non-wildcard) prefix of `stream.prop`, used to
    /// break ties between overlapping patterns: the more specific pattern
    /// wins.
    specificity: usize,
}

fn literal_prefix_len(pattern: &str) -> usize {
    pattern.chars().take_while(|c| !matches!(c, '*' | '?' | '[')).count()
}

fn parse_pattern(raw: &str) -> Result<ParsedPattern> {
    let mut rest = raw;
    let mode = if let Some(stripped) = rest.strip_prefix('!') {
        rest = stripped;
        PatternMode::Exclude
    } else if let Some(stripped) = rest.strip_prefix('~') {
        rest = stripped;
        PatternMode::SelectAndHash
    } else {
        PatternMode::Select
    };

    let (stream_part, prop_part) = rest
        .split_once('.')
        .ok_or_else(|| color_eyre::eyre::eyre!("selection pattern `{raw}` is missing its `<stream>.<prop>` separator"))?;

    Ok(ParsedPattern {
        mode,
        stream_glob: Glob::new(stream_part).with_context(|| format!("invalid stream glob in `{raw}`"))?,
        prop_glob: Glob::new(prop_part).with_context(|| format!("invalid property glob in `{raw}`"))?,
        specificity: literal_prefix_len(stream_part) + literal_prefix_len(prop_part),
    })
}

/// The outcome of selection-pattern evaluation: is `stream.prop` selected,
/// and should it additionally be PII-hashed?
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
struct Decision {
    selected: bool,
    hash: bool,
}

fn evaluate(patterns: &[ParsedPattern], stream: &str, prop: &str) -> Decision {
    let mut best: Option<(usize, Decision)> = None;
    let mut excluded = false;

    for pattern in patterns {
        if !pattern.stream_glob.compile_matcher().is_match(stream) || !pattern.prop_glob.compile_matcher().is_match(prop) {
            continue;
        }
        match pattern.mode {
            PatternMode::Exclude => excluded = true,
            PatternMode::Select => {
                if best.is_none_or(|(spec, _)| pattern.specificity >= spec) {
                    best = Some((pattern.specificity, Decision { selected: true, hash: false }));
                }
            }
            PatternMode::SelectAndHash => {
                if best.is_none_or(|(spec, _)| pattern.specificity >= spec) {
                    best = Some((pattern.specificity, Decision { selected: true, hash: true }));
                }
            }
        }
    }

    let mut decision = best.map(|(_, d)| d).unwrap_or_default();
    if excluded {
        decision.selected = false;
    }
    decision
}

fn field_names(schema: &Json) -> Vec<String> {
    schema
        .get("properties")
        .and_then(Json::as_object)
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default()
}

fn set_metadata(entries: &mut Vec<MetadataEntry>, breadcrumb: Vec<String>, key: &str, value: Json) {
    if let Some(entry) = entries.iter_mut().find(|e| e.breadcrumb == breadcrumb) {
        entry.metadata.as_object_mut().expect("metadata is always an object").insert(key.to_string(), value);
        return;
    }
    let mut metadata = serde_json::Map::new();
    metadata.insert(key.to_string(), value);
    entries.push(MetadataEntry { breadcrumb, metadata: Json::Object(metadata) });
}

fn merge_metadata(entries: &mut Vec<MetadataEntry>, breadcrumb: Vec<String>, overlay: &Json) {
    let Some(overlay_map) = overlay.as_object() else { return };
    if let Some(entry) = entries.iter_mut().find(|e| e.breadcrumb == breadcrumb) {
        let existing = entry.metadata.as_object_mut().expect("metadata is always an object");
        for (key, value) in overlay_map {
            existing.insert(key.clone(), value.clone());
        }
        return;
    }
    entries.push(MetadataEntry { breadcrumb, metadata: overlay.clone() });
}

/// The set of PII-marked `(stream, field)` pairs produced by runtime-catalog
/// computation, handed to the pipeline runner for inline hashing.
pub type PiiFields = BTreeSet<(String, String)>;

/// Compute the runtime catalog from the base catalog, selection patterns,
/// and metadata overlays: selection first, then metadata overlay
/// application, with the more specific pattern winning ties.
#[instrument(skip(base, select, metadata_overlays))]
pub fn compute_runtime(
    base: &Catalog,
    select: &[String],
    metadata_overlays: &[(String, Json)],
) -> Result<(Catalog, PiiFields)> {
    let patterns = select.iter().map(|p| parse_pattern(p)).collect::<Result<Vec<_>>>()?;
    let stream_patterns: Vec<Glob> = metadata_overlays
        .iter()
        .map(|(pattern, _)| Glob::new(pattern).with_context(|| format!("invalid metadata glob `{pattern}`")))
        .collect::<Result<_>>()?;

    let mut runtime = base.clone();
    let mut pii = PiiFields::new();

    for stream in &mut runtime.streams {
        let stream_name = stream.tap_stream_name.clone();
        let fields = field_names(&stream.schema);

        // Step 2: selection scoreboard, stream-level and per-field.
        let stream_decision = evaluate(&patterns, &stream_name, "*");
        let any_field_selected = fields.iter().any(|f| evaluate(&patterns, &stream_name, f).selected);
        let stream_selected = stream_decision.selected || any_field_selected;
        set_metadata(&mut stream.metadata, Vec::new(), "selected", Json::Bool(stream_selected));

        for field in &fields {
            let decision = evaluate(&patterns, &stream_name, field);
            let breadcrumb = vec!["properties".to_string(), field.clone()];
            set_metadata(&mut stream.metadata, breadcrumb, "selected", Json::Bool(decision.selected));
            if decision.selected && decision.hash {
                pii.insert((stream_name.clone(), field.clone()));
            }
        }

        // Step 3: metadata overlays, applied after selection.
        for ((_, overlay), glob) in metadata_overlays.iter().zip(&stream_patterns) {
            if glob.compile_matcher().is_match(&stream_name) {
                merge_metadata(&mut stream.metadata, Vec::new(), overlay);
            }
        }
    }

    Ok((runtime, pii))
}
