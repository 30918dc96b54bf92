//! Singer wire types: the newline-delimited JSON message vocabulary shared by
//! every tap and target.
//!
//! The runner never validates a message's schema beyond finding its `type`
//! discriminator and, for STATE, its `value`; everything else passes through
//! byte-identical. Keeping a typed [`MessageType`] around is purely for the
//! few call sites (state capture, reservoir partitioning) that need to branch
//! on it.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// The `type` discriminator on a Singer message.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "SCHEMA")]
    Schema,
    #[serde(rename = "RECORD")]
    Record,
    #[serde(rename = "STATE")]
    State,
    #[serde(rename = "ACTIVATE_VERSION")]
    ActivateVersion,
    #[serde(rename = "BATCH")]
    Batch,
}

/// The fields this crate actually needs out of a line, extracted without
/// requiring the rest of the document to parse into any particular shape.
#[derive(Clone, Debug, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub stream: Option<String>,
    pub value: Option<Json>,
}

/// Parse one line of NDJSON into its header, preserving the original line
/// unmodified (the runner passes non-STATE lines through byte-identical, so
/// nothing here re-serializes a parsed message back to bytes).
pub fn parse_line(line: &str) -> Option<MessageHeader> {
    serde_json::from_str(line).ok()
}
