use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::types::InboundUpdate;

pub const DEFAULT_BPUP_PORT: u16 = 30007;

/// Keep-alive probe. The bridge answers with a status datagram and keeps
/// pushing updates to the sender for a while afterwards.
pub const PROBE: &[u8] = b"\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Malformed { raw: String, reason: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed { raw, reason } => {
                write!(f, "malformed datagram ({reason}): {raw:?}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Deserialize)]
struct WireUpdate {
    #[serde(rename = "B")]
    bond_id: Option<String>,
    #[serde(rename = "i")]
    request_id: Option<String>,
    #[serde(rename = "t")]
    topic: Option<String>,
    #[serde(rename = "s")]
    status: Option<u16>,
    #[serde(rename = "b", default)]
    body: Value,
}

pub fn encode_probe() -> &'static [u8] {
    PROBE
}

pub fn decode(bytes: &[u8]) -> Result<InboundUpdate, DecodeError> {
    let text = match std::str::from_utf8(bytes) {
        Ok(t) => t,
        Err(e) => return Err(malformed(bytes, format!("not UTF-8: {e}"))),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(malformed(bytes, "empty datagram".to_string()));
    }

    let parsed: Value = serde_json::from_str(trimmed)
        .map_err(|e| malformed(bytes, format!("invalid JSON: {e}")))?;
    if !parsed.is_object() {
        return Err(malformed(bytes, "not a JSON object".to_string()));
    }

    let wire: WireUpdate = serde_json::from_value(parsed)
        .map_err(|e| malformed(bytes, format!("unexpected field type: {e}")))?;

    Ok(InboundUpdate {
        origin_id: wire.bond_id,
        request_id: wire.request_id,
        topic: wire.topic,
        status: wire.status,
        payload: wire.body,
    })
}

/// `devices/<id>/state` -> `<id>`.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    topic.split('/').nth(1).filter(|id| !id.is_empty())
}

fn malformed(bytes: &[u8], reason: String) -> DecodeError {
    DecodeError::Malformed {
        raw: String::from_utf8_lossy(bytes).into_owned(),
        reason,
    }
}
