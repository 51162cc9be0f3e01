use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

use crate::diff::{changes_to_json, diff_json, merge_state};
use crate::types::InboundUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLogMode {
    /// Every received body is written as-is.
    Full,
    /// First body per device in full, then only the changed fields.
    Diffed,
}

/// NDJSON capture of probes, received updates and drops.
pub(crate) struct PacketLogger {
    mode: PacketLogMode,
    file: File,
    device_states: HashMap<String, Value>,
}

impl PacketLogger {
    pub fn new(mode: PacketLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            device_states: HashMap::new(),
        })
    }

    pub fn log_probe(&mut self, target: SocketAddr, ok: bool) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "probe",
            "target": target.to_string(),
            "ok": ok,
        });
        self.write_line(&entry);
    }

    pub fn log_update(&mut self, from: SocketAddr, update: &InboundUpdate) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "recv",
            "from": from.to_string(),
            "bond_id": update.origin_id,
            "topic": update.topic,
            "request_id": update.request_id,
            "status": update.status,
        });

        let device_id = update.device_id().map(str::to_ascii_lowercase);
        match (&self.mode, device_id) {
            (PacketLogMode::Diffed, Some(device_id)) => {
                match self.device_states.get_mut(&device_id) {
                    Some(previous) => {
                        let mut changes = Vec::new();
                        diff_json(previous, &update.payload, "", &mut changes);
                        entry["changes"] = Value::Array(changes_to_json(&changes));
                        merge_state(previous, &update.payload);
                    }
                    None => {
                        entry["full"] = Value::Bool(true);
                        entry["body"] = update.payload.clone();
                        self.device_states.insert(device_id, update.payload.clone());
                    }
                }
            }
            _ => {
                entry["body"] = update.payload.clone();
            }
        }
        self.write_line(&entry);
    }

    pub fn log_drop(&mut self, reason: &str, detail: Option<&str>) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "drop",
            "reason": reason,
            "detail": detail,
        });
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write packet log entry: {e}");
        }
    }
}
