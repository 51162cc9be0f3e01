use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded push datagram. Built fresh per packet and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundUpdate {
    /// Bridge id (`B`). Blank or stale ids are seen during bridge restarts.
    pub origin_id: Option<String>,
    /// Correlation key (`i`). Repeated transmissions of one event share it.
    pub request_id: Option<String>,
    /// Path-like topic (`t`), e.g. `devices/aabbccdd/state`.
    pub topic: Option<String>,
    /// HTTP-like status code (`s`).
    pub status: Option<u16>,
    /// Device state body (`b`). `Value::Null` when absent.
    pub payload: Value,
}

impl InboundUpdate {
    pub fn device_id(&self) -> Option<&str> {
        self.topic
            .as_deref()
            .and_then(crate::protocol::device_id_from_topic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn from_bond(value: i64) -> Option<Self> {
        match value {
            1 => Some(Direction::Forward),
            -1 => Some(Direction::Reverse),
            _ => None,
        }
    }

    pub fn as_bond(&self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breeze {
    pub enabled: bool,
    pub mean: i64,
    pub variability: i64,
}

/// Typed view over a device state body.
///
/// Every field is optional: a ceiling fan reports `speed` and `direction`,
/// a fireplace reports `flame`, a shade reports `open`. Fields the bridge
/// does not send stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceState {
    pub power: Option<i64>,
    pub speed: Option<i64>,
    pub direction: Option<i64>,
    pub breeze: Option<[i64; 3]>,
    pub timer: Option<i64>,
    pub light: Option<i64>,
    pub brightness: Option<i64>,
    pub up_light: Option<i64>,
    pub down_light: Option<i64>,
    pub up_light_brightness: Option<i64>,
    pub down_light_brightness: Option<i64>,
    pub flame: Option<i64>,
    pub fpfan_power: Option<i64>,
    pub fpfan_speed: Option<i64>,
    pub open: Option<i64>,
}

impl DeviceState {
    /// Returns `None` unless the payload is a JSON object.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        if !payload.is_object() {
            return None;
        }
        serde_json::from_value(payload.clone()).ok()
    }

    pub fn is_on(&self) -> Option<bool> {
        self.power.map(|p| p != 0)
    }

    pub fn light_on(&self) -> Option<bool> {
        self.light.map(|l| l != 0)
    }

    pub fn is_open(&self) -> Option<bool> {
        self.open.map(|o| o != 0)
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction.and_then(Direction::from_bond)
    }

    pub fn breeze(&self) -> Option<Breeze> {
        self.breeze.map(|[mode, mean, variability]| Breeze {
            enabled: mode != 0,
            mean,
            variability,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Unknown => write!(f, "unknown"),
            LinkStatus::Online => write!(f, "online"),
            LinkStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerState {
    #[default]
    Stopped,
    Running,
    Stopping,
}

impl ListenerState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ListenerState::Stopped => 0,
            ListenerState::Running => 1,
            ListenerState::Stopping => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ListenerState::Running,
            2 => ListenerState::Stopping,
            _ => ListenerState::Stopped,
        }
    }
}

/// Events emitted by the listener loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    LinkUp { bridge_id: Option<String> },
    LinkDown { silent_for: Duration },
    BridgeMismatch { expected: String, got: String },
}
