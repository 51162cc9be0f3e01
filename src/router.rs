use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::types::InboundUpdate;

/// Per-device consumer of push updates.
///
/// Called on the listener task. A panic here ends the listener, which then
/// reports [`ListenerState::Stopped`](crate::ListenerState::Stopped).
pub trait DeviceSink: Send + Sync {
    fn on_update(&self, device_id: &str, payload: &Value);
}

impl<F> DeviceSink for F
where
    F: Fn(&str, &Value) + Send + Sync,
{
    fn on_update(&self, device_id: &str, payload: &Value) {
        self(device_id, payload)
    }
}

/// Device id -> sink map shared between the listener and whoever attaches
/// and detaches devices. Ids compare case-insensitively.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    sinks: Arc<DashMap<String, Arc<dyn DeviceSink>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any sink already registered for `device_id`.
    pub fn register(&self, device_id: &str, sink: impl DeviceSink + 'static) {
        self.register_arc(device_id, Arc::new(sink));
    }

    pub fn register_arc(&self, device_id: &str, sink: Arc<dyn DeviceSink>) {
        debug!(device_id, "registering device consumer");
        self.sinks.insert(key(device_id), sink);
    }

    pub fn unregister(&self, device_id: &str) -> bool {
        debug!(device_id, "unregistering device consumer");
        self.sinks.remove(&key(device_id)).is_some()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.sinks.contains_key(&key(device_id))
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn get(&self, device_id: &str) -> Option<Arc<dyn DeviceSink>> {
        self.sinks.get(&key(device_id)).map(|entry| entry.value().clone())
    }
}

fn key(device_id: &str) -> String {
    device_id.to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Delivered(String),
    NoDeviceId,
    /// Not attached yet, or a device of another bridge on the same LAN.
    Unrouted(String),
}

pub struct Router {
    registry: DeviceRegistry,
}

impl Router {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn dispatch(&self, update: &InboundUpdate) -> Dispatch {
        let Some(device_id) = update.device_id() else {
            warn!(topic = ?update.topic, "can not read device id from push update");
            return Dispatch::NoDeviceId;
        };

        // Clone the sink out so no shard lock is held while it runs.
        match self.registry.get(device_id) {
            Some(sink) => {
                trace!(device_id, "forwarding update");
                sink.on_update(device_id, &update.payload);
                Dispatch::Delivered(device_id.to_string())
            }
            None => {
                debug!(device_id, "no consumer registered, dropping update");
                Dispatch::Unrouted(device_id.to_string())
            }
        }
    }
}
