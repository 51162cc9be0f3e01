use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::types::{Event, InboundUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Duplicate,
}

/// Keep-alive cadence and duplicate suppression for one bridge.
///
/// Owned by the listener task, so nothing here is synchronized.
pub struct Tracker {
    expected_bridge_id: String,
    probe_interval: Duration,
    last_probe: Option<Instant>,
    last_request_id: Option<String>,
}

impl Tracker {
    pub fn new(expected_bridge_id: impl Into<String>, probe_interval: Duration) -> Self {
        Self {
            expected_bridge_id: expected_bridge_id.into(),
            probe_interval,
            last_probe: None,
            last_request_id: None,
        }
    }

    pub fn is_probe_due(&self, now: Instant) -> bool {
        match self.last_probe {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.probe_interval,
        }
    }

    /// Called once per probe attempt whether or not the send succeeded.
    pub fn mark_probed(&mut self, now: Instant) {
        self.last_probe = Some(now);
    }

    pub fn last_request_id(&self) -> Option<&str> {
        self.last_request_id.as_deref()
    }

    pub fn admit(&mut self, update: &InboundUpdate) -> Admission {
        if let Some(Event::BridgeMismatch { expected, got }) = self.origin_mismatch(update) {
            warn!(%expected, %got, "update is not from the expected bridge");
        }

        if let Some(request_id) = update.request_id.as_deref()
            && let Some(last) = self.last_request_id.as_deref()
            && last.eq_ignore_ascii_case(request_id)
        {
            return Admission::Duplicate;
        }

        // Only the most recently admitted id is remembered, absent ones included.
        self.last_request_id = update.request_id.clone();
        Admission::Admitted
    }

    /// Blank ids on either side are not treated as a mismatch.
    pub fn origin_mismatch(&self, update: &InboundUpdate) -> Option<Event> {
        let got = update.origin_id.as_deref().map(str::trim).unwrap_or("");
        let expected = self.expected_bridge_id.trim();
        if got.is_empty() || expected.is_empty() || got.eq_ignore_ascii_case(expected) {
            return None;
        }
        Some(Event::BridgeMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        })
    }
}

/// Derives link up/down transitions from datagram arrival times.
pub struct LinkMonitor {
    offline_after: Duration,
    started: Option<Instant>,
    last_heard: Option<Instant>,
    online: Option<bool>,
}

impl LinkMonitor {
    pub fn new(offline_after: Duration) -> Self {
        Self {
            offline_after,
            started: None,
            last_heard: None,
            online: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.started = Some(now);
    }

    pub fn is_online(&self) -> Option<bool> {
        self.online
    }

    pub fn heard(&mut self, now: Instant, bridge_id: Option<&str>) -> Option<Event> {
        self.last_heard = Some(now);
        if self.online == Some(true) {
            return None;
        }
        self.online = Some(true);
        debug!(bridge_id = ?bridge_id, "bridge link up");
        Some(Event::LinkUp {
            bridge_id: bridge_id.map(str::to_string),
        })
    }

    pub fn check(&mut self, now: Instant) -> Option<Event> {
        if self.online == Some(false) {
            return None;
        }
        let since = self.last_heard.or(self.started)?;
        let silent_for = now.saturating_duration_since(since);
        if silent_for < self.offline_after {
            return None;
        }
        self.online = Some(false);
        debug!(?silent_for, "bridge link down");
        Some(Event::LinkDown { silent_for })
    }
}
