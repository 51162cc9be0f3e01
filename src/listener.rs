use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::BridgeConfig;
use crate::logger::{PacketLogMode, PacketLogger};
use crate::protocol;
use crate::router::{DeviceRegistry, DeviceSink, Dispatch, Router};
use crate::tracker::{Admission, LinkMonitor, Tracker};
use crate::transport::{Datagram, RecvError, Transport, UdpTransport};
use crate::types::{Event, LinkStatus, ListenerState};
use crate::{Error, Result};

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// State readable from outside the loop task.
#[derive(Default)]
struct Shared {
    bridge_id: RwLock<Option<String>>,
    link: RwLock<LinkStatus>,
}

pub struct ListenerBuilder {
    config: BridgeConfig,
    registry: Option<DeviceRegistry>,
    event_callbacks: Vec<EventCallback>,
    log_mode: Option<PacketLogMode>,
    log_path: Option<String>,
}

impl ListenerBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            registry: None,
            event_callbacks: Vec::new(),
            log_mode: None,
            log_path: None,
        }
    }

    /// Share a registry with the code that attaches devices.
    pub fn registry(mut self, registry: DeviceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn on_event(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event_callbacks.push(Box::new(f));
        self
    }

    pub fn packet_log(mut self, mode: PacketLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Listener> {
        self.config.validate()?;

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(PacketLogger::new(mode, &path)?),
            _ => None,
        };

        Ok(Listener {
            config: self.config,
            registry: self.registry.unwrap_or_default(),
            event_callbacks: Arc::new(self.event_callbacks),
            logger,
            state: Arc::new(AtomicU8::new(ListenerState::Stopped.as_u8())),
            shared: Arc::new(Shared::default()),
            local_addr: None,
            shutdown_tx: None,
            task: None,
        })
    }
}

/// Push listener for one bridge.
///
/// `start` binds the socket and spawns the receive loop on the current tokio
/// runtime; `shutdown` stops it within one receive timeout.
pub struct Listener {
    config: BridgeConfig,
    registry: DeviceRegistry,
    event_callbacks: Arc<Vec<EventCallback>>,
    logger: Option<PacketLogger>,
    state: Arc<AtomicU8>,
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<Option<PacketLogger>>>,
}

impl Listener {
    pub fn builder(config: BridgeConfig) -> ListenerBuilder {
        ListenerBuilder::new(config)
    }

    /// Fails with [`Error::Bind`] when the local port is unavailable.
    pub async fn start(&mut self) -> Result<()> {
        self.ensure_stopped()?;
        let endpoint = self.config.resolve().await?;
        let transport = UdpTransport::open(self.config.local_port).map_err(Error::Bind)?;
        self.launch(transport, endpoint);
        Ok(())
    }

    /// Like [`start`](Self::start) with an already opened transport.
    pub async fn start_with<T: Transport>(&mut self, mut transport: T) -> Result<()> {
        self.ensure_stopped()?;
        let endpoint = match self.config.resolve().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        self.launch(transport, endpoint);
        Ok(())
    }

    /// Idempotent. Returns once the loop task has exited.
    pub async fn shutdown(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.state
            .store(ListenerState::Stopping.as_u8(), Ordering::Release);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        match task.await {
            Ok(logger) => self.logger = logger,
            Err(e) => warn!("push listener task failed: {e}"),
        }
        self.state.store(ListenerState::Stopped.as_u8(), Ordering::Release);
        self.local_addr = None;
        debug!("push listener stopped");
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn link_status(&self) -> LinkStatus {
        *self.shared.link.read()
    }

    /// Bridge id carried by the most recent datagram, if any.
    pub fn last_known_bridge_id(&self) -> Option<String> {
        self.shared.bridge_id.read().clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn register_consumer(&self, device_id: &str, sink: impl DeviceSink + 'static) {
        self.registry.register(device_id, sink);
    }

    pub fn unregister_consumer(&self, device_id: &str) -> bool {
        self.registry.unregister(device_id)
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.task.is_some() || self.state() != ListenerState::Stopped {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    fn launch<T: Transport>(&mut self, transport: T, endpoint: SocketAddr) {
        self.local_addr = transport.local_addr();
        *self.shared.link.write() = LinkStatus::Unknown;

        let (tx, rx) = watch::channel(false);
        let cycle = ListenerLoop {
            transport,
            endpoint,
            receive_timeout: self.config.receive_timeout(),
            tracker: Tracker::new(self.config.bond_id.clone(), self.config.probe_interval()),
            link: LinkMonitor::new(self.config.offline_after()),
            router: Router::new(self.registry.clone()),
            logger: self.logger.take(),
            shared: self.shared.clone(),
            event_callbacks: self.event_callbacks.clone(),
        };

        self.state.store(ListenerState::Running.as_u8(), Ordering::Release);
        debug!(%endpoint, local_addr = ?self.local_addr, "starting push listener");
        self.task = Some(tokio::spawn(cycle.run(self.state.clone(), rx)));
        self.shutdown_tx = Some(tx);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            self.state
                .store(ListenerState::Stopping.as_u8(), Ordering::Release);
            let _ = tx.send(true);
        }
    }
}

/// Marks the listener stopped when the loop task ends, including by a
/// panicking consumer or event callback.
struct StoppedOnExit(Arc<AtomicU8>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.store(ListenerState::Stopped.as_u8(), Ordering::Release);
    }
}

struct ListenerLoop<T> {
    transport: T,
    endpoint: SocketAddr,
    receive_timeout: Duration,
    tracker: Tracker,
    link: LinkMonitor,
    router: Router,
    logger: Option<PacketLogger>,
    shared: Arc<Shared>,
    event_callbacks: Arc<Vec<EventCallback>>,
}

impl<T: Transport> ListenerLoop<T> {
    async fn run(
        mut self,
        state: Arc<AtomicU8>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<PacketLogger> {
        let _stopped = StoppedOnExit(state.clone());
        self.link.start(Instant::now());

        while !*shutdown.borrow()
            && ListenerState::from_u8(state.load(Ordering::Acquire)) == ListenerState::Running
        {
            self.probe_if_due().await;

            if let Some(event) = self.link.check(Instant::now()) {
                self.emit(&event);
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.transport.recv(self.receive_timeout) => received,
            };

            match received {
                Ok(datagram) => self.handle_datagram(datagram),
                Err(RecvError::Timeout) => trace!("no datagram within receive timeout"),
                Err(err) => {
                    debug!("push listener receive failed: {err}");
                    if let Err(e) = self.transport.rebind() {
                        warn!("re-bind failed, retrying next cycle: {e}");
                    }
                }
            }
        }

        self.transport.close();
        debug!("push listener exiting");
        self.logger
    }

    async fn probe_if_due(&mut self) {
        let now = Instant::now();
        if !self.tracker.is_probe_due(now) {
            return;
        }

        let ok = match self
            .transport
            .send_probe(self.endpoint, protocol::encode_probe())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!(endpoint = %self.endpoint, "keep-alive send failed: {e}");
                false
            }
        };
        self.tracker.mark_probed(now);

        if let Some(ref mut logger) = self.logger {
            logger.log_probe(self.endpoint, ok);
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        let update = match protocol::decode(&datagram.bytes) {
            Ok(update) => update,
            Err(e) => {
                debug!(from = %datagram.from, "dropping datagram: {e}");
                if let Some(ref mut logger) = self.logger {
                    let raw = String::from_utf8_lossy(&datagram.bytes);
                    logger.log_drop("malformed", Some(&raw));
                }
                return;
            }
        };

        let origin = update
            .origin_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if let Some(id) = origin {
            *self.shared.bridge_id.write() = Some(id.to_string());
        }
        if let Some(event) = self.link.heard(Instant::now(), origin) {
            self.emit(&event);
        }
        if let Some(event) = self.tracker.origin_mismatch(&update) {
            self.emit(&event);
        }

        if let Some(ref mut logger) = self.logger {
            logger.log_update(datagram.from, &update);
        }

        match self.tracker.admit(&update) {
            Admission::Duplicate => {
                trace!(request_id = ?update.request_id, "dropping duplicate update");
                if let Some(ref mut logger) = self.logger {
                    logger.log_drop("duplicate", update.request_id.as_deref());
                }
            }
            Admission::Admitted => {
                let dropped = match self.router.dispatch(&update) {
                    Dispatch::Delivered(_) => None,
                    Dispatch::NoDeviceId => Some(("no_device_id", update.topic.clone())),
                    Dispatch::Unrouted(id) => Some(("unrouted", Some(id))),
                };
                if let (Some((reason, detail)), Some(logger)) = (dropped, self.logger.as_mut()) {
                    logger.log_drop(reason, detail.as_deref());
                }
            }
        }
    }

    fn emit(&self, event: &Event) {
        match event {
            Event::LinkUp { .. } => *self.shared.link.write() = LinkStatus::Online,
            Event::LinkDown { .. } => *self.shared.link.write() = LinkStatus::Offline,
            Event::BridgeMismatch { .. } => {}
        }
        for cb in self.event_callbacks.iter() {
            cb(event);
        }
    }
}
