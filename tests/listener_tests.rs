use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bond_bpup::{
    BridgeConfig, Datagram, DeviceRegistry, Error, Event, LinkStatus, Listener, ListenerState,
    RecvError, Transport,
};
use serde_json::Value;
use tokio::time::Instant;

enum Step {
    Datagram(Vec<u8>),
    Closed,
    Io,
}

#[derive(Default)]
struct Script {
    incoming: VecDeque<Step>,
    ops: Vec<&'static str>,
    probes: Vec<Instant>,
    fail_probes: bool,
    fail_rebinds: usize,
    closes: usize,
}

/// In-memory transport: plays back scripted receive results and waits out
/// the timeout once the script is exhausted.
#[derive(Clone, Default)]
struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    fn push(&self, step: Step) {
        self.script.lock().unwrap().incoming.push_back(step);
    }

    fn push_json(&self, json: &str) {
        self.push(Step::Datagram(json.as_bytes().to_vec()));
    }

    fn probes(&self) -> Vec<Instant> {
        self.script.lock().unwrap().probes.clone()
    }

    fn ops(&self) -> Vec<&'static str> {
        self.script.lock().unwrap().ops.clone()
    }

    fn closes(&self) -> usize {
        self.script.lock().unwrap().closes
    }
}

fn bridge_addr() -> SocketAddr {
    "127.0.0.1:30007".parse().unwrap()
}

impl Transport for ScriptedTransport {
    async fn send_probe(&mut self, _to: SocketAddr, probe: &[u8]) -> io::Result<()> {
        assert_eq!(probe, b"\n");
        let fail = {
            let mut script = self.script.lock().unwrap();
            script.ops.push("probe");
            script.probes.push(Instant::now());
            script.fail_probes
        };
        if fail {
            return Err(io::Error::other("network unreachable"));
        }
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Datagram, RecvError> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.ops.push("recv");
            script.incoming.pop_front()
        };
        match step {
            Some(Step::Datagram(bytes)) => Ok(Datagram {
                bytes,
                from: bridge_addr(),
            }),
            Some(Step::Closed) => Err(RecvError::Closed),
            Some(Step::Io) => Err(RecvError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset",
            ))),
            None => {
                tokio::time::sleep(timeout).await;
                Err(RecvError::Timeout)
            }
        }
    }

    fn rebind(&mut self) -> io::Result<()> {
        let mut script = self.script.lock().unwrap();
        script.ops.push("rebind");
        if script.fail_rebinds > 0 {
            script.fail_rebinds -= 1;
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.script.lock().unwrap().closes += 1;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

fn config() -> BridgeConfig {
    BridgeConfig::new("ZZBL12345").with_ip("127.0.0.1")
}

fn push(device: &str, request_id: &str) -> String {
    format!(
        r#"{{"B":"ZZBL12345","t":"devices/{device}/state","i":"{request_id}","s":200,"m":0,"b":{{"power":1}}}}"#
    )
}

fn recording_registry() -> (DeviceRegistry, Arc<Mutex<Vec<String>>>) {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
    let registry = DeviceRegistry::new();
    for device in ["dev42", "aabbccdd"] {
        let seen = seen.clone();
        registry.register(device, move |id: &str, _payload: &Value| {
            seen.lock().unwrap().push(id.to_string());
        });
    }
    (registry, seen)
}

#[tokio::test(start_paused = true)]
async fn probes_on_first_cycle_then_every_interval() {
    let transport = ScriptedTransport::default();
    let mut listener = Listener::builder(config()).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(130)).await;
    listener.shutdown().await;

    let probes = transport.probes();
    assert_eq!(probes.len(), 3, "probes at {probes:?}");
    for pair in probes.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(60));
    }
    let ops = transport.ops();
    assert_eq!(ops[0], "probe");
    assert_eq!(ops[1], "recv");
}

#[tokio::test(start_paused = true)]
async fn failed_probe_does_not_skip_receive_or_retry_early() {
    let transport = ScriptedTransport::default();
    transport.script.lock().unwrap().fail_probes = true;
    let (registry, seen) = recording_registry();
    transport.push_json(&push("dev42", "0001"));

    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    listener.shutdown().await;

    assert_eq!(transport.probes().len(), 1);
    assert_eq!(seen.lock().unwrap().as_slice(), ["dev42"]);
}

#[tokio::test(start_paused = true)]
async fn duplicates_dropped_and_interleaved_ids_delivered() {
    let transport = ScriptedTransport::default();
    transport.push_json(&push("dev42", "00AB"));
    transport.push_json(&push("dev42", "00ab"));
    transport.push_json(&push("dev42", "00CD"));
    transport.push_json(&push("dev42", "00AB"));

    let (registry, seen) = recording_registry();
    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    listener.shutdown().await;

    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn updates_without_request_id_always_delivered() {
    let transport = ScriptedTransport::default();
    let no_id = r#"{"B":"ZZBL12345","t":"devices/dev42/state","b":{"speed":2}}"#;
    transport.push_json(&push("dev42", "0001"));
    transport.push_json(no_id);
    transport.push_json(no_id);

    let (registry, seen) = recording_registry();
    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    listener.shutdown().await;

    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn update_without_request_id_resets_dedup_memory() {
    let transport = ScriptedTransport::default();
    transport.push_json(&push("dev42", "A1"));
    transport.push_json(r#"{"B":"ZZBL12345","t":"devices/dev42/state","b":{"speed":2}}"#);
    transport.push_json(&push("dev42", "A1"));

    let (registry, seen) = recording_registry();
    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    listener.shutdown().await;

    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn malformed_datagram_does_not_stop_loop() {
    let transport = ScriptedTransport::default();
    transport.push(Step::Datagram(b"\x00garbled{{".to_vec()));
    transport.push_json(&push("dev42", "0001"));

    let (registry, seen) = recording_registry();
    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(listener.state(), ListenerState::Running);
    assert_eq!(seen.lock().unwrap().len(), 1);
    let recvs = transport.ops().iter().filter(|op| **op == "recv").count();
    assert!(recvs > 2, "loop should keep receiving, got {recvs}");

    listener.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn routes_only_to_registered_device() {
    let transport = ScriptedTransport::default();
    transport.push_json(
        r#"{"B":"ZZBL12345","t":"bridgebond/dev42/state","i":"1","b":{"power":1}}"#,
    );
    transport.push_json(
        r#"{"B":"ZZBL12345","t":"bridgebond/dev99/state","i":"2","b":{"power":0}}"#,
    );
    transport.push_json(r#"{"B":"ZZBL12345","i":"3"}"#);

    let (registry, seen) = recording_registry();
    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(seen.lock().unwrap().as_slice(), ["dev42"]);
    assert_eq!(listener.state(), ListenerState::Running);
    listener.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rebinds_after_unexpected_close_then_resumes() {
    let transport = ScriptedTransport::default();
    transport.push(Step::Closed);
    transport.push_json(&push("dev42", "0001"));

    let (registry, seen) = recording_registry();
    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    listener.shutdown().await;

    let ops = transport.ops();
    let rebind = ops.iter().position(|op| *op == "rebind").expect("no rebind");
    assert_eq!(ops[rebind + 1], "recv");
    assert_eq!(ops.iter().filter(|op| **op == "rebind").count(), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_rebind_retried_next_cycle() {
    let transport = ScriptedTransport::default();
    transport.script.lock().unwrap().fail_rebinds = 1;
    transport.push(Step::Io);
    transport.push(Step::Closed);
    transport.push_json(&push("dev42", "0001"));

    let (registry, seen) = recording_registry();
    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    listener.shutdown().await;

    assert_eq!(transport.ops().iter().filter(|op| **op == "rebind").count(), 2);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_pending_receive() {
    let transport = ScriptedTransport::default();
    let mut listener = Listener::builder(config()).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();

    // Land in the middle of a 3 s receive.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let before = Instant::now();
    listener.shutdown().await;

    assert!(before.elapsed() < Duration::from_secs(3));
    assert_eq!(listener.state(), ListenerState::Stopped);
    assert_eq!(transport.closes(), 1);

    listener.shutdown().await;
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn start_twice_is_rejected_and_restart_after_shutdown_works() {
    let mut listener = Listener::builder(config()).build().unwrap();
    listener.start_with(ScriptedTransport::default()).await.unwrap();
    assert_eq!(listener.state(), ListenerState::Running);

    let second = ScriptedTransport::default();
    let err = listener.start_with(second).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning), "got {err:?}");

    listener.shutdown().await;
    listener.start_with(ScriptedTransport::default()).await.unwrap();
    assert_eq!(listener.state(), ListenerState::Running);
    listener.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reports_link_and_bridge_identity() {
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(vec![]));
    let events_clone = events.clone();

    let transport = ScriptedTransport::default();
    transport.push_json(&push("dev42", "0001"));
    transport.push_json(r#"{"B":"ZZOTHER","t":"devices/dev42/state","i":"0002","b":{}}"#);

    let mut config = config();
    config.offline_after_ms = 30_000;
    let (registry, seen) = recording_registry();
    let mut listener = Listener::builder(config)
        .registry(registry)
        .on_event(move |event| events_clone.lock().unwrap().push(event.clone()))
        .build()
        .unwrap();
    assert_eq!(listener.link_status(), LinkStatus::Unknown);
    listener.start_with(transport.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(listener.link_status(), LinkStatus::Online);
    assert_eq!(listener.last_known_bridge_id().as_deref(), Some("ZZOTHER"));
    // Mismatched origin is reported, not dropped.
    assert_eq!(seen.lock().unwrap().len(), 2);

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(listener.link_status(), LinkStatus::Offline);
    listener.shutdown().await;

    let events = events.lock().unwrap();
    assert!(matches!(&events[0], Event::LinkUp { bridge_id: Some(id) } if id == "ZZBL12345"));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::BridgeMismatch { expected, got } if expected == "ZZBL12345" && got == "ZZOTHER"
    )));
    assert!(matches!(events.last(), Some(Event::LinkDown { .. })));
}

#[tokio::test(start_paused = true)]
async fn consumers_attach_while_running() {
    let transport = ScriptedTransport::default();
    let mut listener = Listener::builder(config()).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(vec![]));
    let seen_clone = seen.clone();
    listener.register_consumer("AABBCCDD", move |_: &str, payload: &Value| {
        seen_clone.lock().unwrap().push(payload.clone());
    });
    transport.push_json(&push("aabbccdd", "0001"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0]["power"], 1);

    assert!(listener.unregister_consumer("aabbccdd"));
    transport.push_json(&push("aabbccdd", "0002"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    listener.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn panicking_consumer_leaves_listener_stopped() {
    let transport = ScriptedTransport::default();
    transport.push_json(&push("dev42", "0001"));

    let registry = DeviceRegistry::new();
    registry.register("dev42", |_: &str, _: &Value| panic!("consumer failed"));
    let mut listener = Listener::builder(config()).registry(registry).build().unwrap();
    listener.start_with(transport.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(listener.state(), ListenerState::Stopped);
    listener.shutdown().await;
    assert_eq!(listener.state(), ListenerState::Stopped);
}
