use bond_bpup::{BridgeConfig, DeviceState, Listener, PacketLogMode};
use serde_json::Value;
use std::env;

#[tokio::main]
async fn main() -> bond_bpup::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let ip = args
        .get(1)
        .expect("usage: monitor <ip> [bond-id] [device-id...] [--log <path>]");
    let bond_id = args.get(2).filter(|a| !a.starts_with("--")).cloned().unwrap_or_default();
    let devices: Vec<&String> = args
        .iter()
        .skip(3)
        .take_while(|a| !a.starts_with("--"))
        .collect();
    let log_path = args
        .iter()
        .position(|a| a == "--log")
        .and_then(|i| args.get(i + 1));

    let mut builder = Listener::builder(BridgeConfig::new(bond_id).with_ip(ip.as_str()))
        .on_event(|event| println!("{event:?}"));
    if let Some(path) = log_path {
        builder = builder.packet_log(PacketLogMode::Diffed, path.as_str());
    }
    let mut listener = builder.build()?;

    for device in devices {
        listener.register_consumer(device, |id: &str, payload: &Value| {
            match DeviceState::from_payload(payload) {
                Some(state) => println!(
                    "[{id}] power: {:?} | speed: {:?} | light: {:?} | open: {:?}",
                    state.is_on(),
                    state.speed,
                    state.light_on(),
                    state.is_open(),
                ),
                None => println!("[{id}] {payload}"),
            }
        });
    }

    println!("Listening for push updates from {ip}...");
    listener.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("signal error: {e}");
    }
    println!("Shutting down...");
    listener.shutdown().await;
    Ok(())
}
