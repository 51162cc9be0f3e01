mod config;
mod diff;
mod error;
mod listener;
mod logger;
pub mod protocol;
mod router;
mod tracker;
mod transport;
mod types;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use listener::{Listener, ListenerBuilder};
pub use logger::PacketLogMode;
pub use protocol::DecodeError;
pub use router::{DeviceRegistry, DeviceSink, Dispatch, Router};
pub use tracker::{Admission, LinkMonitor, Tracker};
pub use transport::{Datagram, RecvError, Transport, UdpTransport};
pub use types::*;
