use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Datagrams larger than this are truncated.
const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

#[derive(Debug)]
pub enum RecvError {
    /// Nothing arrived within the timeout. Expected on most cycles.
    Timeout,
    /// The socket is gone (closed or never re-bound).
    Closed,
    Io(io::Error),
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "receive timeout"),
            RecvError::Closed => write!(f, "socket closed"),
            RecvError::Io(e) => write!(f, "receive failed: {e}"),
        }
    }
}

impl std::error::Error for RecvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecvError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Datagram I/O used by the listener loop.
pub trait Transport: Send + 'static {
    fn send_probe(
        &mut self,
        to: SocketAddr,
        probe: &[u8],
    ) -> impl Future<Output = io::Result<()>> + Send;

    fn recv(&mut self, timeout: Duration)
    -> impl Future<Output = Result<Datagram, RecvError>> + Send;

    /// Replaces the socket with a fresh one bound to the same port.
    fn rebind(&mut self) -> io::Result<()>;

    /// Releases the socket. Calling it twice is a no-op.
    fn close(&mut self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// UDP socket bound with `SO_REUSEADDR` and `SO_BROADCAST`, matching what
/// the bridge expects from push listeners on the LAN.
pub struct UdpTransport {
    port: u16,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Must be called from within a tokio runtime.
    pub fn open(port: u16) -> io::Result<Self> {
        let socket = bind_socket(port)?;
        let port = socket.local_addr()?.port();
        debug!(port, "opened push listener socket");
        Ok(Self {
            port,
            socket: Some(socket),
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

fn bind_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

impl Transport for UdpTransport {
    async fn send_probe(&mut self, to: SocketAddr, probe: &[u8]) -> io::Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        };
        socket.send_to(probe, to).await?;
        trace!(%to, "sent keep-alive");
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Datagram, RecvError> {
        let Some(socket) = self.socket.as_ref() else {
            // Pace the caller so a failing re-bind is retried once per cycle.
            tokio::time::sleep(timeout).await;
            return Err(RecvError::Closed);
        };
        match tokio::time::timeout(timeout, socket.recv_from(&mut self.buf)).await {
            Err(_) => Err(RecvError::Timeout),
            Ok(Err(e)) => Err(RecvError::Io(e)),
            Ok(Ok((len, from))) => {
                trace!(len, %from, "received datagram");
                Ok(Datagram {
                    bytes: self.buf[..len].to_vec(),
                    from,
                })
            }
        }
    }

    fn rebind(&mut self) -> io::Result<()> {
        self.socket = None;
        let socket = bind_socket(self.port)?;
        debug!(port = self.port, "re-bound push listener socket");
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!(port = self.port, "closed push listener socket");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}
