//! One TCP or UDP endpoint per stream.
//!
//! A [`TransportSession`] exclusively owns its socket and releases it exactly
//! once, on [`TransportSession::close`] or on drop. TCP sessions move a byte
//! stream; UDP sessions move whole datagrams. Neither adds framing the other
//! would need.

use crate::config::{Config, Protocol};
use crate::error::{ConnectError, Error, Result};
use log::{debug, warn};
use socket2::SockRef;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time;

/// Counts sockets currently held open by sessions created against it.
#[derive(Debug, Clone, Default)]
pub struct OpenHandles(Arc<AtomicUsize>);

impl OpenHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Registers one open socket until the returned guard is dropped.
    pub fn acquire(&self) -> HandleGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        HandleGuard(self.0.clone())
    }
}

/// Keeps one socket registered in its [`OpenHandles`].
#[derive(Debug)]
pub struct HandleGuard(Arc<AtomicUsize>);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of a receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Bytes read (TCP) or length of one datagram (UDP)
    Data(usize),
    /// The peer closed its sending side (TCP only)
    EndOfStream,
}

enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

pub struct TransportSession {
    protocol: Protocol,
    socket: Option<(Socket, HandleGuard)>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl TransportSession {
    /// Connects a new client-side session to the configured target.
    pub async fn open(config: &Config, handles: &OpenHandles) -> Result<Self> {
        let target = config.target_addr()?;
        let addr = resolve(&target).await?;

        match config.protocol {
            Protocol::Tcp => {
                let stream = match time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(ConnectError::new(target, e).into()),
                    Err(_) => return Err(ConnectError::timeout(target).into()),
                };
                Self::from_tcp(stream, config, handles).map_err(|e| ConnectError::new(target, e).into())
            }
            Protocol::Udp => {
                let local = if addr.is_ipv4() {
                    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
                } else {
                    SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
                };
                let socket = UdpSocket::bind(local)
                    .await
                    .map_err(|e| ConnectError::new(local.to_string(), e))?;
                socket
                    .connect(addr)
                    .await
                    .map_err(|e| ConnectError::new(target.clone(), e))?;
                apply_window(&SockRef::from(&socket), config.window_size);

                let local = socket.local_addr()?;
                debug!("UDP session {} -> {}", local, addr);
                Ok(Self {
                    protocol: Protocol::Udp,
                    socket: Some((Socket::Udp(socket), handles.acquire())),
                    local,
                    peer: addr,
                })
            }
        }
    }

    /// Wraps an established TCP stream (accepted or connected).
    pub fn from_tcp(stream: TcpStream, config: &Config, handles: &OpenHandles) -> io::Result<Self> {
        if config.no_delay {
            stream.set_nodelay(true)?;
        }
        apply_window(&SockRef::from(&stream), config.window_size);

        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        debug!("TCP session {} -> {}", local, peer);
        Ok(Self {
            protocol: Protocol::Tcp,
            socket: Some((Socket::Tcp(stream), handles.acquire())),
            local,
            peer,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Sends bytes (TCP, may be partial) or one datagram (UDP).
    pub async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.socket_mut()? {
            Socket::Tcp(stream) => stream.write(buf).await,
            Socket::Udp(socket) => socket.send(buf).await,
        }
    }

    /// Receives bytes (TCP) or one datagram (UDP) into `buf`.
    pub async fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        match self.socket_mut()? {
            Socket::Tcp(stream) => match stream.read(buf).await? {
                0 => Ok(Received::EndOfStream),
                n => Ok(Received::Data(n)),
            },
            Socket::Udp(socket) => Ok(Received::Data(socket.recv(buf).await?)),
        }
    }

    /// Signals end of stream to the peer (TCP write shutdown; no-op for UDP).
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self.socket_mut()? {
            Socket::Tcp(stream) => stream.shutdown().await,
            Socket::Udp(_) => Ok(()),
        }
    }

    /// The underlying TCP stream, for the control message exchange.
    pub fn control_stream(&mut self) -> Result<&mut TcpStream> {
        match self.socket_mut()? {
            Socket::Tcp(stream) => Ok(stream),
            Socket::Udp(_) => Err(Error::Protocol(
                "control messages are only exchanged over TCP".to_string(),
            )),
        }
    }

    /// Releases the socket. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some((socket, guard)) = self.socket.take() {
            debug!("closing {:?} session {} -> {}", self.protocol, self.local, self.peer);
            drop(socket);
            drop(guard);
        }
    }

    fn socket_mut(&mut self) -> io::Result<&mut Socket> {
        self.socket
            .as_mut()
            .map(|(socket, _)| socket)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session closed"))
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn resolve(target: &str) -> Result<SocketAddr> {
    let mut addrs = lookup_host(target)
        .await
        .map_err(|e| ConnectError::new(target, e))?;
    addrs.next().ok_or_else(|| {
        ConnectError::new(
            target,
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"),
        )
        .into()
    })
}

/// Applies the requested socket buffer size to both directions.
pub(crate) fn apply_window(socket: &SockRef<'_>, window: Option<usize>) {
    if let Some(size) = window {
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!("failed to set send buffer to {} bytes: {}", size, e);
        }
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!("failed to set receive buffer to {} bytes: {}", size, e);
        }
    }
}
