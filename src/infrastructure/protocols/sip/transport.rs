//! SIP transport layer - UDP datagrams and TCP streams

use super::message::{SipError, SipMessage};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    /// Unreliable transports need request retransmission
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportProtocol::Tcp)
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Transport layer trait
#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> TransportProtocol;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Send raw bytes to a peer
    async fn send(&self, data: Bytes, destination: SocketAddr) -> Result<(), SipError>;

    /// Stop receiving and drop all connections
    fn stop(&self);
}

/// Resolve `host:port` to a socket address
pub async fn resolve(destination: &str) -> Result<SocketAddr, SipError> {
    if let Ok(addr) = destination.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(destination)
        .await?
        .next()
        .ok_or_else(|| SipError::TransportError(format!("Cannot resolve {}", destination)))
}

fn handle_datagram(
    data: &[u8],
    source: SocketAddr,
    protocol: TransportProtocol,
) -> Option<IncomingMessage> {
    // CRLF keep-alive pings
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match SipMessage::parse(data) {
        Ok(message) => Some(IncomingMessage {
            message,
            source,
            protocol,
        }),
        Err(e) => {
            warn!("Failed to parse SIP message from {}: {}", source, e);
            None
        }
    }
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind and start receiving; incoming messages arrive on the receiver.
    pub async fn bind(
        bind_addr: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::Receiver<IncomingMessage>), SipError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(1000);
        let task = tokio::spawn(Self::receive_loop(socket.clone(), tx));

        Ok((
            Arc::new(Self {
                socket,
                local_addr,
                task: Mutex::new(Some(task)),
            }),
            rx,
        ))
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);
                    if let Some(incoming) =
                        handle_datagram(&buf[..size], source, TransportProtocol::Udp)
                    {
                        if tx.send(incoming).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    warn!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn send(&self, data: Bytes, destination: SocketAddr) -> Result<(), SipError> {
        debug!("Sending {} bytes to {} via UDP", data.len(), destination);
        self.socket
            .send_to(&data, destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }

    fn stop(&self) {
        info!("Stopping UDP transport");
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Split one complete SIP message off a stream buffer, using Content-Length.
fn split_frame(buf: &mut BytesMut) -> Option<Bytes> {
    // Leading CRLFs are keep-alives
    while buf.starts_with(b"\r\n") {
        buf.advance(2);
    }

    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let content_length = {
        let head = String::from_utf8_lossy(&buf[..header_end]);
        head.lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                let name = name.trim();
                (name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l"))
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0)
    };

    let total = header_end + content_length;
    if buf.len() < total {
        return None;
    }
    Some(buf.split_to(total).freeze())
}

/// TCP transport implementation
///
/// Connections are kept per peer address and reused for requests the
/// gateway originates towards that peer.
pub struct TcpTransport {
    local_addr: SocketAddr,
    connections: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    incoming: mpsc::Sender<IncomingMessage>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub async fn bind(
        bind_addr: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::Receiver<IncomingMessage>), SipError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind TCP socket: {}", e)))?;
        let local_addr = listener.local_addr()?;
        info!("TCP transport listening on {}", local_addr);

        let (tx, rx) = mpsc::channel(1000);
        let connections = Arc::new(DashMap::new());
        let task = tokio::spawn(Self::accept_loop(listener, connections.clone(), tx.clone()));

        Ok((
            Arc::new(Self {
                local_addr,
                connections,
                incoming: tx,
                task: Mutex::new(Some(task)),
            }),
            rx,
        ))
    }

    async fn accept_loop(
        listener: TcpListener,
        connections: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
        tx: mpsc::Sender<IncomingMessage>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, source)) => {
                    info!("Accepted TCP connection from {}", source);
                    Self::attach(stream, source, connections.clone(), tx.clone());
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                    break;
                }
            }
        }
    }

    /// Spawn reader and writer halves for a connected stream.
    fn attach(
        stream: TcpStream,
        peer: SocketAddr,
        connections: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
        tx: mpsc::Sender<IncomingMessage>,
    ) -> mpsc::Sender<Bytes> {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(256);
        connections.insert(peer, out_tx.clone());

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    warn!("Failed to write to {}: {}", peer, e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8192);
            loop {
                match reader.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!("TCP connection closed by {}", peer);
                        break;
                    }
                    Ok(size) => {
                        debug!("Received {} bytes from {} via TCP", size, peer);
                        while let Some(frame) = split_frame(&mut buf) {
                            if let Some(incoming) =
                                handle_datagram(&frame, peer, TransportProtocol::Tcp)
                            {
                                if tx.send(incoming).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read from TCP connection {}: {}", peer, e);
                        break;
                    }
                }
            }
            connections.remove(&peer);
        });

        out_tx
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn send(&self, data: Bytes, destination: SocketAddr) -> Result<(), SipError> {
        debug!("Sending {} bytes to {} via TCP", data.len(), destination);

        let existing = self.connections.get(&destination).map(|c| c.value().clone());
        let sender = match existing {
            Some(sender) if !sender.is_closed() => sender,
            _ => {
                let stream = TcpStream::connect(destination).await.map_err(|e| {
                    SipError::TransportError(format!("Failed to connect to {}: {}", destination, e))
                })?;
                Self::attach(
                    stream,
                    destination,
                    self.connections.clone(),
                    self.incoming.clone(),
                )
            }
        };

        sender
            .send(data)
            .await
            .map_err(|_| SipError::TransportError(format!("Connection to {} closed", destination)))
    }

    fn stop(&self) {
        info!("Stopping TCP transport");
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        // Dropping the senders ends the writer tasks
        self.connections.clear();
    }
}
