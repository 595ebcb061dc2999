//! UDP and TCP listeners. Every datagram and every connection is handled on
//! its own task; shutdown stops accepting and drains what is in flight.

use crate::dns::handler::RequestHandler;
use dnsmasq_rs_domain::DomainError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const UDP_RECV_BUFSIZE: usize = 4096;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// File descriptors systemd passes start right after stderr.
const SD_LISTEN_FDS_START: i32 = 3;

pub enum Listener {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

/// Binds one UDP socket and one TCP listener on `addr`.
pub fn bind(addr: SocketAddr) -> Result<Vec<Listener>, DomainError> {
    Ok(vec![
        Listener::Udp(bind_udp(addr)?),
        Listener::Tcp(bind_tcp(addr)?),
    ])
}

/// Adopts the sockets passed by a systemd-style activator, classifying each
/// descriptor by socket type. The configured listen address is ignored.
pub fn systemd_listeners() -> Result<Vec<Listener>, DomainError> {
    let listen_pid = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok());
    if listen_pid != Some(std::process::id()) {
        return Err(DomainError::ConfigError(
            "no sockets passed by the service manager (LISTEN_PID mismatch)".into(),
        ));
    }
    let count = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(0);
    if count <= 0 {
        return Err(DomainError::ConfigError(
            "no sockets passed by the service manager (LISTEN_FDS is empty)".into(),
        ));
    }

    let mut listeners = Vec::new();
    for fd in SD_LISTEN_FDS_START..SD_LISTEN_FDS_START + count {
        // Ownership of the descriptor transfers from the activator to us.
        let socket = unsafe {
            use std::os::fd::FromRawFd;
            Socket::from_raw_fd(fd)
        };
        socket
            .set_nonblocking(true)
            .map_err(|e| DomainError::IoError(format!("fd {fd}: {e}")))?;
        match socket.r#type() {
            Ok(Type::DGRAM) => {
                let udp = UdpSocket::from_std(socket.into())
                    .map_err(|e| DomainError::IoError(format!("fd {fd}: {e}")))?;
                listeners.push(Listener::Udp(udp));
            }
            Ok(Type::STREAM) => {
                let tcp = TcpListener::from_std(socket.into())
                    .map_err(|e| DomainError::IoError(format!("fd {fd}: {e}")))?;
                listeners.push(Listener::Tcp(tcp));
            }
            Ok(other) => {
                warn!(fd, socket_type = ?other, "ignoring activated socket of unsupported type");
            }
            Err(e) => {
                return Err(DomainError::IoError(format!(
                    "cannot classify activated fd {fd}: {e}"
                )));
            }
        }
    }
    if listeners.is_empty() {
        return Err(DomainError::ConfigError(
            "service manager passed no usable sockets".into(),
        ));
    }
    Ok(listeners)
}

pub struct DnsServer {
    handler: Arc<RequestHandler>,
}

impl DnsServer {
    pub fn new(handler: Arc<RequestHandler>) -> Self {
        Self { handler }
    }

    /// Serves until `shutdown` fires, then waits for in-flight dispatches.
    pub async fn run(
        &self,
        listeners: Vec<Listener>,
        shutdown: CancellationToken,
    ) -> Result<(), DomainError> {
        let tracker = TaskTracker::new();
        let mut loops: JoinSet<()> = JoinSet::new();

        for listener in listeners {
            let handler = self.handler.clone();
            let tracker = tracker.clone();
            let shutdown = shutdown.clone();
            match listener {
                Listener::Udp(socket) => {
                    let local = socket
                        .local_addr()
                        .map_err(|e| DomainError::IoError(e.to_string()))?;
                    info!(listen = %local, "ready for queries on udp");
                    loops.spawn(run_udp(Arc::new(socket), handler, tracker, shutdown));
                }
                Listener::Tcp(tcp) => {
                    let local = tcp
                        .local_addr()
                        .map_err(|e| DomainError::IoError(e.to_string()))?;
                    info!(listen = %local, "ready for queries on tcp");
                    loops.spawn(run_tcp(tcp, handler, tracker, shutdown));
                }
            }
        }

        while loops.join_next().await.is_some() {}

        tracker.close();
        tracker.wait().await;
        info!("all in-flight requests drained");
        Ok(())
    }
}

async fn run_udp(
    socket: Arc<UdpSocket>,
    handler: Arc<RequestHandler>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; UDP_RECV_BUFSIZE];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "udp recv error");
                        continue;
                    }
                };
                let query = buf[..len].to_vec();
                let handler = handler.clone();
                let socket = socket.clone();
                tracker.spawn(async move {
                    if let Some(response) = handler.handle_raw(&query, false).await {
                        if let Err(e) = socket.send_to(&response, peer).await {
                            warn!(peer = %peer, error = %e, "failed to write udp reply");
                        }
                    }
                });
            }
        }
    }
}

async fn run_tcp(
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "tcp accept error");
                        continue;
                    }
                };
                let handler = handler.clone();
                tracker.spawn(async move {
                    serve_tcp_connection(stream, peer, handler).await;
                });
            }
        }
    }
}

/// Answers length-framed queries on one connection until the peer goes
/// quiet, closes, or misbehaves.
async fn serve_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
) {
    loop {
        let query = match tokio::time::timeout(TCP_IDLE_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(Some(query))) => query,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "tcp read error");
                break;
            }
            Err(_) => {
                debug!(peer = %peer, "tcp connection idle, closing");
                break;
            }
        };
        let Some(response) = handler.handle_raw(&query, true).await else {
            continue;
        };
        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!(peer = %peer, error = %e, "failed to write tcp reply");
            break;
        }
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut frame = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "reply exceeds 64KiB"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, DomainError> {
    let bind_err = |e: std::io::Error| {
        DomainError::IoError(format!("failed to bind udp {addr}: {e}"))
    };
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false).map_err(bind_err)?;
    }
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    UdpSocket::from_std(socket.into()).map_err(bind_err)
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, DomainError> {
    let bind_err = |e: std::io::Error| {
        DomainError::IoError(format!("failed to bind tcp {addr}: {e}"))
    };
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false).map_err(bind_err)?;
    }
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(1024).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    TcpListener::from_std(socket.into()).map_err(bind_err)
}
