//! One query/response exchange with an upstream server, behind a trait so
//! the forwarder can be driven by a scripted double in tests.

use async_trait::async_trait;
use dnsmasq_rs_domain::DomainError;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::MAX_MSG_SIZE;

#[async_trait]
pub trait Exchanger: Send + Sync {
    /// Sends `request` to `server` and returns the parsed reply.
    async fn exchange(
        &self,
        request: &Message,
        server: SocketAddr,
        tcp: bool,
    ) -> Result<Message, DomainError>;
}

/// Real network exchanger: plain DNS over UDP or TCP with one deadline
/// covering connect, send and receive.
pub struct NetExchanger {
    timeout: Duration,
}

impl NetExchanger {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange_udp(
        &self,
        payload: &[u8],
        server: SocketAddr,
    ) -> Result<Vec<u8>, DomainError> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("wildcard v4 addr")
        } else {
            "[::]:0".parse().expect("wildcard v6 addr")
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| transport_err(server, format!("failed to bind UDP socket: {e}")))?;
        socket
            .connect(server)
            .await
            .map_err(|e| transport_err(server, format!("failed to connect: {e}")))?;
        socket
            .send(payload)
            .await
            .map_err(|e| transport_err(server, format!("failed to send query: {e}")))?;

        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let received = socket
            .recv(&mut buf)
            .await
            .map_err(|e| transport_err(server, format!("failed to receive response: {e}")))?;
        buf.truncate(received);
        Ok(buf)
    }

    async fn exchange_tcp(
        &self,
        payload: &[u8],
        server: SocketAddr,
    ) -> Result<Vec<u8>, DomainError> {
        let mut stream = TcpStream::connect(server)
            .await
            .map_err(|e| transport_err(server, format!("failed to connect: {e}")))?;

        let frame_len = u16::try_from(payload.len())
            .map_err(|_| DomainError::ProtocolError("query exceeds 64KiB".into()))?;
        stream
            .write_all(&frame_len.to_be_bytes())
            .await
            .map_err(|e| transport_err(server, format!("failed to send query: {e}")))?;
        stream
            .write_all(payload)
            .await
            .map_err(|e| transport_err(server, format!("failed to send query: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| transport_err(server, format!("failed to send query: {e}")))?;

        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| transport_err(server, format!("failed to read response length: {e}")))?;
        let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|e| transport_err(server, format!("failed to read response: {e}")))?;
        Ok(response)
    }
}

#[async_trait]
impl Exchanger for NetExchanger {
    async fn exchange(
        &self,
        request: &Message,
        server: SocketAddr,
        tcp: bool,
    ) -> Result<Message, DomainError> {
        let payload = request
            .to_vec()
            .map_err(|e| DomainError::ProtocolError(format!("failed to encode query: {e}")))?;

        let exchange = async {
            let bytes = if tcp {
                self.exchange_tcp(&payload, server).await?
            } else {
                self.exchange_udp(&payload, server).await?
            };
            Message::from_vec(&bytes)
                .map_err(|e| DomainError::ProtocolError(format!("malformed reply from {server}: {e}")))
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| DomainError::QueryTimeout {
                server: server.to_string(),
            })??;

        if reply.id() != request.id() {
            return Err(DomainError::ProtocolError(format!(
                "reply ID {} does not match query ID {} from {server}",
                reply.id(),
                request.id()
            )));
        }

        debug!(
            server = %server,
            rcode = ?reply.response_code(),
            answers = reply.answers().len(),
            tcp,
            "upstream exchange complete"
        );
        Ok(reply)
    }
}

fn transport_err(server: SocketAddr, reason: String) -> DomainError {
    DomainError::TransportError {
        server: server.to_string(),
        reason,
    }
}
