//! # STUN Discovery
//!
//! Finds the public address the NAT maps our UDP transport socket to.
//! Queries go out through the shared [`UdpEndpoint`] so the discovered
//! mapping belongs to the port peers will actually punch at.
//!
//! Each configured server is tried in turn with the backoff schedule
//! 500 ms, 1 s, 2 s, 4 s, 8 s, 16 s (abandon after six sends). A reply
//! is accepted only if it is a well-formed STUN message (length and
//! magic cookie), a Binding success response, and carries the
//! transaction id we sent; anything else is ignored without advancing
//! the retry counter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use stun::addr::MappedAddress;
use stun::agent::TransactionId;
use stun::message::{Getter, Message, BINDING_REQUEST, BINDING_SUCCESS};
use stun::xoraddr::XorMappedAddress;

use crate::error::{Error, Result};
use crate::transport::udp::UdpEndpoint;

/// Send schedule: wait this long after each send before giving up on it.
const BACKOFF: [Duration; 6] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

/// STUN client bound to the node's UDP transport socket.
pub struct StunClient {
    endpoint: Arc<UdpEndpoint>,
    /// `host:port` server addresses, tried in order
    servers: Vec<String>,
}

impl StunClient {
    pub fn new(endpoint: Arc<UdpEndpoint>, servers: Vec<String>) -> Self {
        Self { endpoint, servers }
    }

    /// Discover our public address: first server to answer wins.
    pub async fn discover(&self) -> Result<SocketAddr> {
        if self.servers.is_empty() {
            return Err(Error::Stun("no stun servers configured".into()));
        }
        let mut last_err = Error::Stun("no servers tried".into());
        for server in &self.servers {
            match self.query(server).await {
                Ok(addr) => {
                    tracing::info!(%addr, server, "stun discovered public address");
                    return Ok(addr);
                }
                Err(e) => {
                    tracing::debug!(server, error = %e, "stun server failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn query(&self, server: &str) -> Result<SocketAddr> {
        let server_addr = tokio::net::lookup_host(server)
            .await?
            .next()
            .ok_or_else(|| Error::Stun(format!("cannot resolve {server}")))?;

        let mut request = Message::new();
        let transaction_id = TransactionId::new();
        request
            .build(&[Box::new(transaction_id), Box::new(BINDING_REQUEST)])
            .map_err(|e| Error::Stun(format!("build binding request: {e}")))?;

        let (tx, mut rx) = mpsc::channel(8);
        self.endpoint.set_stun_sink(Some(tx));
        let result = self
            .exchange(&request.raw, transaction_id, server_addr, &mut rx)
            .await;
        self.endpoint.set_stun_sink(None);
        result
    }

    async fn exchange(
        &self,
        request: &[u8],
        transaction_id: TransactionId,
        server: SocketAddr,
        rx: &mut mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    ) -> Result<SocketAddr> {
        for window in BACKOFF {
            self.endpoint.send_raw(request, server).await?;
            let deadline = tokio::time::Instant::now() + window;
            loop {
                let reply = match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(reply)) => reply,
                    Ok(None) => return Err(Error::Stun("endpoint closed".into())),
                    // Window elapsed; advance to the next send.
                    Err(_) => break,
                };
                match parse_binding_response(&reply.1, transaction_id) {
                    Ok(addr) => return Ok(addr),
                    Err(e) => {
                        // Wrong transaction id or class: ignored, same window.
                        tracing::trace!(error = %e, "ignoring stun reply");
                    }
                }
            }
        }
        Err(Error::Stun(format!("{server} did not answer after {} sends", BACKOFF.len())))
    }
}

/// Validate a candidate reply and extract the mapped address.
fn parse_binding_response(bytes: &[u8], expected_id: TransactionId) -> Result<SocketAddr> {
    if !stun::message::is_message(bytes) {
        return Err(Error::Stun("not a stun message".into()));
    }
    let mut message = Message::new();
    message
        .unmarshal_binary(bytes)
        .map_err(|e| Error::Stun(format!("unmarshal: {e}")))?;
    if message.transaction_id != expected_id {
        return Err(Error::Stun("transaction id mismatch".into()));
    }
    if message.typ != BINDING_SUCCESS {
        return Err(Error::Stun(format!("unexpected message type {}", message.typ)));
    }

    let mut xor_addr = XorMappedAddress::default();
    if xor_addr.get_from(&message).is_ok() {
        return Ok(SocketAddr::new(xor_addr.ip, xor_addr.port));
    }
    let mut mapped = MappedAddress::default();
    mapped
        .get_from(&message)
        .map_err(|e| Error::Stun(format!("no mapped address: {e}")))?;
    Ok(SocketAddr::new(mapped.ip, mapped.port))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    /// A loopback STUN server answering binding requests; optionally
    /// sends garbage or mismatched ids first to exercise validation.
    async fn mock_server(ignore_first: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            let mut first = true;
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else { break };
                let mut request = Message::new();
                if request.unmarshal_binary(&buf[..n]).is_err() {
                    continue;
                }

                if ignore_first && first {
                    first = false;
                    // Reply with a *wrong* transaction id; the client
                    // must ignore it and succeed on the retry.
                    let mut bogus = Message::new();
                    bogus
                        .build(&[
                            Box::new(TransactionId::new()),
                            Box::new(BINDING_SUCCESS),
                            Box::new(XorMappedAddress { ip: from.ip(), port: from.port() }),
                        ])
                        .unwrap();
                    let _ = socket.send_to(&bogus.raw, from).await;
                    continue;
                }

                let mut response = Message::new();
                response
                    .build(&[
                        Box::new(request.transaction_id),
                        Box::new(BINDING_SUCCESS),
                        Box::new(XorMappedAddress { ip: from.ip(), port: from.port() }),
                    ])
                    .unwrap();
                let _ = socket.send_to(&response.raw, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_discover_against_mock_server() {
        let server = mock_server(false).await;
        let (endpoint, _accept) = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let client = StunClient::new(endpoint.clone(), vec![server.to_string()]);
        let addr = client.discover().await.unwrap();
        // On loopback the "mapped" address is just our socket.
        assert_eq!(addr, endpoint.local_addr());
        endpoint.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_transaction_id_ignored_then_retry_succeeds() {
        let server = mock_server(true).await;
        let (endpoint, _accept) = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let client = StunClient::new(endpoint.clone(), vec![server.to_string()]);
        let addr = client.discover().await.unwrap();
        assert_eq!(addr, endpoint.local_addr());
        endpoint.shutdown();
    }

    #[tokio::test]
    async fn test_no_servers_is_an_error() {
        let (endpoint, _accept) = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = StunClient::new(endpoint.clone(), vec![]);
        assert!(client.discover().await.is_err());
        endpoint.shutdown();
    }

    #[test]
    fn test_parse_rejects_non_stun_bytes() {
        let err = parse_binding_response(b"junk", TransactionId::new()).unwrap_err();
        assert_eq!(err.kind(), "stun");
    }

    #[test]
    fn test_parse_rejects_request_class() {
        let id = TransactionId::new();
        let mut msg = Message::new();
        msg.build(&[Box::new(id), Box::new(BINDING_REQUEST)]).unwrap();
        let err = parse_binding_response(&msg.raw, id).unwrap_err();
        assert!(err.to_string().contains("unexpected message type"));
    }
}
