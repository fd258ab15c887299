//! # NAT-PMP
//!
//! Port mapping against the default gateway per RFC 6886: a 2-byte
//! external-address request and 12-byte mapping requests over UDP to
//! port 5351, with the response's result code deciding success. Used as
//! the fallback when UPnP is unavailable.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

use super::{MappingMethod, PortMapping};
use crate::error::{Error, Result};
use crate::time::now_timestamp_millis;

/// NAT-PMP control port on the gateway.
const NATPMP_PORT: u16 = 5351;

/// Protocol version in every request.
const VERSION: u8 = 0;

/// Retry schedule per RFC 6886 (truncated).
const RETRY: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
];

/// Mapping protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmpProtocol {
    Udp,
    Tcp,
}

impl PmpProtocol {
    fn opcode(self) -> u8 {
        match self {
            PmpProtocol::Udp => 1,
            PmpProtocol::Tcp => 2,
        }
    }
}

/// NAT-PMP client talking to one gateway.
pub struct NatPmpClient {
    server: SocketAddr,
}

impl NatPmpClient {
    /// Client for the given gateway address.
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self { server: SocketAddr::new(IpAddr::V4(gateway), NATPMP_PORT) }
    }

    /// Client for an explicit server address (tests).
    pub fn with_server(server: SocketAddr) -> Self {
        Self { server }
    }

    /// Discover the gateway and confirm it speaks NAT-PMP.
    pub async fn probe() -> Result<Self> {
        let gateway =
            default_gateway().ok_or_else(|| Error::PortMapping("no gateway found".into()))?;
        let client = Self::new(gateway);
        client.external_address().await?;
        Ok(client)
    }

    /// The gateway's external IPv4 address.
    pub async fn external_address(&self) -> Result<Ipv4Addr> {
        let response = self.request(&[VERSION, 0], 12).await?;
        check_result(&response, 128)?;
        Ok(Ipv4Addr::new(response[8], response[9], response[10], response[11]))
    }

    /// Create (or renew) a mapping of `internal` to `external` for
    /// `lifetime` seconds.
    pub async fn map(
        &self,
        protocol: PmpProtocol,
        internal: u16,
        external: u16,
        lifetime: u32,
    ) -> Result<PortMapping> {
        let mut request = Vec::with_capacity(12);
        request.push(VERSION);
        request.push(protocol.opcode());
        request.extend_from_slice(&[0, 0]); // reserved
        request.extend_from_slice(&internal.to_be_bytes());
        request.extend_from_slice(&external.to_be_bytes());
        request.extend_from_slice(&lifetime.to_be_bytes());

        let response = self.request(&request, 16).await?;
        check_result(&response, 128 + protocol.opcode())?;

        let granted_external = u16::from_be_bytes([response[10], response[11]]);
        let granted_lifetime = u32::from_be_bytes([
            response[12],
            response[13],
            response[14],
            response[15],
        ]);
        let external_ip = self.external_address().await?;

        Ok(PortMapping {
            method: MappingMethod::NatPmp,
            external_ip: IpAddr::V4(external_ip),
            external_port: granted_external,
            internal_port: internal,
            expiry: now_timestamp_millis() + granted_lifetime as i64 * 1000,
        })
    }

    /// Delete the mapping for `internal` (lifetime 0 per the RFC).
    pub async fn unmap(&self, protocol: PmpProtocol, internal: u16) -> Result<()> {
        let mut request = Vec::with_capacity(12);
        request.push(VERSION);
        request.push(protocol.opcode());
        request.extend_from_slice(&[0, 0]);
        request.extend_from_slice(&internal.to_be_bytes());
        request.extend_from_slice(&0u16.to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes());

        let response = self.request(&request, 16).await?;
        check_result(&response, 128 + protocol.opcode())
    }

    async fn request(&self, request: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.server).await?;
        let mut buf = vec![0u8; 64];
        for window in RETRY {
            socket.send(request).await?;
            match tokio::time::timeout(window, socket.recv(&mut buf)).await {
                Ok(Ok(n)) if n >= expected_len => return Ok(buf[..n].to_vec()),
                Ok(Ok(_)) => continue,
                // ICMP unreachable surfaces as a recv error; retry like
                // a lost datagram.
                Ok(Err(_)) => tokio::time::sleep(window).await,
                Err(_) => continue,
            }
        }
        Err(Error::PortMapping(format!("{} did not answer", self.server)))
    }
}

/// Version, opcode, and result-code checks shared by every response.
fn check_result(response: &[u8], expected_opcode: u8) -> Result<()> {
    if response.len() < 4 {
        return Err(Error::PortMapping("short nat-pmp response".into()));
    }
    if response[0] != VERSION {
        return Err(Error::PortMapping(format!("nat-pmp version {}", response[0])));
    }
    if response[1] != expected_opcode {
        return Err(Error::PortMapping(format!(
            "nat-pmp opcode {} (wanted {expected_opcode})",
            response[1]
        )));
    }
    let result = u16::from_be_bytes([response[2], response[3]]);
    if result != 0 {
        return Err(Error::PortMapping(format!("nat-pmp result code {result}")));
    }
    Ok(())
}

/// The IPv4 default gateway: `/proc/net/route` where available, else the
/// `.1` of whatever interface routes externally.
pub fn default_gateway() -> Option<Ipv4Addr> {
    #[cfg(target_os = "linux")]
    if let Ok(route) = std::fs::read_to_string("/proc/net/route") {
        for line in route.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Destination 00000000 is the default route; gateway is
            // little-endian hex.
            if fields.len() >= 3 && fields[1] == "00000000" {
                if let Ok(raw) = u32::from_str_radix(fields[2], 16) {
                    let bytes = raw.to_le_bytes();
                    let gw = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
                    if !gw.is_unspecified() {
                        return Some(gw);
                    }
                }
            }
        }
    }

    let local = local_ipv4()?;
    let octets = local.octets();
    Some(Ipv4Addr::new(octets[0], octets[1], octets[2], 1))
}

/// Our outbound IPv4 address, learned from a connected (but unsent) UDP
/// socket.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Mock gateway answering external-address and mapping requests.
    async fn mock_gateway() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else { break };
                if n < 2 || buf[0] != VERSION {
                    continue;
                }
                let response = match buf[1] {
                    0 => {
                        // External address: 93.184.216.34, epoch 7.
                        let mut r = vec![VERSION, 128, 0, 0, 0, 0, 0, 7];
                        r.extend_from_slice(&[93, 184, 216, 34]);
                        r
                    }
                    op @ (1 | 2) if n >= 12 => {
                        let internal = [buf[4], buf[5]];
                        let external = [buf[6], buf[7]];
                        let lifetime = [buf[8], buf[9], buf[10], buf[11]];
                        let mut r = vec![VERSION, 128 + op, 0, 0, 0, 0, 0, 7];
                        r.extend_from_slice(&internal);
                        // Echo the requested external port, or pick one
                        // for a zero request.
                        if external == [0, 0] && lifetime != [0, 0, 0, 0] {
                            r.extend_from_slice(&40000u16.to_be_bytes());
                        } else {
                            r.extend_from_slice(&external);
                        }
                        r.extend_from_slice(&lifetime);
                        r
                    }
                    _ => continue,
                };
                let _ = socket.send_to(&response, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_external_address() {
        let gateway = mock_gateway().await;
        let client = NatPmpClient::with_server(gateway);
        let ip = client.external_address().await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(93, 184, 216, 34));
    }

    #[tokio::test]
    async fn test_map_round_trip() {
        let gateway = mock_gateway().await;
        let client = NatPmpClient::with_server(gateway);

        let mapping = client
            .map(PmpProtocol::Tcp, 4001, 4001, 3600)
            .await
            .unwrap();
        assert_eq!(mapping.method, MappingMethod::NatPmp);
        assert_eq!(mapping.internal_port, 4001);
        assert_eq!(mapping.external_port, 4001);
        assert_eq!(mapping.external_ip, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert!(mapping.expiry > now_timestamp_millis());

        client.unmap(PmpProtocol::Tcp, 4001).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_gateway_times_out() {
        // Port that nothing listens on; all retries elapse.
        let client = NatPmpClient::with_server("127.0.0.1:1".parse().unwrap());
        let err = client.external_address().await.unwrap_err();
        assert_eq!(err.kind(), "port-mapping");
    }

    #[test]
    fn test_check_result_rejections() {
        assert!(check_result(&[0, 128], 128).is_err()); // short
        assert!(check_result(&[1, 128, 0, 0], 128).is_err()); // version
        assert!(check_result(&[0, 129, 0, 0], 128).is_err()); // opcode
        assert!(check_result(&[0, 128, 0, 3], 128).is_err()); // result code
        assert!(check_result(&[0, 128, 0, 0], 128).is_ok());
    }
}
