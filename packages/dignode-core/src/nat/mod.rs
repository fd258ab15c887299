//! # NAT Traversal
//!
//! Everything needed to get packets flowing between two NATted nodes:
//! public-address discovery (STUN), router port mappings (UPnP, NAT-PMP),
//! and coordinated hole punching over mesh signaling.

pub mod natpmp;
pub mod punch;
pub mod stun;
pub mod upnp;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Error, Result};
use crate::time::now_timestamp_millis;

/// Which addresses signaling may carry. Loopback and RFC1918 ranges are
/// rejected unless a deployment explicitly allows them.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressPolicy {
    pub allow_private: bool,
    pub allow_loopback: bool,
}

impl AddressPolicy {
    pub fn from_config(config: &crate::config::NodeConfig) -> Self {
        Self {
            allow_private: config.allow_private_addresses,
            allow_loopback: config.allow_loopback_addresses,
        }
    }

    /// Permissive policy for single-host tests.
    pub fn permissive() -> Self {
        Self { allow_private: true, allow_loopback: true }
    }
}

/// RFC1918 check (10/8, 172.16/12, 192.168/16).
fn is_rfc1918(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

/// Validate a peer-supplied address against the policy.
pub fn validate_ip(ip: &IpAddr, policy: &AddressPolicy) -> Result<()> {
    if ip.is_loopback() && !policy.allow_loopback {
        return Err(Error::AddressRejected(format!("loopback address {ip}")));
    }
    if let IpAddr::V4(v4) = ip {
        if is_rfc1918(v4) && !policy.allow_private {
            return Err(Error::AddressRejected(format!("private-range address {ip}")));
        }
    }
    if ip.is_unspecified() {
        return Err(Error::AddressRejected(format!("unspecified address {ip}")));
    }
    Ok(())
}

/// Ports below the ephemeral floor are refused in signaling.
pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        return Err(Error::AddressRejected(format!("port {port} below 1024")));
    }
    Ok(())
}

// ============================================================================
// PORT MAPPINGS
// ============================================================================

/// How a mapping was created, and therefore how to renew and delete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingMethod {
    Upnp,
    NatPmp,
}

/// A router port mapping held by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub method: MappingMethod,
    pub external_ip: IpAddr,
    pub external_port: u16,
    pub internal_port: u16,
    /// Unix millis when the router forgets the mapping
    pub expiry: i64,
}

impl PortMapping {
    /// When renewal should run: five minutes before expiry, clamped to
    /// now for very short leases.
    pub fn renew_at(&self) -> i64 {
        (self.expiry - 5 * 60 * 1000).max(now_timestamp_millis())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> AddressPolicy {
        AddressPolicy::default()
    }

    #[test]
    fn test_loopback_rejected_by_default() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(validate_ip(&ip, &strict()).is_err());
        assert!(validate_ip(&ip, &AddressPolicy::permissive()).is_ok());
    }

    #[test]
    fn test_private_ranges_rejected_by_default() {
        for addr in ["10.1.2.3", "172.16.0.9", "172.31.255.1", "192.168.1.1"] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(validate_ip(&ip, &strict()).is_err(), "{addr} should be rejected");
            assert!(validate_ip(&ip, &AddressPolicy::permissive()).is_ok());
        }
        // 172.32/12 is outside the private block.
        let ip: IpAddr = "172.32.0.1".parse().unwrap();
        assert!(validate_ip(&ip, &strict()).is_ok());
    }

    #[test]
    fn test_public_address_accepted() {
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(validate_ip(&ip, &strict()).is_ok());
    }

    #[test]
    fn test_unspecified_always_rejected() {
        let ip: IpAddr = "0.0.0.0".parse().unwrap();
        assert!(validate_ip(&ip, &AddressPolicy::permissive()).is_err());
    }

    #[test]
    fn test_port_floor() {
        assert!(validate_port(1023).is_err());
        assert!(validate_port(1024).is_ok());
        assert!(validate_port(65535).is_ok());
    }

    #[test]
    fn test_mapping_renewal_before_expiry() {
        let mapping = PortMapping {
            method: MappingMethod::Upnp,
            external_ip: "93.184.216.34".parse().unwrap(),
            external_port: 40000,
            internal_port: 4000,
            expiry: now_timestamp_millis() + 3_600_000,
        };
        let renew = mapping.renew_at();
        assert!(renew < mapping.expiry);
        assert_eq!(mapping.expiry - renew, 5 * 60 * 1000);
    }
}
