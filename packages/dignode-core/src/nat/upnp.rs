//! # UPnP Port Mapping
//!
//! The first-choice mapping method: discover the Internet Gateway Device
//! over SSDP, fetch its description document, and drive the
//! `WANIPConnection` service with SOAP `AddPortMapping` /
//! `DeletePortMapping` / `GetExternalIPAddress` calls.
//!
//! The gateway's XML is mined with plain tag extraction; the handful of
//! fields these documents carry does not justify an XML stack.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

use super::{MappingMethod, PortMapping};
use crate::error::{Error, Result};
use crate::time::now_timestamp_millis;

/// SSDP multicast address.
const SSDP_ADDR: &str = "239.255.255.250:1900";

/// Device types that answer for internet gateways.
const GATEWAY_SEARCH_TARGETS: [&str; 2] = [
    "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
    "urn:schemas-upnp-org:device:InternetGatewayDevice:2",
];

/// WAN services that expose port mapping actions.
const WAN_SERVICE_TYPES: [&str; 2] = [
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// Mapping protocol selector, as SOAP spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpnpProtocol {
    Tcp,
    Udp,
}

impl UpnpProtocol {
    fn as_str(self) -> &'static str {
        match self {
            UpnpProtocol::Tcp => "TCP",
            UpnpProtocol::Udp => "UDP",
        }
    }
}

/// A discovered gateway's mapping service.
pub struct UpnpClient {
    control_url: String,
    service_type: String,
    local_ip: Ipv4Addr,
    http: reqwest::Client,
}

impl UpnpClient {
    /// Multicast an SSDP search, follow the first gateway's description,
    /// and locate its WAN connection service.
    pub async fn discover(timeout: Duration) -> Result<Self> {
        let location = ssdp_search(timeout).await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::PortMapping(format!("http client: {e}")))?;

        let description = http
            .get(&location)
            .send()
            .await
            .map_err(|e| Error::PortMapping(format!("fetch {location}: {e}")))?
            .text()
            .await
            .map_err(|e| Error::PortMapping(format!("read description: {e}")))?;

        let (service_type, control_path) = find_wan_service(&description)
            .ok_or_else(|| Error::PortMapping("gateway has no WAN connection service".into()))?;
        let control_url = resolve_control_url(&location, &control_path)?;

        let local_ip = super::natpmp::local_ipv4()
            .ok_or_else(|| Error::PortMapping("no local ipv4 address".into()))?;

        tracing::debug!(control_url, service_type, "upnp gateway discovered");
        Ok(Self { control_url, service_type, local_ip, http })
    }

    /// `GetExternalIPAddress`.
    pub async fn external_ip(&self) -> Result<IpAddr> {
        let body = self.soap("GetExternalIPAddress", "").await?;
        let ip = extract_tag(&body, "NewExternalIPAddress")
            .ok_or_else(|| Error::PortMapping("no NewExternalIPAddress in response".into()))?;
        ip.parse()
            .map_err(|e| Error::PortMapping(format!("bad external ip {ip:?}: {e}")))
    }

    /// `AddPortMapping` of `external` to our `internal` port.
    pub async fn add_port_mapping(
        &self,
        protocol: UpnpProtocol,
        external: u16,
        internal: u16,
        lifetime_s: u32,
        description: &str,
    ) -> Result<PortMapping> {
        let arguments = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol>\
             <NewInternalPort>{internal}</NewInternalPort>\
             <NewInternalClient>{}</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{description}</NewPortMappingDescription>\
             <NewLeaseDuration>{lifetime_s}</NewLeaseDuration>",
            protocol.as_str(),
            self.local_ip,
        );
        self.soap("AddPortMapping", &arguments).await?;
        let external_ip = self.external_ip().await?;
        Ok(PortMapping {
            method: MappingMethod::Upnp,
            external_ip,
            external_port: external,
            internal_port: internal,
            expiry: now_timestamp_millis() + lifetime_s as i64 * 1000,
        })
    }

    /// Best-effort `DeletePortMapping`.
    pub async fn delete_port_mapping(
        &self,
        protocol: UpnpProtocol,
        external: u16,
    ) -> Result<()> {
        let arguments = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol>",
            protocol.as_str(),
        );
        self.soap("DeletePortMapping", &arguments).await?;
        Ok(())
    }

    async fn soap(&self, action: &str, arguments: &str) -> Result<String> {
        let envelope = format!(
            "<?xml version=\"1.0\"?>\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
             <s:Body><u:{action} xmlns:u=\"{}\">{arguments}</u:{action}></s:Body>\
             </s:Envelope>",
            self.service_type,
        );
        let response = self
            .http
            .post(&self.control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{action}\"", self.service_type))
            .body(envelope)
            .send()
            .await
            .map_err(|e| Error::PortMapping(format!("{action}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::PortMapping(format!("{action} body: {e}")))?;
        if !status.is_success() {
            let detail = extract_tag(&body, "errorDescription").unwrap_or_default();
            return Err(Error::PortMapping(format!("{action} failed ({status}): {detail}")));
        }
        Ok(body)
    }
}

/// Send M-SEARCH and return the first gateway's description LOCATION.
async fn ssdp_search(timeout: Duration) -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    for target in GATEWAY_SEARCH_TARGETS {
        let request = format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {SSDP_ADDR}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 2\r\n\
             ST: {target}\r\n\r\n"
        );
        if let Err(e) = socket.send_to(request.as_bytes(), SSDP_ADDR).await {
            return Err(Error::PortMapping(format!("ssdp send: {e}")));
        }
    }

    let mut buf = vec![0u8; 2048];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::PortMapping("no gateway answered ssdp".into()))??;
        let response = String::from_utf8_lossy(&buf[..len]);
        if let Some(location) = parse_ssdp_location(&response) {
            tracing::debug!(%from, location, "ssdp gateway answered");
            return Ok(location);
        }
    }
}

/// Pull the LOCATION header out of an SSDP response.
fn parse_ssdp_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Find the first WAN connection service and its control URL path.
fn find_wan_service(description: &str) -> Option<(String, String)> {
    for service_type in WAN_SERVICE_TYPES {
        let Some(type_pos) = description.find(service_type) else { continue };
        // The controlURL for this service follows its serviceType tag.
        let rest = &description[type_pos..];
        if let Some(control) = extract_tag(rest, "controlURL") {
            return Some((service_type.to_string(), control.to_string()));
        }
    }
    None
}

/// Join the description URL's origin with the control path.
fn resolve_control_url(location: &str, control_path: &str) -> Result<String> {
    if control_path.starts_with("http://") || control_path.starts_with("https://") {
        return Ok(control_path.to_string());
    }
    let scheme_end = location
        .find("://")
        .ok_or_else(|| Error::PortMapping(format!("bad location {location:?}")))?;
    let origin_end = location[scheme_end + 3..]
        .find('/')
        .map(|i| scheme_end + 3 + i)
        .unwrap_or(location.len());
    let origin = &location[..origin_end];
    if control_path.starts_with('/') {
        Ok(format!("{origin}{control_path}"))
    } else {
        Ok(format!("{origin}/{control_path}"))
    }
}

/// First occurrence of `<tag>…</tag>`, trimmed.
fn extract_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/upnp/control/layer3</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
        <controlURL>/upnp/control/wanip</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_ssdp_location() {
        let response = "HTTP/1.1 200 OK\r\n\
                        CACHE-CONTROL: max-age=120\r\n\
                        LOCATION: http://192.168.1.1:5000/rootDesc.xml\r\n\
                        ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\r\n";
        assert_eq!(
            parse_ssdp_location(response).unwrap(),
            "http://192.168.1.1:5000/rootDesc.xml"
        );
        assert!(parse_ssdp_location("HTTP/1.1 200 OK\r\n\r\n").is_none());
    }

    #[test]
    fn test_find_wan_service_skips_other_services() {
        let (service_type, control) = find_wan_service(DESCRIPTION).unwrap();
        assert_eq!(service_type, "urn:schemas-upnp-org:service:WANIPConnection:1");
        assert_eq!(control, "/upnp/control/wanip");
    }

    #[test]
    fn test_find_wan_service_missing() {
        assert!(find_wan_service("<root></root>").is_none());
    }

    #[test]
    fn test_resolve_control_url() {
        assert_eq!(
            resolve_control_url("http://192.168.1.1:5000/rootDesc.xml", "/control").unwrap(),
            "http://192.168.1.1:5000/control"
        );
        assert_eq!(
            resolve_control_url("http://192.168.1.1:5000/rootDesc.xml", "control").unwrap(),
            "http://192.168.1.1:5000/control"
        );
        assert_eq!(
            resolve_control_url(
                "http://192.168.1.1:5000/rootDesc.xml",
                "http://192.168.1.1:5001/other"
            )
            .unwrap(),
            "http://192.168.1.1:5001/other"
        );
    }

    #[test]
    fn test_extract_tag() {
        let xml = "<a><NewExternalIPAddress> 93.184.216.34 </NewExternalIPAddress></a>";
        assert_eq!(extract_tag(xml, "NewExternalIPAddress").unwrap(), "93.184.216.34");
        assert!(extract_tag(xml, "Missing").is_none());
    }

    /// Serve canned SOAP responses over a bare TCP listener; enough HTTP
    /// for reqwest.
    async fn mock_control_server(body: &'static str) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = vec![0u8; 8192];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_external_ip_soap_round_trip() {
        let body = "<?xml version=\"1.0\"?><s:Envelope><s:Body>\
                    <u:GetExternalIPAddressResponse>\
                    <NewExternalIPAddress>93.184.216.34</NewExternalIPAddress>\
                    </u:GetExternalIPAddressResponse>\
                    </s:Body></s:Envelope>";
        let addr = mock_control_server(body).await;
        let client = UpnpClient {
            control_url: format!("http://{addr}/control"),
            service_type: WAN_SERVICE_TYPES[0].to_string(),
            local_ip: Ipv4Addr::new(192, 168, 1, 50),
            http: reqwest::Client::new(),
        };
        let ip = client.external_ip().await.unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_add_port_mapping_builds_mapping() {
        let body = "<?xml version=\"1.0\"?><s:Envelope><s:Body>\
                    <u:AddPortMappingResponse></u:AddPortMappingResponse>\
                    <NewExternalIPAddress>93.184.216.34</NewExternalIPAddress>\
                    </s:Body></s:Envelope>";
        let addr = mock_control_server(body).await;
        let client = UpnpClient {
            control_url: format!("http://{addr}/control"),
            service_type: WAN_SERVICE_TYPES[0].to_string(),
            local_ip: Ipv4Addr::new(192, 168, 1, 50),
            http: reqwest::Client::new(),
        };
        let mapping = client
            .add_port_mapping(UpnpProtocol::Tcp, 40000, 4000, 3600, "dignode")
            .await
            .unwrap();
        assert_eq!(mapping.method, MappingMethod::Upnp);
        assert_eq!(mapping.external_port, 40000);
        assert_eq!(mapping.internal_port, 4000);
    }
}
