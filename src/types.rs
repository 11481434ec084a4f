// Wire-level and API-level value types shared across the driver:
// protocols, port bindings, MAC addresses, and the sandbox interface
// descriptor returned from endpoint creation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// L4 protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(BridgeError::InvalidEndpointConfig(format!(
                "unknown protocol: {}",
                other
            ))),
        }
    }
}

/// A 6-byte hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// True if the locally-administered bit is set and the address is unicast.
    pub fn is_local_unicast(&self) -> bool {
        self.0[0] & 0x02 != 0 && self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for slot in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| {
                BridgeError::InvalidEndpointConfig(format!("malformed MAC address: {}", s))
            })?;
            *slot = u8::from_str_radix(part, 16).map_err(|_| {
                BridgeError::InvalidEndpointConfig(format!("malformed MAC address: {}", s))
            })?;
        }
        if parts.next().is_some() {
            return Err(BridgeError::InvalidEndpointConfig(format!(
                "malformed MAC address: {}",
                s
            )));
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A requested or realized port publication.
///
/// A requested binding may leave `host_port` as 0 (auto-assign) or give a
/// `host_port_end` to form an inclusive range; the realized binding returned
/// by the port mapper always carries the concrete host IP and port chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub proto: Protocol,
    #[serde(default)]
    pub container_ip: Option<IpAddr>,
    pub container_port: u16,
    #[serde(default)]
    pub host_ip: Option<IpAddr>,
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub host_port_end: Option<u16>,
}

impl PortBinding {
    /// The inclusive host-port range this binding may be realized on.
    /// `None` means the port is drawn from the ephemeral pool.
    pub fn host_range(&self) -> Option<(u16, u16)> {
        match (self.host_port, self.host_port_end) {
            (0, _) => None,
            (p, None) => Some((p, p)),
            (p, Some(end)) => Some((p, end.max(p))),
        }
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> host {}:{}",
            self.container_port,
            self.proto,
            self.host_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "*".to_string()),
            self.host_port
        )
    }
}

/// Description of the sandbox-side interface produced by endpoint creation.
/// The sandbox collaborator moves `src_name` into the container namespace and
/// renames it to `dst_name`.
#[derive(Debug, Clone)]
pub struct SandboxInterface {
    pub src_name: String,
    pub dst_name: String,
    pub address: Ipv4Net,
    pub address_v6: Option<Ipv6Net>,
    pub mac: MacAddr,
}

/// Return value of `CreateEndpoint`: the interfaces to plumb into the sandbox
/// plus the gateways the sandbox should route through.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub interfaces: Vec<SandboxInterface>,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
}

/// User-supplied endpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointOptions {
    #[serde(default)]
    pub mac_address: Option<MacAddr>,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
}

impl EndpointOptions {
    /// Decode a generic option blob. Absent options mean defaults.
    pub fn decode(options: Option<&serde_json::Value>) -> BridgeResult<Self> {
        match options {
            None => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                BridgeError::InvalidEndpointConfig(format!("bad endpoint options: {}", e))
            }),
        }
    }
}

/// Container configuration passed at join/leave time: the endpoint ids whose
/// link (ACL) programming must be computed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerOptions {
    #[serde(default)]
    pub parent_endpoints: Vec<String>,
    #[serde(default)]
    pub child_endpoints: Vec<String>,
}

impl ContainerOptions {
    /// Decode a generic option blob. `None` means no link programming at all.
    pub fn decode(options: Option<&serde_json::Value>) -> BridgeResult<Option<Self>> {
        match options {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    BridgeError::InvalidEndpointConfig(format!("bad container options: {}", e))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_roundtrip() {
        let mac: MacAddr = "02:42:ac:11:00:02".parse().unwrap();
        assert_eq!(mac.to_string(), "02:42:ac:11:00:02");
        assert!(mac.is_local_unicast());
    }

    #[test]
    fn mac_rejects_garbage() {
        assert!("02:42:ac:11:00".parse::<MacAddr>().is_err());
        assert!("02:42:ac:11:00:02:aa".parse::<MacAddr>().is_err());
        assert!("zz:42:ac:11:00:02".parse::<MacAddr>().is_err());
    }

    #[test]
    fn endpoint_options_decode() {
        let blob = serde_json::json!({
            "mac_address": "02:aa:bb:cc:dd:ee",
            "port_bindings": [
                {"proto": "tcp", "container_port": 80, "host_port": 8080}
            ]
        });
        let opts = EndpointOptions::decode(Some(&blob)).unwrap();
        assert_eq!(opts.mac_address.unwrap().octets()[0], 0x02);
        assert_eq!(opts.port_bindings.len(), 1);
        assert_eq!(opts.port_bindings[0].host_range(), Some((8080, 8080)));
    }

    #[test]
    fn endpoint_options_absent_means_default() {
        let opts = EndpointOptions::decode(None).unwrap();
        assert!(opts.mac_address.is_none());
        assert!(opts.port_bindings.is_empty());
    }

    #[test]
    fn port_binding_ranges() {
        let mut b = PortBinding {
            proto: Protocol::Tcp,
            container_ip: None,
            container_port: 80,
            host_ip: None,
            host_port: 0,
            host_port_end: None,
        };
        assert_eq!(b.host_range(), None);
        b.host_port = 8080;
        b.host_port_end = Some(8090);
        assert_eq!(b.host_range(), Some((8080, 8090)));
    }

    #[test]
    fn container_options_decode() {
        let blob = serde_json::json!({"parent_endpoints": ["ep1"], "child_endpoints": []});
        let cc = ContainerOptions::decode(Some(&blob)).unwrap().unwrap();
        assert_eq!(cc.parent_endpoints, vec!["ep1".to_string()]);
        assert!(ContainerOptions::decode(None).unwrap().is_none());
    }
}
