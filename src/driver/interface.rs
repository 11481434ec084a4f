// The bridge's L3 interface record: device name, assigned addresses and the
// gateways endpoints are handed at creation time.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::BridgeResult;
use crate::netlink::NetOps;

/// Link-local address carried by every IPv6-enabled bridge.
pub const BRIDGE_LINK_LOCAL: &str = "fe80::1/64";

#[derive(Debug, Clone)]
pub struct BridgeInterface {
    pub name: String,
    /// IPv4 address/prefix assigned to the bridge.
    pub address_v4: Option<Ipv4Net>,
    /// Global IPv6 address/prefix assigned to the bridge (the sub-CIDR
    /// gateway), distinct from the fixed link-local address.
    pub address_v6: Option<Ipv6Net>,
    gateway_v4_override: Option<Ipv4Addr>,
    gateway_v6_override: Option<Ipv6Addr>,
}

impl BridgeInterface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address_v4: None,
            address_v6: None,
            gateway_v4_override: None,
            gateway_v6_override: None,
        }
    }

    pub async fn exists(&self, kernel: &dyn NetOps) -> BridgeResult<bool> {
        kernel.link_exists(&self.name).await
    }

    /// Record a configured default-gateway override.
    pub fn set_gateway_v4(&mut self, gw: Ipv4Addr) {
        self.gateway_v4_override = Some(gw);
    }

    pub fn set_gateway_v6(&mut self, gw: Ipv6Addr) {
        self.gateway_v6_override = Some(gw);
    }

    /// The gateway handed to endpoints: the configured override when present,
    /// otherwise the bridge's own address.
    pub fn gateway_v4(&self) -> Option<Ipv4Addr> {
        self.gateway_v4_override
            .or_else(|| self.address_v4.map(|net| net.addr()))
    }

    pub fn gateway_v6(&self) -> Option<Ipv6Addr> {
        self.gateway_v6_override
            .or_else(|| self.address_v6.map(|net| net.addr()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_falls_back_to_bridge_address() {
        let mut iface = BridgeInterface::new("br0");
        assert_eq!(iface.gateway_v4(), None);

        iface.address_v4 = Some("172.20.0.1/16".parse().unwrap());
        assert_eq!(iface.gateway_v4(), Some("172.20.0.1".parse().unwrap()));

        iface.set_gateway_v4("172.20.0.254".parse().unwrap());
        assert_eq!(iface.gateway_v4(), Some("172.20.0.254".parse().unwrap()));
    }
}
