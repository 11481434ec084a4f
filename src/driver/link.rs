// Inter-container links: directional ACCEPT pairs that punch through the
// bridge-local DROP installed when ICC is disabled.

use std::net::Ipv4Addr;

use crate::error::BridgeResult;
use crate::firewall::Firewall;
use crate::types::{PortBinding, Protocol};

/// One link: traffic from `from` may reach `to` on the published ports.
#[derive(Debug, Clone)]
pub struct Link {
    bridge: String,
    from: Ipv4Addr,
    to: Ipv4Addr,
    ports: Vec<(Protocol, u16)>,
}

impl Link {
    /// Build a link from the destination endpoint's published bindings; the
    /// accepted ports are the container ports.
    pub fn new(bridge: &str, from: Ipv4Addr, to: Ipv4Addr, bindings: &[PortBinding]) -> Self {
        Self {
            bridge: bridge.to_string(),
            from,
            to,
            ports: bindings
                .iter()
                .map(|b| (b.proto, b.container_port))
                .collect(),
        }
    }

    /// Install the ACLs for every port. If one install fails, the ports
    /// already enabled by this call are disabled before the error returns.
    pub async fn enable(&self, firewall: &Firewall) -> BridgeResult<()> {
        let mut enabled: Vec<(Protocol, u16)> = Vec::new();
        for &(proto, port) in &self.ports {
            if let Err(e) = firewall
                .allow_link(&self.bridge, self.from, self.to, proto, port)
                .await
            {
                for &(p, prt) in enabled.iter().rev() {
                    firewall
                        .deny_link(&self.bridge, self.from, self.to, p, prt)
                        .await;
                }
                return Err(e);
            }
            enabled.push((proto, port));
        }
        tracing::debug!(from = %self.from, to = %self.to, ports = self.ports.len(), "link enabled");
        Ok(())
    }

    /// Remove the ACLs. Never fails: removal errors are logged downstream.
    pub async fn disable(&self, firewall: &Firewall) {
        for &(proto, port) in &self.ports {
            firewall
                .deny_link(&self.bridge, self.from, self.to, proto, port)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::mem::MemBackend;
    use crate::firewall::Table;
    use std::sync::Arc;

    fn binding(proto: Protocol, container_port: u16) -> PortBinding {
        PortBinding {
            proto,
            container_ip: None,
            container_port,
            host_ip: None,
            host_port: 0,
            host_port_end: None,
        }
    }

    #[tokio::test]
    async fn enable_then_disable_restores_rule_set() {
        let backend = Arc::new(MemBackend::new());
        let firewall = Firewall::new(backend.clone());
        let link = Link::new(
            "br0",
            "172.20.0.2".parse().unwrap(),
            "172.20.0.3".parse().unwrap(),
            &[binding(Protocol::Tcp, 80), binding(Protocol::Udp, 53)],
        );

        link.enable(&firewall).await.unwrap();
        assert!(backend.has_rule(Table::Filter, "FORWARD", "--dport 80"));
        assert!(backend.has_rule(Table::Filter, "FORWARD", "--dport 53"));

        link.disable(&firewall).await;
        assert_eq!(backend.rule_count(), 0);
    }

    #[tokio::test]
    async fn partial_enable_is_rolled_back() {
        let backend = Arc::new(MemBackend::new());
        let firewall = Firewall::new(backend.clone());
        let link = Link::new(
            "br0",
            "172.20.0.2".parse().unwrap(),
            "172.20.0.3".parse().unwrap(),
            &[binding(Protocol::Tcp, 80), binding(Protocol::Udp, 53)],
        );

        backend.fail_matching("--dport 53");
        assert!(link.enable(&firewall).await.is_err());
        backend.clear_failures();
        assert_eq!(backend.rule_count(), 0);
    }
}
