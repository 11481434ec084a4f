// Bridge setup pipeline: an ordered queue of idempotent steps applied at
// network creation, aborting at the first error. Each step relies only on
// configuration invariants plus what prior steps established, so partial
// re-runs after a failure are safe.

use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::config::Configuration;
use crate::driver::interface::{BridgeInterface, BRIDGE_LINK_LOCAL};
use crate::error::{BridgeError, BridgeResult};
use crate::firewall::Firewall;
use crate::ipam::IpAllocator;
use crate::netlink::NetOps;

/// One mutation of kernel or allocator state for the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Device,
    BridgeIpv4,
    BridgeIpv6,
    VerifyAndReconcile,
    FixedCidrV4,
    FixedCidrV6,
    IpTables,
    IpForwarding,
    GatewayIpv4,
    GatewayIpv6,
    DeviceUp,
}

/// Queued pipeline over (configuration, bridge interface).
pub struct BridgeSetup<'a> {
    config: &'a Configuration,
    iface: &'a mut BridgeInterface,
    kernel: &'a dyn NetOps,
    firewall: &'a Firewall,
    ipam: &'a IpAllocator,
    steps: Vec<SetupStep>,
}

impl<'a> BridgeSetup<'a> {
    pub fn new(
        config: &'a Configuration,
        iface: &'a mut BridgeInterface,
        kernel: &'a dyn NetOps,
        firewall: &'a Firewall,
        ipam: &'a IpAllocator,
    ) -> Self {
        Self {
            config,
            iface,
            kernel,
            firewall,
            ipam,
            steps: Vec::new(),
        }
    }

    pub fn queue_step(&mut self, step: SetupStep) {
        self.steps.push(step);
    }

    pub fn queued(&self) -> &[SetupStep] {
        &self.steps
    }

    /// Execute the queued steps in order, stopping at the first error.
    pub async fn apply(&mut self) -> BridgeResult<()> {
        let steps = std::mem::take(&mut self.steps);
        for step in steps {
            tracing::debug!(bridge = %self.iface.name, ?step, "applying setup step");
            if let Err(e) = self.run(step).await {
                tracing::warn!(bridge = %self.iface.name, ?step, error = %e, "setup step failed");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run(&mut self, step: SetupStep) -> BridgeResult<()> {
        match step {
            SetupStep::Device => self.setup_device().await,
            SetupStep::BridgeIpv4 => self.setup_bridge_ipv4().await,
            SetupStep::BridgeIpv6 => self.setup_bridge_ipv6().await,
            SetupStep::VerifyAndReconcile => self.setup_verify_and_reconcile().await,
            SetupStep::FixedCidrV4 => self.setup_fixed_cidr_v4(),
            SetupStep::FixedCidrV6 => self.setup_fixed_cidr_v6(),
            SetupStep::IpTables => self.setup_iptables().await,
            SetupStep::IpForwarding => self.setup_ip_forwarding().await,
            SetupStep::GatewayIpv4 => self.setup_gateway_ipv4(),
            SetupStep::GatewayIpv6 => self.setup_gateway_ipv6(),
            SetupStep::DeviceUp => self.kernel.set_up(&self.iface.name).await,
        }
    }

    // ── Step bodies ───────────────────────────────────────────────────

    /// Create the bridge device, or adopt a pre-existing one.
    async fn setup_device(&mut self) -> BridgeResult<()> {
        let name = &self.iface.name;
        if self.kernel.link_exists(name).await? {
            if !self.kernel.is_bridge(name).await? && !self.config.allow_non_default_bridge {
                return Err(BridgeError::NotABridge(name.clone()));
            }
            return Ok(());
        }
        self.kernel.create_bridge(name).await?;
        tracing::info!(bridge = %name, "bridge device created");
        Ok(())
    }

    /// The bridge address inside a configured subnet: the given address when
    /// it is not the bare network address, otherwise the first host.
    fn bridge_addr_in(net: Ipv4Net) -> Ipv4Net {
        if net.addr() != net.network() {
            return net;
        }
        let first_host = Ipv4Addr::from(u32::from(net.network()) + 1);
        Ipv4Net::new(first_host, net.prefix_len()).expect("prefix already validated")
    }

    /// Pick the bridge IPv4 subnet: the configured one, or the first
    /// candidate that does not collide with an existing host route.
    async fn elect_bridge_ipv4(&self) -> BridgeResult<Ipv4Net> {
        if let Some(net) = self.config.address_ipv4 {
            return Ok(Self::bridge_addr_in(net));
        }
        for candidate in candidate_subnets() {
            if !self.kernel.route_overlaps(IpNet::V4(candidate)).await? {
                return Ok(Self::bridge_addr_in(candidate));
            }
        }
        Err(BridgeError::NoSubnetCandidate)
    }

    /// Record the bridge subnet with the allocator and keep the gateway out
    /// of circulation.
    fn register_v4_pool(&self, bridge_net: Ipv4Net) -> BridgeResult<()> {
        let subnet = IpNet::V4(bridge_net.trunc());
        self.ipam.register_subnet(subnet);
        self.ipam
            .reserve(subnet, std::net::IpAddr::V4(bridge_net.addr()))
    }

    async fn setup_bridge_ipv4(&mut self) -> BridgeResult<()> {
        let bridge_net = self.elect_bridge_ipv4().await?;
        self.kernel
            .add_address(&self.iface.name, IpNet::V4(bridge_net))
            .await?;
        self.register_v4_pool(bridge_net)?;
        self.iface.address_v4 = Some(bridge_net);
        tracing::info!(bridge = %self.iface.name, address = %bridge_net, "bridge IPv4 assigned");
        Ok(())
    }

    /// Assign the fixed link-local address, plus the sub-CIDR gateway when a
    /// global v6 range is configured. Runs even on pre-existing devices:
    /// legacy installations may lack the link-local address.
    async fn setup_bridge_ipv6(&mut self) -> BridgeResult<()> {
        let link_local: Ipv6Net = BRIDGE_LINK_LOCAL.parse().expect("constant parses");
        self.kernel
            .add_address(&self.iface.name, IpNet::V6(link_local))
            .await?;

        if let Some(cidr6) = self.config.fixed_cidr_v6 {
            let gw_net = if cidr6.addr() != cidr6.network() {
                cidr6
            } else {
                let first = std::net::Ipv6Addr::from(u128::from(cidr6.network()) + 1);
                Ipv6Net::new(first, cidr6.prefix_len()).expect("prefix already validated")
            };
            self.kernel
                .add_address(&self.iface.name, IpNet::V6(gw_net))
                .await?;
            self.iface.address_v6 = Some(gw_net);
        }
        Ok(())
    }

    /// On a pre-existing bridge, assert the expected addresses are present:
    /// add what is missing, fail on a conflicting IPv4 address, adopt the
    /// device's own address when nothing was configured.
    async fn setup_verify_and_reconcile(&mut self) -> BridgeResult<()> {
        let name = self.iface.name.clone();
        let actual = self.kernel.list_addresses(&name).await?;
        let actual_v4: Vec<Ipv4Net> = actual
            .iter()
            .filter_map(|net| match net {
                IpNet::V4(v4) => Some(*v4),
                IpNet::V6(_) => None,
            })
            .collect();

        let bridge_net = match self.config.address_ipv4 {
            Some(configured) => {
                let expected = Self::bridge_addr_in(configured);
                if let Some(conflict) = actual_v4.iter().find(|net| **net != expected) {
                    return Err(BridgeError::AddressConflict {
                        name,
                        addr: IpNet::V4(*conflict),
                    });
                }
                if !actual_v4.contains(&expected) {
                    self.kernel.add_address(&name, IpNet::V4(expected)).await?;
                }
                expected
            }
            // Unconfigured: adopt the device's address, or elect one if the
            // device carries none.
            None => match actual_v4.first() {
                Some(existing) => *existing,
                None => {
                    let elected = self.elect_bridge_ipv4().await?;
                    self.kernel.add_address(&name, IpNet::V4(elected)).await?;
                    elected
                }
            },
        };

        if self.config.enable_ipv6 {
            let link_local: Ipv6Net = BRIDGE_LINK_LOCAL.parse().expect("constant parses");
            if !actual.contains(&IpNet::V6(link_local)) {
                self.kernel.add_address(&name, IpNet::V6(link_local)).await?;
            }
        }

        self.register_v4_pool(bridge_net)?;
        self.iface.address_v4 = Some(bridge_net);
        Ok(())
    }

    /// Register the container IPv4 sub-CIDR with the allocator, reserving the
    /// gateway so it cannot be handed out.
    fn setup_fixed_cidr_v4(&mut self) -> BridgeResult<()> {
        let Some(fixed) = self.config.fixed_cidr else {
            return Ok(());
        };
        let subnet = IpNet::V4(fixed.trunc());
        self.ipam.register_subnet(subnet);
        if let Some(gw) = self.iface.gateway_v4() {
            if fixed.contains(&gw) {
                self.ipam.reserve(subnet, std::net::IpAddr::V4(gw))?;
            }
        }
        Ok(())
    }

    fn setup_fixed_cidr_v6(&mut self) -> BridgeResult<()> {
        let Some(fixed) = self.config.fixed_cidr_v6 else {
            return Ok(());
        };
        let subnet = IpNet::V6(fixed.trunc());
        self.ipam.register_subnet(subnet);
        if let Some(gw) = self.iface.gateway_v6() {
            if fixed.contains(&gw) {
                self.ipam.reserve(subnet, std::net::IpAddr::V6(gw))?;
            }
        }
        Ok(())
    }

    async fn setup_iptables(&mut self) -> BridgeResult<()> {
        let bridge_net = self
            .iface
            .address_v4
            .ok_or(BridgeError::InvalidNetworkConfig)?;
        self.firewall
            .setup_bridge(
                &self.iface.name,
                bridge_net.trunc(),
                self.config.enable_ip_masquerade,
                self.config.enable_icc,
            )
            .await
    }

    /// Enable the forwarding sysctls if they are not already on.
    async fn setup_ip_forwarding(&mut self) -> BridgeResult<()> {
        if !self.kernel.ipv4_forwarding_enabled().await? {
            self.kernel.enable_ipv4_forwarding().await?;
        }
        if self.config.enable_ipv6 && !self.kernel.ipv6_forwarding_enabled().await? {
            self.kernel.enable_ipv6_forwarding().await?;
        }
        Ok(())
    }

    fn setup_gateway_ipv4(&mut self) -> BridgeResult<()> {
        let Some(gw) = self.config.default_gateway_ipv4 else {
            return Ok(());
        };
        self.iface.set_gateway_v4(gw);
        // Keep the override out of the container allocation pool too.
        let pool = self
            .config
            .fixed_cidr
            .map(|net| IpNet::V4(net.trunc()))
            .or_else(|| self.iface.address_v4.map(|net| IpNet::V4(net.trunc())));
        if let Some(subnet) = pool {
            if subnet.contains(&std::net::IpAddr::V4(gw)) {
                self.ipam.reserve(subnet, std::net::IpAddr::V4(gw))?;
            }
        }
        Ok(())
    }

    fn setup_gateway_ipv6(&mut self) -> BridgeResult<()> {
        let Some(gw) = self.config.default_gateway_ipv6 else {
            return Ok(());
        };
        self.iface.set_gateway_v6(gw);
        if let Some(cidr6) = self.config.fixed_cidr_v6 {
            let subnet = IpNet::V6(cidr6.trunc());
            if subnet.contains(&std::net::IpAddr::V6(gw)) {
                self.ipam.reserve(subnet, std::net::IpAddr::V6(gw))?;
            }
        }
        Ok(())
    }
}

/// Private subnets probed in order when no bridge subnet is configured.
fn candidate_subnets() -> Vec<Ipv4Net> {
    let mut nets = Vec::new();
    for second in 17..=31u8 {
        nets.push(Ipv4Net::new(Ipv4Addr::new(172, second, 0, 0), 16).unwrap());
    }
    for third in (0..=240u8).step_by(16) {
        nets.push(Ipv4Net::new(Ipv4Addr::new(192, 168, third, 0), 20).unwrap());
    }
    nets
}
