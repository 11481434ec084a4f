// The bridge driver: plugin entry point owning the process configuration and
// the single managed network, plus the endpoint lifecycle built on top of the
// setup pipeline, the allocator, the port mapper and the firewall programmer.
//
// Lock discipline: the driver mutex guards `config` and the `network`
// pointer; each network's mutex guards its endpoint table. Locks are held
// only around field access, never across kernel or firewall calls: every
// operation snapshots what it needs, releases, then does the slow work.

pub mod interface;
pub mod link;
pub mod setup;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use futures::future::BoxFuture;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::Mutex;

use crate::config::{Configuration, DriverOptions};
use crate::error::{BridgeError, BridgeResult};
use crate::firewall::{Firewall, FirewallBackend};
use crate::ipam::IpAllocator;
use crate::netlink::NetOps;
use crate::portmap::PortMapper;
use crate::types::{
    ContainerOptions, EndpointOptions, MacAddr, PortBinding, SandboxInfo, SandboxInterface,
};
use crate::veth::{self, CONTAINER_VETH};
use interface::BridgeInterface;
use link::Link;
use setup::{BridgeSetup, SetupStep};

/// Driver type tag exposed through the plugin contract.
pub const NETWORK_TYPE: &str = "bridge";

/// One attachment of a sandbox to the bridge network.
pub struct BridgeEndpoint {
    pub id: String,
    /// User-supplied parameters.
    pub options: EndpointOptions,
    /// Sandbox-side interface descriptor, set once plumbing succeeds.
    iface: Mutex<Option<SandboxInterface>>,
    /// Host-side veth name, kept for teardown.
    host_iface_name: Mutex<Option<String>>,
    /// Realized port bindings, which may differ from the requested ones.
    port_mappings: Mutex<Vec<PortBinding>>,
}

impl BridgeEndpoint {
    fn new(id: &str, options: EndpointOptions) -> Self {
        Self {
            id: id.to_string(),
            options,
            iface: Mutex::new(None),
            host_iface_name: Mutex::new(None),
            port_mappings: Mutex::new(Vec::new()),
        }
    }

    pub fn interface(&self) -> Option<SandboxInterface> {
        self.iface.lock().clone()
    }

    pub fn port_mappings(&self) -> Vec<PortBinding> {
        self.port_mappings.lock().clone()
    }

    fn ipv4(&self) -> Option<Ipv4Addr> {
        self.iface.lock().as_ref().map(|i| i.address.addr())
    }
}

/// The single network managed by a driver instance: the bridge's L3 interface
/// plus the endpoint table.
pub struct BridgeNetwork {
    pub id: String,
    bridge: Mutex<BridgeInterface>,
    endpoints: Mutex<HashMap<String, Arc<BridgeEndpoint>>>,
}

impl BridgeNetwork {
    fn new(id: &str, bridge_name: &str) -> Self {
        Self {
            id: id.to_string(),
            bridge: Mutex::new(BridgeInterface::new(bridge_name)),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Endpoint lookup; rejects empty ids, absent endpoints map to `None`.
    fn get_endpoint(&self, eid: &str) -> BridgeResult<Option<Arc<BridgeEndpoint>>> {
        if eid.is_empty() {
            return Err(BridgeError::InvalidEndpointId(eid.to_string()));
        }
        Ok(self.endpoints.lock().get(eid).cloned())
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Explicit rollback stack: every acquired resource registers a release; on
/// error the releases run in reverse order, on success the stack is disarmed.
struct RollbackStack {
    cleanups: Vec<CleanupFn>,
}

impl RollbackStack {
    fn new() -> Self {
        Self {
            cleanups: Vec::new(),
        }
    }

    fn push<F>(&mut self, cleanup: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.cleanups.push(Box::new(cleanup));
    }

    async fn unwind(mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup().await;
        }
    }

    fn disarm(mut self) {
        self.cleanups.clear();
    }
}

/// Bridge network driver. Collaborators are explicit values handed in at
/// construction so tests can substitute every system boundary.
pub struct Driver {
    config: Mutex<Option<Arc<Configuration>>>,
    network: Mutex<Option<Arc<BridgeNetwork>>>,
    kernel: Arc<dyn NetOps>,
    firewall: Arc<Firewall>,
    ipam: Arc<IpAllocator>,
    portmap: Arc<PortMapper>,
}

impl Driver {
    pub fn new(kernel: Arc<dyn NetOps>, backend: Arc<dyn FirewallBackend>) -> Self {
        let firewall = Arc::new(Firewall::new(backend));
        let ipam = Arc::new(IpAllocator::new());
        let portmap = Arc::new(PortMapper::new(firewall.clone()));
        Self::with_collaborators(kernel, firewall, ipam, portmap)
    }

    /// Construct with pre-built collaborators, e.g. to share the allocator
    /// and port mapper with other drivers in the same process.
    pub fn with_collaborators(
        kernel: Arc<dyn NetOps>,
        firewall: Arc<Firewall>,
        ipam: Arc<IpAllocator>,
        portmap: Arc<PortMapper>,
    ) -> Self {
        Self {
            config: Mutex::new(None),
            network: Mutex::new(None),
            kernel,
            firewall,
            ipam,
            portmap,
        }
    }

    pub fn network_type(&self) -> &'static str {
        NETWORK_TYPE
    }

    fn snapshot_config(&self) -> Option<Arc<Configuration>> {
        self.config.lock().clone()
    }

    fn snapshot_network(&self) -> Option<Arc<BridgeNetwork>> {
        self.network.lock().clone()
    }

    /// Network lookup by id. Only one network exists today, but the API takes
    /// the id so callers stay unchanged when multi-network support lands.
    fn get_network(&self, nid: &str) -> BridgeResult<Arc<BridgeNetwork>> {
        let network = self.snapshot_network().ok_or(BridgeError::NoNetwork)?;
        if network.id != nid {
            return Err(BridgeError::InvalidNetworkId(nid.to_string()));
        }
        Ok(network)
    }

    // ── Configuration ─────────────────────────────────────────────────

    /// Store the driver configuration. Absent options leave the driver
    /// unconfigured; reconfiguration is not supported.
    pub async fn configure(&self, options: Option<DriverOptions>) -> BridgeResult<()> {
        if self.config.lock().is_some() {
            return Err(BridgeError::ConfigExists);
        }
        let Some(options) = options else {
            return Ok(());
        };

        let config = options.into_configuration()?;
        config.validate()?;

        let mut slot = self.config.lock();
        if slot.is_some() {
            return Err(BridgeError::ConfigExists);
        }
        *slot = Some(Arc::new(config));
        Ok(())
    }

    // ── Network lifecycle ─────────────────────────────────────────────

    /// Create the managed network: install the placeholder under the driver
    /// lock, then run the setup pipeline outside it. On any step failure the
    /// placeholder is removed again.
    pub async fn create_network(
        &self,
        id: &str,
        _options: Option<&serde_json::Value>,
    ) -> BridgeResult<()> {
        let config = self
            .snapshot_config()
            .ok_or(BridgeError::InvalidNetworkConfig)?;

        let placeholder = Arc::new(BridgeNetwork::new(id, &config.bridge_name));
        {
            let mut slot = self.network.lock();
            if slot.is_some() {
                return Err(BridgeError::NetworkExists);
            }
            *slot = Some(placeholder.clone());
        }

        match self.run_setup_pipeline(&config).await {
            Ok(iface) => {
                *placeholder.bridge.lock() = iface;
                tracing::info!(network = id, bridge = %config.bridge_name, "network created");
                Ok(())
            }
            Err(e) => {
                // Remove the placeholder, but only if it is still ours.
                let mut slot = self.network.lock();
                if let Some(current) = slot.as_ref() {
                    if Arc::ptr_eq(current, &placeholder) {
                        *slot = None;
                    }
                }
                Err(e)
            }
        }
    }

    /// Assemble and apply the setup pipeline for the configured bridge.
    async fn run_setup_pipeline(&self, config: &Configuration) -> BridgeResult<BridgeInterface> {
        let mut iface = BridgeInterface::new(&config.bridge_name);
        let bridge_already_exists = iface.exists(self.kernel.as_ref()).await?;

        let mut setup = BridgeSetup::new(
            config,
            &mut iface,
            self.kernel.as_ref(),
            self.firewall.as_ref(),
            self.ipam.as_ref(),
        );

        // A missing device needs creating and addressing from scratch.
        if !bridge_already_exists {
            setup.queue_step(SetupStep::Device);
            setup.queue_step(SetupStep::BridgeIpv4);
        }

        // Even a pre-existing bridge may lack a link-local address when it
        // predates IPv6 support.
        if config.enable_ipv6 {
            setup.queue_step(SetupStep::BridgeIpv6);
        }
        if bridge_already_exists {
            setup.queue_step(SetupStep::VerifyAndReconcile);
        }
        if config.fixed_cidr.is_some() {
            setup.queue_step(SetupStep::FixedCidrV4);
        }
        if config.fixed_cidr_v6.is_some() {
            setup.queue_step(SetupStep::FixedCidrV6);
        }
        if config.enable_iptables {
            setup.queue_step(SetupStep::IpTables);
        }
        if config.enable_ip_forwarding {
            setup.queue_step(SetupStep::IpForwarding);
        }
        if config.default_gateway_ipv4.is_some() {
            setup.queue_step(SetupStep::GatewayIpv4);
        }
        if config.default_gateway_ipv6.is_some() {
            setup.queue_step(SetupStep::GatewayIpv6);
        }
        setup.queue_step(SetupStep::DeviceUp);

        setup.apply().await?;
        Ok(iface)
    }

    /// Detach and destroy the managed network. Fails while endpoints remain;
    /// on failure the detached network is restored unless another caller has
    /// installed a new one in the meantime.
    pub async fn delete_network(&self, _id: &str) -> BridgeResult<()> {
        let network = { self.network.lock().take() };
        let Some(network) = network else {
            return Err(BridgeError::NoNetwork);
        };

        if network.endpoint_count() != 0 {
            let id = network.id.clone();
            self.restore_network(network);
            return Err(BridgeError::ActiveEndpoints(id));
        }

        let bridge_name = network.bridge.lock().name.clone();
        match self.kernel.delete_link(&bridge_name).await {
            Ok(()) => {
                tracing::info!(bridge = %bridge_name, "network deleted");
                Ok(())
            }
            Err(e) => {
                self.restore_network(network);
                Err(e)
            }
        }
    }

    fn restore_network(&self, network: Arc<BridgeNetwork>) {
        let mut slot = self.network.lock();
        if slot.is_none() {
            *slot = Some(network);
        }
    }

    // ── Endpoint lifecycle ────────────────────────────────────────────

    /// Create an endpoint: a veth pair with one side on the bridge, addresses
    /// from the allocator, and the requested port publications. Any failure
    /// unwinds every acquired resource in reverse order.
    pub async fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        options: Option<&serde_json::Value>,
    ) -> BridgeResult<SandboxInfo> {
        let config = self
            .snapshot_config()
            .ok_or(BridgeError::InvalidNetworkConfig)?;
        let network = self.get_network(nid)?;

        let ep_options = EndpointOptions::decode(options)?;
        if let Some(mac) = ep_options.mac_address {
            if !mac.is_local_unicast() {
                tracing::debug!(%mac, "user-supplied MAC is not locally administered");
            }
        }

        let endpoint = Arc::new(BridgeEndpoint::new(eid, ep_options));
        {
            let mut endpoints = network.endpoints.lock();
            if eid.is_empty() {
                return Err(BridgeError::InvalidEndpointId(eid.to_string()));
            }
            if endpoints.contains_key(eid) {
                return Err(BridgeError::EndpointExists);
            }
            endpoints.insert(eid.to_string(), endpoint.clone());
        }

        let mut rollback = RollbackStack::new();
        match self
            .plumb_endpoint(&network, &config, &endpoint, &mut rollback)
            .await
        {
            Ok(info) => {
                rollback.disarm();
                tracing::info!(endpoint = eid, address = %info.interfaces[0].address, "endpoint created");
                Ok(info)
            }
            Err(e) => {
                rollback.unwind().await;
                let mut endpoints = network.endpoints.lock();
                if let Some(current) = endpoints.get(eid) {
                    if Arc::ptr_eq(current, &endpoint) {
                        endpoints.remove(eid);
                    }
                }
                Err(e)
            }
        }
    }

    async fn plumb_endpoint(
        &self,
        network: &Arc<BridgeNetwork>,
        config: &Configuration,
        endpoint: &Arc<BridgeEndpoint>,
        rollback: &mut RollbackStack,
    ) -> BridgeResult<SandboxInfo> {
        let (bridge_name, bridge_v4, gateway_v4, gateway_v6) = {
            let bridge = network.bridge.lock();
            (
                bridge.name.clone(),
                bridge.address_v4,
                bridge.gateway_v4(),
                bridge.gateway_v6(),
            )
        };
        let bridge_v4 = bridge_v4.ok_or(BridgeError::InvalidNetworkConfig)?;

        // Names for the host <-> sandbox pipe.
        let host_name = veth::generate_iface_name(self.kernel.as_ref()).await?;
        let sandbox_name = veth::generate_iface_name(self.kernel.as_ref()).await?;

        self.kernel.create_veth(&host_name, &sandbox_name).await?;
        {
            let kernel = self.kernel.clone();
            let host = host_name.clone();
            let sbox = sandbox_name.clone();
            rollback.push(move || {
                Box::pin(async move {
                    if let Err(e) = kernel.delete_link(&host).await {
                        tracing::warn!(link = %host, error = %e, "failed to delete veth on rollback");
                    }
                    if let Err(e) = kernel.delete_link(&sbox).await {
                        tracing::warn!(link = %sbox, error = %e, "failed to delete veth on rollback");
                    }
                })
            });
        }

        // Sandbox-side MAC: the user's choice or a fresh local one.
        let mac = veth::elect_mac(&endpoint.options);
        self.kernel.set_mac(&sandbox_name, mac).await?;

        if config.mtu > 0 {
            self.kernel.set_mtu(&host_name, config.mtu as u32).await?;
            self.kernel.set_mtu(&sandbox_name, config.mtu as u32).await?;
        }

        self.kernel.set_master(&host_name, &bridge_name).await?;

        // IPv4, restricted to the container sub-CIDR when one is configured.
        // The interface mask stays the bridge's.
        let alloc_v4 = IpNet::V4(config.fixed_cidr.unwrap_or_else(|| bridge_v4.trunc()).trunc());
        let granted_v4 = self.ipam.request(alloc_v4, None)?;
        {
            let ipam = self.ipam.clone();
            rollback.push(move || {
                Box::pin(async move {
                    if let Err(e) = ipam.release(alloc_v4, granted_v4) {
                        tracing::warn!(address = %granted_v4, error = %e, "failed to release v4 on rollback");
                    }
                })
            });
        }
        let std::net::IpAddr::V4(ip4) = granted_v4 else {
            return Err(BridgeError::InvalidNetworkConfig);
        };
        let addr_v4 =
            Ipv4Net::new(ip4, bridge_v4.prefix_len()).expect("bridge prefix already valid");

        // IPv6: SLAAC-style preferred address derived from the MAC, passed to
        // the allocator as an explicit hint.
        let mut addr_v6: Option<Ipv6Net> = None;
        if config.enable_ipv6 {
            let subnet6 = config
                .fixed_cidr_v6
                .unwrap_or_else(|| "fe80::/64".parse().expect("constant parses"));
            let alloc_v6 = IpNet::V6(subnet6.trunc());
            let preferred = slaac_address(subnet6, mac).map(std::net::IpAddr::V6);
            let granted_v6 = self.ipam.request(alloc_v6, preferred)?;
            {
                let ipam = self.ipam.clone();
                rollback.push(move || {
                    Box::pin(async move {
                        if let Err(e) = ipam.release(alloc_v6, granted_v6) {
                            tracing::warn!(address = %granted_v6, error = %e, "failed to release v6 on rollback");
                        }
                    })
                });
            }
            let std::net::IpAddr::V6(ip6) = granted_v6 else {
                return Err(BridgeError::InvalidNetworkConfig);
            };
            addr_v6 =
                Some(Ipv6Net::new(ip6, subnet6.prefix_len()).expect("cidr prefix already valid"));
        }

        let iface = SandboxInterface {
            src_name: sandbox_name.clone(),
            dst_name: CONTAINER_VETH.to_string(),
            address: addr_v4,
            address_v6: addr_v6,
            mac,
        };
        *endpoint.iface.lock() = Some(iface.clone());
        *endpoint.host_iface_name.lock() = Some(host_name);

        // Port publications; the mapper reverses its own partial work, so a
        // failure here rolls straight into the outer unwind.
        let realized = self
            .portmap
            .map_ports(
                &endpoint.options.port_bindings,
                ip4,
                config.default_binding_ip,
            )
            .await?;
        *endpoint.port_mappings.lock() = realized;

        Ok(SandboxInfo {
            interfaces: vec![iface],
            gateway: gateway_v4,
            gateway_v6: if config.enable_ipv6 { gateway_v6 } else { None },
        })
    }

    /// Remove an endpoint: release ports and addresses, delete the host-side
    /// veth. The endpoint table entry is restored on failure unless another
    /// caller has re-used the id.
    pub async fn delete_endpoint(&self, nid: &str, eid: &str) -> BridgeResult<()> {
        let config = self
            .snapshot_config()
            .ok_or(BridgeError::InvalidNetworkConfig)?;
        let network = self.get_network(nid)?;

        if eid.is_empty() {
            return Err(BridgeError::InvalidEndpointId(eid.to_string()));
        }
        let endpoint = {
            let mut endpoints = network.endpoints.lock();
            endpoints
                .remove(eid)
                .ok_or_else(|| BridgeError::EndpointNotFound(eid.to_string()))?
        };

        match self.unplumb_endpoint(&network, &config, &endpoint).await {
            Ok(()) => {
                tracing::info!(endpoint = eid, "endpoint deleted");
                Ok(())
            }
            Err(e) => {
                let mut endpoints = network.endpoints.lock();
                endpoints.entry(eid.to_string()).or_insert(endpoint);
                Err(e)
            }
        }
    }

    async fn unplumb_endpoint(
        &self,
        network: &Arc<BridgeNetwork>,
        config: &Configuration,
        endpoint: &Arc<BridgeEndpoint>,
    ) -> BridgeResult<()> {
        // Port release never stops endpoint deletion.
        let realized = endpoint.port_mappings();
        self.portmap.unmap_ports(&realized).await;

        let iface = endpoint.iface.lock().clone();
        if let Some(iface) = iface {
            let bridge_v4 = network.bridge.lock().address_v4;
            let alloc_v4 = IpNet::V4(
                config
                    .fixed_cidr
                    .or_else(|| bridge_v4.map(|net| net.trunc()))
                    .ok_or(BridgeError::InvalidNetworkConfig)?
                    .trunc(),
            );
            self.ipam
                .release(alloc_v4, std::net::IpAddr::V4(iface.address.addr()))?;

            if config.enable_ipv6 {
                if let Some(v6) = iface.address_v6 {
                    let subnet6 = config
                        .fixed_cidr_v6
                        .unwrap_or_else(|| "fe80::/64".parse().expect("constant parses"));
                    self.ipam
                        .release(IpNet::V6(subnet6.trunc()), std::net::IpAddr::V6(v6.addr()))?;
                }
            }
        }

        // The sandbox teardown may already have removed the pair; a missing
        // link is fine and other failures do not block deletion.
        let host_name = endpoint.host_iface_name.lock().clone();
        if let Some(host_name) = host_name {
            if let Err(e) = self.kernel.delete_link(&host_name).await {
                tracing::warn!(link = %host_name, error = %e, "failed to delete host veth");
            }
        }

        Ok(())
    }

    // ── Join / Leave ──────────────────────────────────────────────────

    /// Invoked when a sandbox attaches to an endpoint. With ICC disabled the
    /// parent/child lists in the options drive link (ACL) programming;
    /// otherwise this is a no-op.
    pub async fn join(
        &self,
        nid: &str,
        eid: &str,
        _sandbox_key: &str,
        options: Option<&serde_json::Value>,
    ) -> BridgeResult<()> {
        let config = self
            .snapshot_config()
            .ok_or(BridgeError::InvalidNetworkConfig)?;
        if config.enable_icc {
            return Ok(());
        }
        self.link(nid, eid, options, true).await
    }

    /// Invoked when a sandbox detaches from an endpoint; applies the inverse
    /// of the `join` link programming.
    pub async fn leave(
        &self,
        nid: &str,
        eid: &str,
        options: Option<&serde_json::Value>,
    ) -> BridgeResult<()> {
        let config = self
            .snapshot_config()
            .ok_or(BridgeError::InvalidNetworkConfig)?;
        if config.enable_icc {
            return Ok(());
        }
        self.link(nid, eid, options, false).await
    }

    async fn link(
        &self,
        nid: &str,
        eid: &str,
        options: Option<&serde_json::Value>,
        enable: bool,
    ) -> BridgeResult<()> {
        let config = self
            .snapshot_config()
            .ok_or(BridgeError::InvalidNetworkConfig)?;
        let network = self.get_network(nid)?;
        let endpoint = network
            .get_endpoint(eid)?
            .ok_or_else(|| BridgeError::EndpointNotFound(eid.to_string()))?;

        let Some(cc) = ContainerOptions::decode(options)? else {
            return Ok(());
        };

        let ep_ip = endpoint
            .ipv4()
            .ok_or_else(|| BridgeError::EndpointNotFound(eid.to_string()))?;
        let bridge_name = &config.bridge_name;

        // Links already enabled by this call, for transactional unwind.
        let mut enabled: Vec<Link> = Vec::new();

        // Parents reach this endpoint's published ports.
        if !endpoint.options.port_bindings.is_empty() {
            for pid in &cc.parent_endpoints {
                let parent = network
                    .get_endpoint(pid)?
                    .ok_or_else(|| BridgeError::InvalidEndpointId(pid.clone()))?;
                let parent_ip = parent
                    .ipv4()
                    .ok_or_else(|| BridgeError::InvalidEndpointId(pid.clone()))?;
                let link = Link::new(
                    bridge_name,
                    parent_ip,
                    ep_ip,
                    &endpoint.options.port_bindings,
                );
                self.toggle_link(link, enable, &mut enabled).await?;
            }
        }

        // This endpoint reaches each child's published ports.
        for cid in &cc.child_endpoints {
            let child = network
                .get_endpoint(cid)?
                .ok_or_else(|| BridgeError::InvalidEndpointId(cid.clone()))?;
            if child.options.port_bindings.is_empty() {
                continue;
            }
            let child_ip = child
                .ipv4()
                .ok_or_else(|| BridgeError::InvalidEndpointId(cid.clone()))?;
            let link = Link::new(bridge_name, ep_ip, child_ip, &child.options.port_bindings);
            self.toggle_link(link, enable, &mut enabled).await?;
        }

        Ok(())
    }

    async fn toggle_link(
        &self,
        link: Link,
        enable: bool,
        enabled: &mut Vec<Link>,
    ) -> BridgeResult<()> {
        if enable {
            if let Err(e) = link.enable(self.firewall.as_ref()).await {
                for done in enabled.iter().rev() {
                    done.disable(self.firewall.as_ref()).await;
                }
                return Err(e);
            }
            enabled.push(link);
            Ok(())
        } else {
            link.disable(self.firewall.as_ref()).await;
            Ok(())
        }
    }
}

/// SLAAC-style preferred address: for prefixes of at most 80 bits, the six
/// MAC bytes land in bytes 10..16 of the network address.
fn slaac_address(subnet: Ipv6Net, mac: MacAddr) -> Option<Ipv6Addr> {
    if subnet.prefix_len() > 80 {
        return None;
    }
    let mut bytes = subnet.network().octets();
    bytes[10..16].copy_from_slice(&mac.octets());
    Some(Ipv6Addr::from(bytes))
}
