// Host port reservation and DNAT installation for published container ports.
// One process-wide mapper is shared by all endpoints; reservations are keyed
// by (protocol, host address, port) so concurrent callers cannot collide.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{BridgeError, BridgeResult};
use crate::firewall::Firewall;
use crate::types::{PortBinding, Protocol};

/// Bound on installation attempts for one requested binding.
pub const MAX_ALLOCATE_PORT_ATTEMPTS: usize = 10;

/// Ephemeral pool drawn from when a binding names no host port.
const EPHEMERAL_PORT_START: u16 = 49153;
const EPHEMERAL_PORT_END: u16 = 65535;

/// Optional userland proxy collaborator, started per realized binding.
#[async_trait]
pub trait PortProxy: Send + Sync {
    async fn start(&self, binding: &PortBinding) -> BridgeResult<()>;
    async fn stop(&self, binding: &PortBinding);
}

type ReservationKey = (Protocol, IpAddr, u16);

/// Process-wide port mapper.
pub struct PortMapper {
    firewall: Arc<Firewall>,
    reservations: DashMap<ReservationKey, ()>,
    next_ephemeral: Mutex<u16>,
    proxy: Option<Arc<dyn PortProxy>>,
}

impl PortMapper {
    pub fn new(firewall: Arc<Firewall>) -> Self {
        Self {
            firewall,
            reservations: DashMap::new(),
            next_ephemeral: Mutex::new(EPHEMERAL_PORT_START),
            proxy: None,
        }
    }

    pub fn with_proxy(firewall: Arc<Firewall>, proxy: Arc<dyn PortProxy>) -> Self {
        Self {
            proxy: Some(proxy),
            ..Self::new(firewall)
        }
    }

    fn key(proto: Protocol, host_ip: Option<IpAddr>, port: u16) -> ReservationKey {
        (
            proto,
            host_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port,
        )
    }

    fn draw_ephemeral(&self) -> u16 {
        let mut next = self.next_ephemeral.lock();
        let port = *next;
        *next = if port >= EPHEMERAL_PORT_END {
            EPHEMERAL_PORT_START
        } else {
            port + 1
        };
        port
    }

    /// Realize every requested binding against `container_ip`. Bindings are
    /// installed in order; if one fails, those already realized in this call
    /// are unmapped before the error surfaces, so the whole call is atomic.
    pub async fn map_ports(
        &self,
        requested: &[PortBinding],
        container_ip: Ipv4Addr,
        default_binding_ip: Option<IpAddr>,
    ) -> BridgeResult<Vec<PortBinding>> {
        let mut realized = Vec::with_capacity(requested.len());
        for binding in requested {
            match self.map_port(binding, container_ip, default_binding_ip).await {
                Ok(b) => realized.push(b),
                Err(e) => {
                    self.unmap_ports(&realized).await;
                    return Err(e);
                }
            }
        }
        Ok(realized)
    }

    /// Realize a single binding: pick a host port, reserve it, install the
    /// DNAT pair, start the proxy if one is wired in. Any sub-step failure
    /// reverses that binding's own effects before returning or retrying.
    async fn map_port(
        &self,
        binding: &PortBinding,
        container_ip: Ipv4Addr,
        default_binding_ip: Option<IpAddr>,
    ) -> BridgeResult<PortBinding> {
        let host_ip = binding.host_ip.or(default_binding_ip);

        match binding.host_range() {
            // An explicit port or range is scanned in order, one attempt each.
            Some((lo, hi)) => {
                for port in lo..=hi {
                    match self.install(binding, host_ip, port, container_ip).await? {
                        Some(realized) => return Ok(realized),
                        None => continue,
                    }
                }
                Err(BridgeError::AllocatePort(binding.to_string()))
            }
            // Auto-assign draws from the ephemeral pool with a bounded number
            // of attempts.
            None => {
                for _ in 0..MAX_ALLOCATE_PORT_ATTEMPTS {
                    let port = self.draw_ephemeral();
                    match self.install(binding, host_ip, port, container_ip).await? {
                        Some(realized) => return Ok(realized),
                        None => continue,
                    }
                }
                Err(BridgeError::AllocatePort(binding.to_string()))
            }
        }
    }

    /// Try one concrete host port. `Ok(None)` means the port was taken and
    /// the caller may try another; hard subsystem failures propagate after
    /// the reservation is rolled back.
    async fn install(
        &self,
        binding: &PortBinding,
        host_ip: Option<IpAddr>,
        host_port: u16,
        container_ip: Ipv4Addr,
    ) -> BridgeResult<Option<PortBinding>> {
        let key = Self::key(binding.proto, host_ip, host_port);
        match self.reservations.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Ok(None),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let realized = PortBinding {
            proto: binding.proto,
            container_ip: Some(IpAddr::V4(container_ip)),
            container_port: binding.container_port,
            host_ip,
            host_port,
            host_port_end: None,
        };

        if let Err(e) = self
            .firewall
            .publish_port(
                binding.proto,
                host_ip,
                host_port,
                container_ip,
                binding.container_port,
            )
            .await
        {
            self.reservations.remove(&key);
            return Err(e);
        }

        if let Some(proxy) = &self.proxy {
            if let Err(e) = proxy.start(&realized).await {
                self.firewall
                    .unpublish_port(
                        binding.proto,
                        host_ip,
                        host_port,
                        container_ip,
                        binding.container_port,
                    )
                    .await;
                self.reservations.remove(&key);
                return Err(e);
            }
        }

        tracing::debug!(binding = %realized, "port published");
        Ok(Some(realized))
    }

    /// Release realized bindings. Idempotent, and never fails the caller:
    /// individual release errors are logged and skipped.
    pub async fn unmap_ports(&self, realized: &[PortBinding]) {
        for binding in realized {
            let container_ip = match binding.container_ip {
                Some(IpAddr::V4(ip)) => ip,
                _ => {
                    tracing::warn!(binding = %binding, "realized binding lacks container ip");
                    continue;
                }
            };
            if let Some(proxy) = &self.proxy {
                proxy.stop(binding).await;
            }
            self.firewall
                .unpublish_port(
                    binding.proto,
                    binding.host_ip,
                    binding.host_port,
                    container_ip,
                    binding.container_port,
                )
                .await;
            self.reservations
                .remove(&Self::key(binding.proto, binding.host_ip, binding.host_port));
        }
    }

    /// Number of live reservations (test and reconciliation visibility).
    pub fn reserved_count(&self) -> usize {
        self.reservations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::mem::MemBackend;
    use crate::firewall::{Firewall, Table, NAT_CHAIN};

    fn fixture() -> (Arc<MemBackend>, PortMapper) {
        let backend = Arc::new(MemBackend::new());
        let mapper = PortMapper::new(Arc::new(Firewall::new(backend.clone())));
        (backend, mapper)
    }

    fn request(proto: Protocol, container_port: u16, host_port: u16) -> PortBinding {
        PortBinding {
            proto,
            container_ip: None,
            container_port,
            host_ip: None,
            host_port,
            host_port_end: None,
        }
    }

    fn cip() -> Ipv4Addr {
        "172.20.0.2".parse().unwrap()
    }

    #[tokio::test]
    async fn auto_assign_yields_concrete_port() {
        let (backend, mapper) = fixture();
        let realized = mapper
            .map_ports(&[request(Protocol::Tcp, 80, 0)], cip(), None)
            .await
            .unwrap();
        assert_eq!(realized.len(), 1);
        assert_ne!(realized[0].host_port, 0);
        assert!(realized[0].host_port >= EPHEMERAL_PORT_START);
        assert!(backend.has_rule(Table::Nat, NAT_CHAIN, "--to-destination 172.20.0.2:80"));
    }

    #[tokio::test]
    async fn exact_port_conflict_surfaces_allocate_port() {
        let (_backend, mapper) = fixture();
        mapper
            .map_ports(&[request(Protocol::Tcp, 80, 8080)], cip(), None)
            .await
            .unwrap();
        let err = mapper
            .map_ports(
                &[request(Protocol::Tcp, 81, 8080)],
                "172.20.0.3".parse().unwrap(),
                None,
            )
            .await;
        assert!(matches!(err, Err(BridgeError::AllocatePort(_))));
    }

    #[tokio::test]
    async fn same_port_different_protocol_is_fine() {
        let (_backend, mapper) = fixture();
        mapper
            .map_ports(&[request(Protocol::Tcp, 80, 8080)], cip(), None)
            .await
            .unwrap();
        mapper
            .map_ports(&[request(Protocol::Udp, 80, 8080)], cip(), None)
            .await
            .unwrap();
        assert_eq!(mapper.reserved_count(), 2);
    }

    #[tokio::test]
    async fn range_scanned_in_order() {
        let (_backend, mapper) = fixture();
        let mut first = request(Protocol::Tcp, 80, 9000);
        first.host_port_end = Some(9002);
        let realized = mapper.map_ports(&[first.clone()], cip(), None).await.unwrap();
        assert_eq!(realized[0].host_port, 9000);

        // 9000 is taken; the next request in the same range lands on 9001.
        let realized = mapper.map_ports(&[first], cip(), None).await.unwrap();
        assert_eq!(realized[0].host_port, 9001);
    }

    #[tokio::test]
    async fn failed_binding_unwinds_whole_call() {
        let (backend, mapper) = fixture();
        let good = request(Protocol::Tcp, 80, 8080);
        let bad = request(Protocol::Tcp, 81, 8080); // conflicts with good
        let err = mapper
            .map_ports(&[good, bad], cip(), None)
            .await;
        assert!(matches!(err, Err(BridgeError::AllocatePort(_))));
        assert_eq!(mapper.reserved_count(), 0);
        assert_eq!(backend.rule_count(), 0);
    }

    #[tokio::test]
    async fn firewall_failure_rolls_back_reservation() {
        let (backend, mapper) = fixture();
        backend.fail_matching("DNAT");
        let err = mapper
            .map_ports(&[request(Protocol::Tcp, 80, 8080)], cip(), None)
            .await;
        assert!(err.is_err());
        backend.clear_failures();
        assert_eq!(mapper.reserved_count(), 0);
        assert_eq!(backend.rule_count(), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_total() {
        let (backend, mapper) = fixture();
        let realized = mapper
            .map_ports(
                &[request(Protocol::Tcp, 80, 8080), request(Protocol::Udp, 53, 0)],
                cip(),
                None,
            )
            .await
            .unwrap();
        mapper.unmap_ports(&realized).await;
        assert_eq!(mapper.reserved_count(), 0);
        assert_eq!(backend.rule_count(), 0);
        // Second release of the same bindings is a quiet no-op.
        mapper.unmap_ports(&realized).await;
        assert_eq!(mapper.reserved_count(), 0);
    }

    #[tokio::test]
    async fn default_binding_ip_recorded_on_realized_binding() {
        let (backend, mapper) = fixture();
        let host: IpAddr = "192.0.2.10".parse().unwrap();
        let realized = mapper
            .map_ports(&[request(Protocol::Tcp, 80, 8080)], cip(), Some(host))
            .await
            .unwrap();
        assert_eq!(realized[0].host_ip, Some(host));
        assert!(backend.has_rule(Table::Nat, NAT_CHAIN, "-d 192.0.2.10"));
    }
}
