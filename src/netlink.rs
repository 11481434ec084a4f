// Kernel networking surface. `NetOps` is the seam the driver and the setup
// pipeline program against; `NetlinkHandle` is the production implementation
// wrapping a persistent rtnetlink connection, one per process.

use std::net::IpAddr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::link::nlas::{Info, InfoKind, Nla as LinkNla};
use netlink_packet_route::route::nlas::Nla as RouteNla;

use crate::error::{BridgeError, BridgeResult};
use crate::types::MacAddr;

const PROC_IPV4_FORWARDING: &str = "/proc/sys/net/ipv4/ip_forward";
const PROC_IPV6_FORWARDING: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => Some(IpAddr::from(std::net::Ipv4Addr::new(
            bytes[0], bytes[1], bytes[2], bytes[3],
        ))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Link, address, route and forwarding operations the driver needs from the
/// kernel. Implemented by `NetlinkHandle` in production and by an in-memory
/// fake in tests.
#[async_trait]
pub trait NetOps: Send + Sync {
    async fn link_exists(&self, name: &str) -> BridgeResult<bool>;

    /// True if `name` exists and is a bridge device.
    async fn is_bridge(&self, name: &str) -> BridgeResult<bool>;

    async fn create_bridge(&self, name: &str) -> BridgeResult<()>;

    /// Create a veth pair with zero-length transmit queues.
    async fn create_veth(&self, name: &str, peer: &str) -> BridgeResult<()>;

    /// Delete a link. Ok if the link is already gone.
    async fn delete_link(&self, name: &str) -> BridgeResult<()>;

    /// Attach `name` to the bridge `master`.
    async fn set_master(&self, name: &str, master: &str) -> BridgeResult<()>;

    async fn set_mac(&self, name: &str, mac: MacAddr) -> BridgeResult<()>;

    async fn set_mtu(&self, name: &str, mtu: u32) -> BridgeResult<()>;

    async fn set_up(&self, name: &str) -> BridgeResult<()>;

    /// Assign an address. Ok if the address is already present.
    async fn add_address(&self, name: &str, addr: IpNet) -> BridgeResult<()>;

    async fn list_addresses(&self, name: &str) -> BridgeResult<Vec<IpNet>>;

    /// True if any non-default host route overlaps the given subnet.
    async fn route_overlaps(&self, net: IpNet) -> BridgeResult<bool>;

    async fn ipv4_forwarding_enabled(&self) -> BridgeResult<bool>;
    async fn enable_ipv4_forwarding(&self) -> BridgeResult<()>;
    async fn ipv6_forwarding_enabled(&self) -> BridgeResult<bool>;
    async fn enable_ipv6_forwarding(&self) -> BridgeResult<()>;
}

/// Persistent netlink handle wrapping rtnetlink for all bridge/veth/link
/// operations. One handle per process, reused across endpoint churn.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> BridgeResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    /// Get a link's ifindex by name.
    async fn link_index(&self, name: &str) -> BridgeResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(BridgeError::LinkNotFound(name.to_string())),
            Err(e) => {
                // rtnetlink surfaces "not found" as an error on some kernels
                if e.to_string().contains("No such device") {
                    Err(BridgeError::LinkNotFound(name.to_string()))
                } else {
                    Err(BridgeError::Netlink(e))
                }
            }
        }
    }

    async fn link_message(
        &self,
        name: &str,
    ) -> BridgeResult<Option<netlink_packet_route::LinkMessage>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(msg) => Ok(msg),
            Err(e) if e.to_string().contains("No such device") => Ok(None),
            Err(e) => Err(BridgeError::Netlink(e)),
        }
    }

    fn read_proc_flag(path: &str) -> BridgeResult<bool> {
        let raw = std::fs::read_to_string(path)?;
        Ok(raw.trim() == "1")
    }

    fn write_proc_flag(path: &str) -> BridgeResult<()> {
        std::fs::write(path, "1\n")?;
        Ok(())
    }
}

#[async_trait]
impl NetOps for NetlinkHandle {
    async fn link_exists(&self, name: &str) -> BridgeResult<bool> {
        match self.link_index(name).await {
            Ok(_) => Ok(true),
            Err(BridgeError::LinkNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_bridge(&self, name: &str) -> BridgeResult<bool> {
        let msg = match self.link_message(name).await? {
            Some(msg) => msg,
            None => return Ok(false),
        };
        for nla in &msg.nlas {
            if let LinkNla::Info(infos) = nla {
                for info in infos {
                    if let Info::Kind(kind) = info {
                        return Ok(matches!(kind, InfoKind::Bridge));
                    }
                }
            }
        }
        Ok(false)
    }

    async fn create_bridge(&self, name: &str) -> BridgeResult<()> {
        let result = self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            // Lost a creation race; the adopt path takes over from here.
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(BridgeError::Netlink(e)),
        }
    }

    async fn create_veth(&self, name: &str, peer: &str) -> BridgeResult<()> {
        let mut req = self
            .handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string());
        req.message_mut().nlas.push(LinkNla::TxQueueLen(0));
        req.execute().await.map_err(BridgeError::Netlink)
    }

    async fn delete_link(&self, name: &str) -> BridgeResult<()> {
        let index = match self.link_index(name).await {
            Ok(idx) => idx,
            Err(BridgeError::LinkNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(BridgeError::Netlink(e)),
        }
    }

    async fn set_master(&self, name: &str, master: &str) -> BridgeResult<()> {
        let link_idx = self.link_index(name).await?;
        let master_idx = self.link_index(master).await?;
        self.handle
            .link()
            .set(link_idx)
            .master(master_idx)
            .execute()
            .await
            .map_err(BridgeError::Netlink)
    }

    async fn set_mac(&self, name: &str, mac: MacAddr) -> BridgeResult<()> {
        let idx = self.link_index(name).await?;
        self.handle
            .link()
            .set(idx)
            .address(mac.octets().to_vec())
            .execute()
            .await
            .map_err(BridgeError::Netlink)
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> BridgeResult<()> {
        let idx = self.link_index(name).await?;
        self.handle
            .link()
            .set(idx)
            .mtu(mtu)
            .execute()
            .await
            .map_err(BridgeError::Netlink)
    }

    async fn set_up(&self, name: &str) -> BridgeResult<()> {
        let idx = self.link_index(name).await?;
        self.handle
            .link()
            .set(idx)
            .up()
            .execute()
            .await
            .map_err(BridgeError::Netlink)
    }

    async fn add_address(&self, name: &str, addr: IpNet) -> BridgeResult<()> {
        let idx = self.link_index(name).await?;
        let result = self
            .handle
            .address()
            .add(idx, addr.addr(), addr.prefix_len())
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(BridgeError::Netlink(e)),
        }
    }

    async fn list_addresses(&self, name: &str) -> BridgeResult<Vec<IpNet>> {
        use netlink_packet_route::address::nlas::Nla as AddrNla;

        let idx = self.link_index(name).await?;
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(idx)
            .execute();

        let mut out = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(BridgeError::Netlink)? {
            let prefix = msg.header.prefix_len;
            for nla in &msg.nlas {
                if let AddrNla::Address(bytes) = nla {
                    let Some(ip) = ip_from_bytes(bytes) else {
                        continue;
                    };
                    if let Ok(net) = IpNet::new(ip, prefix) {
                        out.push(net);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn route_overlaps(&self, net: IpNet) -> BridgeResult<bool> {
        let version = match net {
            IpNet::V4(_) => rtnetlink::IpVersion::V4,
            IpNet::V6(_) => rtnetlink::IpVersion::V6,
        };
        let mut routes = self.handle.route().get(version).execute();
        while let Some(route) = routes.try_next().await.map_err(BridgeError::Netlink)? {
            let prefix = route.header.destination_prefix_length;
            // Default routes cover everything and are not a conflict.
            if prefix == 0 {
                continue;
            }
            for nla in &route.nlas {
                if let RouteNla::Destination(bytes) = nla {
                    let Some(dest) = ip_from_bytes(bytes) else {
                        continue;
                    };
                    if let Ok(route_net) = IpNet::new(dest, prefix) {
                        if route_net.contains(&net.addr()) || net.contains(&route_net.addr()) {
                            return Ok(true);
                        }
                    }
                }
            }
        }
        Ok(false)
    }

    async fn ipv4_forwarding_enabled(&self) -> BridgeResult<bool> {
        Self::read_proc_flag(PROC_IPV4_FORWARDING)
    }

    async fn enable_ipv4_forwarding(&self) -> BridgeResult<()> {
        Self::write_proc_flag(PROC_IPV4_FORWARDING)
    }

    async fn ipv6_forwarding_enabled(&self) -> BridgeResult<bool> {
        Self::read_proc_flag(PROC_IPV6_FORWARDING)
    }

    async fn enable_ipv6_forwarding(&self) -> BridgeResult<()> {
        Self::write_proc_flag(PROC_IPV6_FORWARDING)
    }
}
