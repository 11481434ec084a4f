//! Linux bridge network driver for container runtimes.
//!
//! The driver programs kernel networking state so containers attached to a
//! virtual L2 bridge obtain connectivity: bridge device and addressing, veth
//! endpoint pairs, NAT and ICC firewall policy, inter-container links and
//! host port publishing. Kernel and firewall access go through the `NetOps`
//! and `FirewallBackend` seams so every mutation is testable without root.
//!
//! Out of scope by design: the plugin registry that discovers drivers, the
//! sandbox/namespace manager (the driver only emits an interface descriptor),
//! the userland proxy internals, persistence, and the network controller.

pub mod config;
pub mod driver;
pub mod error;
pub mod firewall;
pub mod ipam;
pub mod netlink;
pub mod portmap;
pub mod types;
pub mod veth;

pub use config::{Configuration, DriverOptions};
pub use driver::{BridgeEndpoint, BridgeNetwork, Driver, NETWORK_TYPE};
pub use error::{BridgeError, BridgeResult};
pub use firewall::{Firewall, FirewallBackend, IptablesBackend};
pub use ipam::IpAllocator;
pub use netlink::{NetOps, NetlinkHandle};
pub use portmap::{PortMapper, PortProxy};
pub use types::{
    ContainerOptions, EndpointOptions, MacAddr, PortBinding, Protocol, SandboxInfo,
    SandboxInterface,
};
