use ipnet::IpNet;

/// Error type for all bridge driver operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // ── Configuration errors ──────────────────────────────────────────
    #[error("invalid MTU number")]
    InvalidMtu,

    #[error("container subnet must be a subset of the bridge subnet")]
    InvalidContainerSubnet,

    #[error("default gateway must belong to the configured subnet")]
    InvalidGateway,

    #[error("invalid driver configuration: {0}")]
    InvalidDriverConfig(String),

    #[error("driver is not configured for networks")]
    InvalidNetworkConfig,

    #[error("invalid endpoint configuration: {0}")]
    InvalidEndpointConfig(String),

    #[error("driver is already configured")]
    ConfigExists,

    // ── State errors ──────────────────────────────────────────────────
    #[error("a bridge network already exists")]
    NetworkExists,

    #[error("no bridge network exists")]
    NoNetwork,

    #[error("network {0} has active endpoints")]
    ActiveEndpoints(String),

    #[error("network id {0} does not match the managed network")]
    InvalidNetworkId(String),

    #[error("invalid endpoint id: {0}")]
    InvalidEndpointId(String),

    #[error("endpoint already exists")]
    EndpointExists,

    #[error("endpoint {0} not found")]
    EndpointNotFound(String),

    #[error("bridge device {0} exists and is not a bridge")]
    NotABridge(String),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("bridge {name} carries unexpected address {addr}")]
    AddressConflict { name: String, addr: IpNet },

    #[error("no IPv4 subnet candidate is free on this host")]
    NoSubnetCandidate,

    // ── Resource errors ───────────────────────────────────────────────
    #[error("could not generate a free interface name")]
    IfaceName,

    #[error("no available addresses in subnet {0}")]
    NoAvailableIps(IpNet),

    #[error("address {addr} is outside subnet {subnet}")]
    IpOutOfRange { subnet: IpNet, addr: std::net::IpAddr },

    #[error("subnet {0} is not registered with the allocator")]
    UnknownSubnet(IpNet),

    #[error("failed to allocate host port for {0}")]
    AllocatePort(String),

    // ── Subsystem errors ──────────────────────────────────────────────
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("firewall command '{cmd}' failed: {stderr}")]
    Firewall { cmd: String, stderr: String },

    #[error("option decode error: {0}")]
    OptionDecode(#[from] serde_json::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
