// veth naming and MAC election helpers for endpoint plumbing.

use rand::Rng;

use crate::error::{BridgeError, BridgeResult};
use crate::netlink::NetOps;
use crate::types::{EndpointOptions, MacAddr};

/// Prefix of generated veth interface names.
pub const VETH_PREFIX: &str = "veth";
/// Number of random hex characters appended to the prefix.
pub const VETH_SUFFIX_LEN: usize = 7;
/// Name the sandbox side takes once moved into the container namespace.
pub const CONTAINER_VETH: &str = "eth0";

const NAME_ATTEMPTS: usize = 3;

/// Generate a host-unique interface name of the form `veth` + 7 random hex
/// characters (e.g. `veth0f60e2c`), retrying a bounded number of times when
/// the drawn name is already present on the host.
pub async fn generate_iface_name(kernel: &dyn NetOps) -> BridgeResult<String> {
    let mut rng = rand::rng();
    for _ in 0..NAME_ATTEMPTS {
        let suffix: u32 = rng.random_range(0..0x1000_0000);
        let name = format!("{}{:07x}", VETH_PREFIX, suffix);
        if !kernel.link_exists(&name).await? {
            return Ok(name);
        }
    }
    Err(BridgeError::IfaceName)
}

/// Generate a random locally-administered unicast MAC address.
pub fn generate_mac() -> MacAddr {
    let mut octets = [0u8; 6];
    rand::rng().fill(&mut octets);
    octets[0] = (octets[0] | 0x02) & 0xfe;
    MacAddr(octets)
}

/// User-supplied MAC wins; otherwise a fresh one is generated.
pub fn elect_mac(options: &EndpointOptions) -> MacAddr {
    options.mac_address.unwrap_or_else(generate_mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::fake::FakeKernel;

    #[test]
    fn generated_mac_is_local_unicast() {
        for _ in 0..64 {
            assert!(generate_mac().is_local_unicast());
        }
    }

    #[tokio::test]
    async fn generated_name_has_expected_shape() {
        let kernel = FakeKernel::new();
        let name = generate_iface_name(&kernel).await.unwrap();
        assert_eq!(name.len(), VETH_PREFIX.len() + VETH_SUFFIX_LEN);
        assert!(name.starts_with(VETH_PREFIX));
        assert!(name[VETH_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn elect_mac_prefers_user_choice() {
        let mac: MacAddr = "02:42:c0:a8:00:02".parse().unwrap();
        let opts = EndpointOptions {
            mac_address: Some(mac),
            port_bindings: Vec::new(),
        };
        assert_eq!(elect_mac(&opts), mac);
    }
}
