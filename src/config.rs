// Driver configuration: the process-wide, set-once record of how the managed
// bridge is to be programmed. Options arrive either as an already-typed
// struct or as a generic JSON blob decoded by field name.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Default bridge device name when nothing is configured.
pub const DEFAULT_BRIDGE_NAME: &str = "brnet0";

/// Configuration for the bridge driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Name of the bridge device to create or adopt.
    pub bridge_name: String,
    /// IPv4 subnet assigned to the bridge. When absent, a candidate subnet is
    /// elected against the host routing table during setup.
    pub address_ipv4: Option<Ipv4Net>,
    /// Sub-CIDR restricting container IPv4 allocations.
    pub fixed_cidr: Option<Ipv4Net>,
    /// Global IPv6 sub-CIDR for container allocations.
    pub fixed_cidr_v6: Option<Ipv6Net>,
    pub enable_ipv6: bool,
    pub enable_iptables: bool,
    pub enable_ip_masquerade: bool,
    pub enable_icc: bool,
    pub enable_ip_forwarding: bool,
    /// Permit adopting a pre-existing device that is not the default bridge.
    pub allow_non_default_bridge: bool,
    pub mtu: i32,
    pub default_gateway_ipv4: Option<Ipv4Addr>,
    pub default_gateway_ipv6: Option<Ipv6Addr>,
    /// Host address published ports bind to when a binding names none.
    pub default_binding_ip: Option<IpAddr>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            address_ipv4: None,
            fixed_cidr: None,
            fixed_cidr_v6: None,
            enable_ipv6: false,
            enable_iptables: true,
            enable_ip_masquerade: true,
            enable_icc: true,
            enable_ip_forwarding: true,
            allow_non_default_bridge: false,
            mtu: 0,
            default_gateway_ipv4: None,
            default_gateway_ipv6: None,
            default_binding_ip: None,
        }
    }
}

impl Configuration {
    /// Static validation of the configuration parameters. Whatever can be
    /// assessed a priori before attempting any kernel programming.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.mtu < 0 {
            return Err(BridgeError::InvalidMtu);
        }

        if let Some(bridge_net) = self.address_ipv4 {
            // A container-restricted subnet must be a subset of the bridge subnet.
            if let Some(fixed) = self.fixed_cidr {
                if !bridge_net.contains(&fixed.network())
                    || bridge_net.prefix_len() > fixed.prefix_len()
                {
                    return Err(BridgeError::InvalidContainerSubnet);
                }
            }
            // A default gateway must be reachable on the bridge subnet.
            if let Some(gw) = self.default_gateway_ipv4 {
                if !bridge_net.contains(&gw) {
                    return Err(BridgeError::InvalidGateway);
                }
            }
        }

        // A v6 gateway needs a v6 sub-CIDR that contains it.
        if self.enable_ipv6 {
            if let Some(gw6) = self.default_gateway_ipv6 {
                match self.fixed_cidr_v6 {
                    Some(cidr6) if cidr6.contains(&gw6) => {}
                    _ => return Err(BridgeError::InvalidGateway),
                }
            }
        }

        Ok(())
    }

    /// Build a configuration from `BRNET_*` environment variables, falling
    /// back to defaults. Used by daemon bootstrap code that does not carry an
    /// explicit option blob.
    pub fn from_env() -> BridgeResult<Self> {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|s| !s.is_empty())
        }

        let mut config = Configuration::default();
        if let Some(name) = var("BRNET_BRIDGE_NAME") {
            config.bridge_name = name;
        }
        if let Some(subnet) = var("BRNET_SUBNET") {
            config.address_ipv4 = Some(subnet.parse().map_err(|_| {
                BridgeError::InvalidDriverConfig(format!("bad BRNET_SUBNET: {}", subnet))
            })?);
        }
        if let Some(cidr) = var("BRNET_FIXED_CIDR") {
            config.fixed_cidr = Some(cidr.parse().map_err(|_| {
                BridgeError::InvalidDriverConfig(format!("bad BRNET_FIXED_CIDR: {}", cidr))
            })?);
        }
        if let Some(mtu) = var("BRNET_MTU") {
            config.mtu = mtu.parse().map_err(|_| {
                BridgeError::InvalidDriverConfig(format!("bad BRNET_MTU: {}", mtu))
            })?;
        }
        if let Some(icc) = var("BRNET_ENABLE_ICC") {
            config.enable_icc = icc == "1" || icc.eq_ignore_ascii_case("true");
        }
        if let Some(masq) = var("BRNET_ENABLE_MASQUERADE") {
            config.enable_ip_masquerade = masq == "1" || masq.eq_ignore_ascii_case("true");
        }
        config.validate()?;
        Ok(config)
    }
}

/// Option shapes accepted by `Driver::configure`. The generic variant carries
/// raw structured configuration and is decoded by field name.
#[derive(Debug, Clone)]
pub enum DriverOptions {
    Generic(serde_json::Value),
    Typed(Configuration),
}

impl DriverOptions {
    pub fn into_configuration(self) -> BridgeResult<Configuration> {
        match self {
            DriverOptions::Typed(config) => Ok(config),
            DriverOptions::Generic(value) => serde_json::from_value(value)
                .map_err(|e| BridgeError::InvalidDriverConfig(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Configuration {
        Configuration {
            bridge_name: "br-test".to_string(),
            address_ipv4: Some("172.20.0.0/16".parse().unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn negative_mtu_rejected() {
        let config = Configuration {
            mtu: -1,
            ..base_config()
        };
        assert!(matches!(config.validate(), Err(BridgeError::InvalidMtu)));
    }

    #[test]
    fn container_subnet_must_be_subset() {
        let mut config = base_config();
        config.fixed_cidr = Some("172.20.5.0/24".parse().unwrap());
        assert!(config.validate().is_ok());

        config.fixed_cidr = Some("10.9.0.0/24".parse().unwrap());
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidContainerSubnet)
        ));

        // Wider than the bridge subnet is not a subset either.
        config.fixed_cidr = Some("172.0.0.0/8".parse().unwrap());
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidContainerSubnet)
        ));
    }

    #[test]
    fn v4_gateway_must_lie_in_bridge_subnet() {
        let mut config = base_config();
        config.default_gateway_ipv4 = Some("172.20.0.254".parse().unwrap());
        assert!(config.validate().is_ok());

        config.default_gateway_ipv4 = Some("192.168.1.1".parse().unwrap());
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidGateway)
        ));
    }

    #[test]
    fn v6_gateway_requires_containing_cidr() {
        let mut config = base_config();
        config.enable_ipv6 = true;
        config.default_gateway_ipv6 = Some("fd00::1".parse().unwrap());
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidGateway)
        ));

        config.fixed_cidr_v6 = Some("fd00::/64".parse().unwrap());
        assert!(config.validate().is_ok());

        config.default_gateway_ipv6 = Some("fd01::1".parse().unwrap());
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidGateway)
        ));
    }

    #[test]
    fn generic_options_decode_by_field_name() {
        let blob = serde_json::json!({
            "bridge_name": "br-test",
            "address_ipv4": "172.20.0.0/16",
            "enable_iptables": true,
            "enable_icc": false,
        });
        let config = DriverOptions::Generic(blob).into_configuration().unwrap();
        assert_eq!(config.bridge_name, "br-test");
        assert!(!config.enable_icc);
        assert_eq!(
            config.address_ipv4,
            Some("172.20.0.0/16".parse().unwrap())
        );
    }
}
