// Packet-filter and NAT programming for the bridge: MASQUERADE, the ICC
// policy on the forward path, the port-publishing DNAT chain, and the
// inter-container link ACLs.
//
// Rule application goes through the `FirewallBackend` seam; production uses
// `IptablesBackend`, which probes with `iptables -C` before mutating so every
// operation is idempotent.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::{BridgeError, BridgeResult};
use crate::types::Protocol;

/// NAT chain owned by the driver for port publications.
pub const NAT_CHAIN: &str = "BRNET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

/// A single iptables rule: table, chain and the match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    pub args: Vec<String>,
}

impl Rule {
    pub fn new(table: Table, chain: &str, args: &[&str]) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} {} {}",
            self.table.as_str(),
            self.chain,
            self.args.join(" ")
        )
    }
}

/// Rule application surface. Every method is idempotent from the caller's
/// point of view: appending an existing rule or deleting a missing one is Ok.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Create a chain if it does not exist.
    async fn ensure_chain(&self, table: Table, chain: &str) -> BridgeResult<()>;

    async fn rule_exists(&self, rule: &Rule) -> BridgeResult<bool>;

    /// Append the rule to the end of its chain.
    async fn append(&self, rule: &Rule) -> BridgeResult<()>;

    /// Insert the rule at the head of its chain.
    async fn insert(&self, rule: &Rule) -> BridgeResult<()>;

    async fn delete(&self, rule: &Rule) -> BridgeResult<()>;
}

/// Production backend driving the `iptables` binary.
pub struct IptablesBackend;

impl IptablesBackend {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[String]) -> BridgeResult<()> {
        let output = tokio::process::Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(BridgeError::Io)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BridgeError::Firewall {
                cmd: format!("iptables {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    async fn probe(&self, args: &[String]) -> BridgeResult<bool> {
        let output = tokio::process::Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(BridgeError::Io)?;
        Ok(output.status.success())
    }

    fn rule_args(op: &str, rule: &Rule) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            rule.table.as_str().to_string(),
            op.to_string(),
            rule.chain.clone(),
        ];
        if op == "-I" {
            args.push("1".to_string());
        }
        args.extend(rule.args.iter().cloned());
        args
    }
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    async fn ensure_chain(&self, table: Table, chain: &str) -> BridgeResult<()> {
        let probe = vec![
            "-t".to_string(),
            table.as_str().to_string(),
            "-L".to_string(),
            chain.to_string(),
            "-n".to_string(),
        ];
        if self.probe(&probe).await? {
            return Ok(());
        }
        self.run(&[
            "-t".to_string(),
            table.as_str().to_string(),
            "-N".to_string(),
            chain.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn rule_exists(&self, rule: &Rule) -> BridgeResult<bool> {
        self.probe(&Self::rule_args("-C", rule)).await
    }

    async fn append(&self, rule: &Rule) -> BridgeResult<()> {
        if self.rule_exists(rule).await? {
            return Ok(());
        }
        self.run(&Self::rule_args("-A", rule)).await?;
        Ok(())
    }

    async fn insert(&self, rule: &Rule) -> BridgeResult<()> {
        if self.rule_exists(rule).await? {
            return Ok(());
        }
        self.run(&Self::rule_args("-I", rule)).await?;
        Ok(())
    }

    async fn delete(&self, rule: &Rule) -> BridgeResult<()> {
        if !self.rule_exists(rule).await? {
            return Ok(());
        }
        self.run(&Self::rule_args("-D", rule)).await?;
        Ok(())
    }
}

/// High-level firewall programmer for the bridge driver.
pub struct Firewall {
    backend: std::sync::Arc<dyn FirewallBackend>,
}

impl Firewall {
    pub fn new(backend: std::sync::Arc<dyn FirewallBackend>) -> Self {
        Self { backend }
    }

    fn masquerade_rule(bridge: &str, subnet: Ipv4Net) -> Rule {
        Rule::new(
            Table::Nat,
            "POSTROUTING",
            &[
                "-s",
                &subnet.to_string(),
                "!",
                "-o",
                bridge,
                "-j",
                "MASQUERADE",
            ],
        )
    }

    fn outbound_rule(bridge: &str) -> Rule {
        Rule::new(
            Table::Filter,
            "FORWARD",
            &["-i", bridge, "!", "-o", bridge, "-j", "ACCEPT"],
        )
    }

    fn conntrack_rule(bridge: &str) -> Rule {
        Rule::new(
            Table::Filter,
            "FORWARD",
            &[
                "-o",
                bridge,
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        )
    }

    fn icc_rule(bridge: &str, target: &str) -> Rule {
        Rule::new(
            Table::Filter,
            "FORWARD",
            &["-i", bridge, "-o", bridge, "-j", target],
        )
    }

    /// Install the driver's chains and base policy for a bridge: the port
    /// publishing chain with its PREROUTING/OUTPUT jumps, outbound and
    /// return-path ACCEPTs, optional MASQUERADE, and the ICC policy.
    pub async fn setup_bridge(
        &self,
        bridge: &str,
        subnet: Ipv4Net,
        masquerade: bool,
        icc: bool,
    ) -> BridgeResult<()> {
        self.backend.ensure_chain(Table::Nat, NAT_CHAIN).await?;
        self.backend
            .append(&Rule::new(
                Table::Nat,
                "PREROUTING",
                &["-m", "addrtype", "--dst-type", "LOCAL", "-j", NAT_CHAIN],
            ))
            .await?;
        self.backend
            .append(&Rule::new(
                Table::Nat,
                "OUTPUT",
                &[
                    "!",
                    "-d",
                    "127.0.0.0/8",
                    "-m",
                    "addrtype",
                    "--dst-type",
                    "LOCAL",
                    "-j",
                    NAT_CHAIN,
                ],
            ))
            .await?;

        if masquerade {
            self.backend
                .append(&Self::masquerade_rule(bridge, subnet))
                .await?;
        }

        self.backend.append(&Self::outbound_rule(bridge)).await?;
        self.backend.append(&Self::conntrack_rule(bridge)).await?;

        self.set_icc(bridge, icc).await?;

        tracing::info!(bridge, %subnet, masquerade, icc, "firewall base rules installed");
        Ok(())
    }

    /// Program the inter-container policy on the bridge's forward path.
    /// With ICC disabled, bridge-local traffic is dropped unless a link ACL
    /// accepts it first.
    pub async fn set_icc(&self, bridge: &str, enabled: bool) -> BridgeResult<()> {
        let accept = Self::icc_rule(bridge, "ACCEPT");
        let drop = Self::icc_rule(bridge, "DROP");
        if enabled {
            self.backend.delete(&drop).await?;
            self.backend.append(&accept).await?;
        } else {
            self.backend.delete(&accept).await?;
            self.backend.append(&drop).await?;
        }
        Ok(())
    }

    fn dnat_rule(
        proto: Protocol,
        host_ip: Option<IpAddr>,
        host_port: u16,
        container_ip: Ipv4Addr,
        container_port: u16,
    ) -> Rule {
        let mut args: Vec<String> = vec!["-p".into(), proto.as_str().into()];
        if let Some(ip) = host_ip {
            args.push("-d".into());
            args.push(ip.to_string());
        }
        args.extend([
            "--dport".to_string(),
            host_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", container_ip, container_port),
        ]);
        Rule {
            table: Table::Nat,
            chain: NAT_CHAIN.to_string(),
            args,
        }
    }

    fn forward_accept_rule(proto: Protocol, container_ip: Ipv4Addr, container_port: u16) -> Rule {
        Rule::new(
            Table::Filter,
            "FORWARD",
            &[
                "-p",
                proto.as_str(),
                "-d",
                &container_ip.to_string(),
                "--dport",
                &container_port.to_string(),
                "-j",
                "ACCEPT",
            ],
        )
    }

    /// Install the DNAT and forward-accept pair for one realized binding.
    /// On partial failure the DNAT rule is retracted before the error is
    /// returned, so a failed publication leaves nothing behind.
    pub async fn publish_port(
        &self,
        proto: Protocol,
        host_ip: Option<IpAddr>,
        host_port: u16,
        container_ip: Ipv4Addr,
        container_port: u16,
    ) -> BridgeResult<()> {
        let dnat = Self::dnat_rule(proto, host_ip, host_port, container_ip, container_port);
        let accept = Self::forward_accept_rule(proto, container_ip, container_port);

        self.backend.append(&dnat).await?;
        if let Err(e) = self.backend.append(&accept).await {
            if let Err(undo) = self.backend.delete(&dnat).await {
                tracing::warn!(error = %undo, "failed to retract DNAT after partial publish");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Retract the rules of one realized binding. Never fails the caller.
    pub async fn unpublish_port(
        &self,
        proto: Protocol,
        host_ip: Option<IpAddr>,
        host_port: u16,
        container_ip: Ipv4Addr,
        container_port: u16,
    ) {
        let dnat = Self::dnat_rule(proto, host_ip, host_port, container_ip, container_port);
        let accept = Self::forward_accept_rule(proto, container_ip, container_port);
        for rule in [dnat, accept] {
            if let Err(e) = self.backend.delete(&rule).await {
                tracing::warn!(rule = %rule, error = %e, "failed to retract port rule");
            }
        }
    }

    fn link_rules(
        bridge: &str,
        from: Ipv4Addr,
        to: Ipv4Addr,
        proto: Protocol,
        port: u16,
    ) -> [Rule; 2] {
        let forward = Rule::new(
            Table::Filter,
            "FORWARD",
            &[
                "-i",
                bridge,
                "-o",
                bridge,
                "-p",
                proto.as_str(),
                "-s",
                &from.to_string(),
                "-d",
                &to.to_string(),
                "--dport",
                &port.to_string(),
                "-j",
                "ACCEPT",
            ],
        );
        let reverse = Rule::new(
            Table::Filter,
            "FORWARD",
            &[
                "-i",
                bridge,
                "-o",
                bridge,
                "-p",
                proto.as_str(),
                "-s",
                &to.to_string(),
                "-d",
                &from.to_string(),
                "--sport",
                &port.to_string(),
                "-j",
                "ACCEPT",
            ],
        );
        [forward, reverse]
    }

    /// Permit `from` to reach `to` on one published port despite ICC being
    /// disabled. Inserted at the head of the chain so the ACL lands ahead of
    /// the bridge-local DROP.
    pub async fn allow_link(
        &self,
        bridge: &str,
        from: Ipv4Addr,
        to: Ipv4Addr,
        proto: Protocol,
        port: u16,
    ) -> BridgeResult<()> {
        let [forward, reverse] = Self::link_rules(bridge, from, to, proto, port);
        self.backend.insert(&forward).await?;
        if let Err(e) = self.backend.insert(&reverse).await {
            if let Err(undo) = self.backend.delete(&forward).await {
                tracing::warn!(error = %undo, "failed to retract link rule after partial enable");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove a link ACL. Missing rules are ignored; errors are logged, not
    /// propagated, so teardown always completes.
    pub async fn deny_link(
        &self,
        bridge: &str,
        from: Ipv4Addr,
        to: Ipv4Addr,
        proto: Protocol,
        port: u16,
    ) {
        for rule in Self::link_rules(bridge, from, to, proto, port) {
            if let Err(e) = self.backend.delete(&rule).await {
                tracing::warn!(rule = %rule, error = %e, "failed to remove link rule");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mem {
    //! Recording backend: keeps ordered per-chain rule lists in memory, with
    //! substring-based failure injection for rollback tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MemBackend {
        rules: Mutex<Vec<Rule>>,
        chains: Mutex<Vec<(Table, String)>>,
        fail_on: Mutex<Option<String>>,
    }

    impl MemBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail any mutation whose rendered rule contains `needle`.
        pub fn fail_matching(&self, needle: &str) {
            *self.fail_on.lock() = Some(needle.to_string());
        }

        pub fn clear_failures(&self) {
            *self.fail_on.lock() = None;
        }

        pub fn rule_count(&self) -> usize {
            self.rules.lock().len()
        }

        /// Rendered rules of one chain, head first.
        pub fn chain_rules(&self, table: Table, chain: &str) -> Vec<String> {
            self.rules
                .lock()
                .iter()
                .filter(|r| r.table == table && r.chain == chain)
                .map(|r| r.args.join(" "))
                .collect()
        }

        pub fn has_rule(&self, table: Table, chain: &str, needle: &str) -> bool {
            self.chain_rules(table, chain)
                .iter()
                .any(|r| r.contains(needle))
        }

        fn check(&self, rule: &Rule) -> BridgeResult<()> {
            if let Some(needle) = self.fail_on.lock().as_deref() {
                if rule.to_string().contains(needle) {
                    return Err(BridgeError::Firewall {
                        cmd: rule.to_string(),
                        stderr: "injected failure".to_string(),
                    });
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FirewallBackend for MemBackend {
        async fn ensure_chain(&self, table: Table, chain: &str) -> BridgeResult<()> {
            let mut chains = self.chains.lock();
            let key = (table, chain.to_string());
            if !chains.contains(&key) {
                chains.push(key);
            }
            Ok(())
        }

        async fn rule_exists(&self, rule: &Rule) -> BridgeResult<bool> {
            Ok(self.rules.lock().contains(rule))
        }

        async fn append(&self, rule: &Rule) -> BridgeResult<()> {
            self.check(rule)?;
            let mut rules = self.rules.lock();
            if !rules.contains(rule) {
                rules.push(rule.clone());
            }
            Ok(())
        }

        async fn insert(&self, rule: &Rule) -> BridgeResult<()> {
            self.check(rule)?;
            let mut rules = self.rules.lock();
            if !rules.contains(rule) {
                rules.insert(0, rule.clone());
            }
            Ok(())
        }

        async fn delete(&self, rule: &Rule) -> BridgeResult<()> {
            self.check(rule)?;
            self.rules.lock().retain(|r| r != rule);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mem::MemBackend;
    use super::*;
    use std::sync::Arc;

    fn fixture() -> (Arc<MemBackend>, Firewall) {
        let backend = Arc::new(MemBackend::new());
        let fw = Firewall::new(backend.clone());
        (backend, fw)
    }

    #[tokio::test]
    async fn base_setup_installs_masquerade_and_jumps() {
        let (backend, fw) = fixture();
        fw.setup_bridge("br-test", "172.20.0.0/16".parse().unwrap(), true, true)
            .await
            .unwrap();

        assert!(backend.has_rule(Table::Nat, "POSTROUTING", "MASQUERADE"));
        assert!(backend.has_rule(Table::Nat, "POSTROUTING", "172.20.0.0/16"));
        assert!(backend.has_rule(Table::Nat, "PREROUTING", NAT_CHAIN));
        assert!(backend.has_rule(Table::Filter, "FORWARD", "-i br-test ! -o br-test -j ACCEPT"));
        assert!(backend.has_rule(Table::Filter, "FORWARD", "RELATED,ESTABLISHED"));
        assert!(backend.has_rule(Table::Filter, "FORWARD", "-i br-test -o br-test -j ACCEPT"));
    }

    #[tokio::test]
    async fn icc_disabled_drops_bridge_local_traffic() {
        let (backend, fw) = fixture();
        fw.setup_bridge("br-test", "172.20.0.0/16".parse().unwrap(), false, false)
            .await
            .unwrap();

        assert!(backend.has_rule(Table::Filter, "FORWARD", "-i br-test -o br-test -j DROP"));
        assert!(!backend.has_rule(Table::Filter, "FORWARD", "-i br-test -o br-test -j ACCEPT"));
        assert!(!backend.has_rule(Table::Nat, "POSTROUTING", "MASQUERADE"));
    }

    #[tokio::test]
    async fn icc_toggle_swaps_policy() {
        let (backend, fw) = fixture();
        fw.set_icc("br0", false).await.unwrap();
        assert!(backend.has_rule(Table::Filter, "FORWARD", "-j DROP"));
        fw.set_icc("br0", true).await.unwrap();
        assert!(!backend.has_rule(Table::Filter, "FORWARD", "-j DROP"));
        assert!(backend.has_rule(Table::Filter, "FORWARD", "-j ACCEPT"));
    }

    #[tokio::test]
    async fn publish_port_installs_dnat_and_accept() {
        let (backend, fw) = fixture();
        fw.publish_port(
            Protocol::Tcp,
            None,
            8080,
            "172.20.0.2".parse().unwrap(),
            80,
        )
        .await
        .unwrap();

        assert!(backend.has_rule(Table::Nat, NAT_CHAIN, "--to-destination 172.20.0.2:80"));
        assert!(backend.has_rule(Table::Filter, "FORWARD", "-d 172.20.0.2 --dport 80 -j ACCEPT"));

        fw.unpublish_port(
            Protocol::Tcp,
            None,
            8080,
            "172.20.0.2".parse().unwrap(),
            80,
        )
        .await;
        assert_eq!(backend.rule_count(), 0);
    }

    #[tokio::test]
    async fn failed_publish_leaves_nothing_behind() {
        let (backend, fw) = fixture();
        backend.fail_matching("FORWARD");
        let result = fw
            .publish_port(
                Protocol::Udp,
                None,
                5353,
                "172.20.0.9".parse().unwrap(),
                53,
            )
            .await;
        assert!(result.is_err());
        backend.clear_failures();
        assert_eq!(backend.rule_count(), 0);
    }

    #[tokio::test]
    async fn link_acl_lands_ahead_of_drop_and_is_reversible() {
        let (backend, fw) = fixture();
        fw.set_icc("br0", false).await.unwrap();

        let parent: Ipv4Addr = "172.20.0.2".parse().unwrap();
        let child: Ipv4Addr = "172.20.0.3".parse().unwrap();
        fw.allow_link("br0", parent, child, Protocol::Tcp, 80)
            .await
            .unwrap();

        let forward = backend.chain_rules(Table::Filter, "FORWARD");
        // Head of chain must be a link ACCEPT, not the DROP.
        assert!(forward[0].contains("-j ACCEPT"));
        assert!(backend.has_rule(
            Table::Filter,
            "FORWARD",
            "-s 172.20.0.2 -d 172.20.0.3 --dport 80"
        ));

        fw.deny_link("br0", parent, child, Protocol::Tcp, 80).await;
        assert!(!backend.has_rule(Table::Filter, "FORWARD", "-s 172.20.0.2"));
        // The ICC DROP itself stays.
        assert!(backend.has_rule(Table::Filter, "FORWARD", "-j DROP"));
    }
}
