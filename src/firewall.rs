//! Host firewall control.
//!
//! A traffic flip installs NAT rules redirecting a public port at the new
//! container; each installation returns an inverse which deletes exactly the
//! rules it created. Rules carry a `hanoverd-<port>` comment so that an
//! operator can identify leftovers if the process dies uncleanly.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{HanoverdError, Result};

/// Undoes one firewall installation. Runs at most once.
#[async_trait]
pub trait RuleInverse: Send {
    async fn remove(self: Box<Self>) -> Result<()>;
}

/// Installs a redirect of host traffic to a container, returning its inverse.
#[async_trait]
pub trait FirewallController: Send + Sync {
    /// Redirect traffic arriving at `public_port` to the container:
    /// off-machine traffic to `container_ip:internal_port`, locally-originated
    /// traffic to the docker-published `mapped_port`.
    async fn install(
        &self,
        public_port: u16,
        mapped_port: u16,
        container_ip: &str,
        internal_port: u16,
    ) -> Result<Box<dyn RuleInverse>>;
}

/// Firewall controller shelling out to `iptables`.
#[derive(Debug, Clone)]
pub struct IptablesController {
    path: String,
}

impl IptablesController {
    pub fn new() -> Self {
        Self { path: "iptables".to_string() }
    }

    /// Ensure `iptables --list` runs without error. Called at startup so a
    /// missing binary or missing privileges abort before any container runs.
    pub async fn check(&self) -> Result<()> {
        self.exec(&["--list".to_string()]).await
    }

    /// Invoke iptables with `args`, appending `--wait` so we do not return
    /// before the change takes effect. Stderr goes to ours.
    async fn exec(&self, args: &[String]) -> Result<()> {
        let status = Command::new(&self.path)
            .args(args)
            .arg("--wait")
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| HanoverdError::firewall(format!("running {}: {}", self.path, e)))?;

        if !status.success() {
            return Err(HanoverdError::firewall(format!(
                "{} {} exited with {}",
                self.path,
                args.join(" "),
                status
            )));
        }
        Ok(())
    }

    async fn insert(&self, chain: &str, rule: &[String]) -> Result<()> {
        let mut args = vec!["--insert".to_string(), chain.to_string(), "1".to_string()];
        args.extend_from_slice(rule);
        self.exec(&args).await
    }

    async fn delete(&self, chain: &str, rule: &[String]) -> Result<()> {
        let mut args = vec!["--delete".to_string(), chain.to_string()];
        args.extend_from_slice(rule);
        self.exec(&args).await
    }
}

impl Default for IptablesController {
    fn default() -> Self {
        Self::new()
    }
}

/// Rule matching traffic addressed to `public_port` on a local address, but
/// not already destined for the container itself.
fn match_args(public_port: u16, container_ip: &str) -> Vec<String> {
    vec![
        "--table".to_string(),
        "nat".to_string(),
        "--protocol".to_string(),
        "tcp".to_string(),
        // Don't redirect packets already going to the container.
        "--match".to_string(),
        "tcp".to_string(),
        "!".to_string(),
        "--destination".to_string(),
        container_ip.to_string(),
        // Don't redirect ports on remote servers (i.e. don't make
        // google:80 hit our container).
        "--match".to_string(),
        "addrtype".to_string(),
        "--dst-type".to_string(),
        "LOCAL".to_string(),
        "--dport".to_string(),
        public_port.to_string(),
        "--match".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        format!("hanoverd-{}", public_port),
    ]
}

fn prerouting_rule(public_port: u16, container_ip: &str, internal_port: u16) -> Vec<String> {
    let mut rule = match_args(public_port, container_ip);
    rule.extend([
        "--jump".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        format!("{}:{}", container_ip, internal_port),
    ]);
    rule
}

fn output_rule(public_port: u16, mapped_port: u16, container_ip: &str) -> Vec<String> {
    let mut rule = match_args(public_port, container_ip);
    rule.extend([
        "--jump".to_string(),
        "REDIRECT".to_string(),
        "--to-ports".to_string(),
        mapped_port.to_string(),
    ]);
    rule
}

struct IptablesInverse {
    controller: IptablesController,
    prerouting: Vec<String>,
    output: Vec<String>,
    public_port: u16,
}

#[async_trait]
impl RuleInverse for IptablesInverse {
    async fn remove(self: Box<Self>) -> Result<()> {
        let mut first_err = None;
        if let Err(e) = self.controller.delete("PREROUTING", &self.prerouting).await {
            warn!("Failed to remove PREROUTING rule for port {}: {}", self.public_port, e);
            first_err = Some(e);
        }
        if let Err(e) = self.controller.delete("OUTPUT", &self.output).await {
            warn!("Failed to remove OUTPUT rule for port {}: {}", self.public_port, e);
            first_err.get_or_insert(e);
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[async_trait]
impl FirewallController for IptablesController {
    async fn install(
        &self,
        public_port: u16,
        mapped_port: u16,
        container_ip: &str,
        internal_port: u16,
    ) -> Result<Box<dyn RuleInverse>> {
        let prerouting = prerouting_rule(public_port, container_ip, internal_port);
        let output = output_rule(public_port, mapped_port, container_ip);

        self.insert("PREROUTING", &prerouting).await?;
        if let Err(e) = self.insert("OUTPUT", &output).await {
            // Don't leave the half-installed redirect behind.
            if let Err(cleanup) = self.delete("PREROUTING", &prerouting).await {
                warn!("Failed to roll back PREROUTING rule: {}", cleanup);
            }
            return Err(e);
        }

        info!(
            "Installed redirect: public {} -> {}:{} (local -> {})",
            public_port, container_ip, internal_port, mapped_port
        );

        Ok(Box::new(IptablesInverse {
            controller: self.clone(),
            prerouting,
            output,
            public_port,
        }))
    }
}

/// Recording firewall for tests. Tracks installed and removed rules and can
/// be told to fail installations.
#[derive(Default)]
pub struct MockFirewall {
    state: Arc<Mutex<MockFirewallState>>,
}

#[derive(Default)]
struct MockFirewallState {
    installed: Vec<(u16, u16, String, u16)>,
    removed: Vec<u16>,
    fail_installs: bool,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_installs(&self) {
        self.state.lock().unwrap().fail_installs = true;
    }

    /// `(public, mapped, container_ip, internal)` tuples, in install order.
    pub fn installed(&self) -> Vec<(u16, u16, String, u16)> {
        self.state.lock().unwrap().installed.clone()
    }

    /// Public ports whose inverses have run, in removal order.
    pub fn removed(&self) -> Vec<u16> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Count of rules currently installed and not yet removed.
    pub fn active(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.installed.len() - state.removed.len()
    }
}

struct MockInverse {
    state: Arc<Mutex<MockFirewallState>>,
    public_port: u16,
}

#[async_trait]
impl RuleInverse for MockInverse {
    async fn remove(self: Box<Self>) -> Result<()> {
        self.state.lock().unwrap().removed.push(self.public_port);
        Ok(())
    }
}

#[async_trait]
impl FirewallController for MockFirewall {
    async fn install(
        &self,
        public_port: u16,
        mapped_port: u16,
        container_ip: &str,
        internal_port: u16,
    ) -> Result<Box<dyn RuleInverse>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_installs {
            return Err(HanoverdError::firewall("mock install failure"));
        }
        state
            .installed
            .push((public_port, mapped_port, container_ip.to_string(), internal_port));
        Ok(Box::new(MockInverse { state: self.state.clone(), public_port }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_carry_comment_tag() {
        let rule = prerouting_rule(8080, "172.17.0.2", 80);
        assert!(rule.contains(&"hanoverd-8080".to_string()));
        assert!(rule.windows(2).any(|w| w[0] == "--jump" && w[1] == "DNAT"));
        assert!(rule.contains(&"172.17.0.2:80".to_string()));
    }

    #[test]
    fn test_output_rule_redirects_to_mapped_port() {
        let rule = output_rule(8080, 49153, "172.17.0.2");
        assert!(rule.windows(2).any(|w| w[0] == "--jump" && w[1] == "REDIRECT"));
        assert!(rule.windows(2).any(|w| w[0] == "--to-ports" && w[1] == "49153"));
    }

    #[tokio::test]
    async fn test_mock_firewall_records_install_and_remove() {
        let firewall = MockFirewall::new();
        let inverse = firewall.install(8080, 49153, "172.17.0.2", 80).await.unwrap();
        assert_eq!(firewall.active(), 1);

        inverse.remove().await.unwrap();
        assert_eq!(firewall.active(), 0);
        assert_eq!(firewall.removed(), vec![8080]);
    }

    #[tokio::test]
    async fn test_mock_firewall_can_fail() {
        let firewall = MockFirewall::new();
        firewall.fail_installs();
        assert!(firewall.install(8080, 49153, "172.17.0.2", 80).await.is_err());
    }
}
