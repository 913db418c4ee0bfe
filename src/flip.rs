//! The serialized traffic-flip controller.
//!
//! A single consumer task owns the firewall and the live pointer. Ready
//! generations are enqueued in the order they become ready; for each one the
//! controller installs the configured redirects, then retires the previous
//! live generation after the overlap grace delay. A `None` candidate (used by
//! disable-overlap mode) closes the current live generation without
//! promoting anything.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::PortBindings;
use crate::container::Generation;
use crate::error::HanoverdError;
use crate::firewall::{FirewallController, RuleInverse};
use crate::latch::TaskGroup;

/// A candidate for promotion, or `None` to just retire the current live
/// generation.
pub type FlipRequest = Option<Arc<Generation>>;

pub struct FlipController {
    firewall: Arc<dyn FirewallController>,
    port_bindings: PortBindings,
    overlap_grace: Duration,
    group: TaskGroup,
    live: Option<Arc<Generation>>,
}

impl FlipController {
    pub fn new(
        firewall: Arc<dyn FirewallController>,
        port_bindings: PortBindings,
        overlap_grace: Duration,
        group: TaskGroup,
    ) -> Self {
        Self {
            firewall,
            port_bindings,
            overlap_grace,
            group,
            live: None,
        }
    }

    /// Consume candidates until the queue closes. Runs as the single owner
    /// of the firewall.
    pub async fn run(mut self, mut requests: mpsc::Receiver<FlipRequest>) {
        while let Some(request) = requests.recv().await {
            match request {
                Some(generation) => self.promote(generation).await,
                None => {
                    if let Some(live) = self.live.take() {
                        info!("Retiring live container before next: {}", live.name);
                        live.closing.fall();
                    }
                }
            }
        }
    }

    async fn promote(&mut self, generation: Arc<Generation>) {
        if generation.closing.has_fallen() {
            // Closed between becoming ready and reaching the queue; nothing
            // to promote.
            return;
        }

        info!("Container going live: {}", generation.name);

        let inverses = match self.install_rules(&generation).await {
            Ok(inverses) => inverses,
            Err(e) => {
                error!("Flip of {} failed: {}", generation.name, e);
                generation.failed.fall();
                return;
            }
        };

        // The rules installed for this generation are removed exactly once,
        // when its teardown begins.
        {
            let closing = generation.closing.clone();
            let name = generation.name.clone();
            let guard = self.group.guard();
            tokio::spawn(async move {
                let _guard = guard;
                closing.wait().await;
                for inverse in inverses {
                    if let Err(e) = inverse.remove().await {
                        warn!("Removing firewall rule for {} failed: {}", name, e);
                    }
                }
            });
        }

        let previous = self.live.replace(generation);
        if let Some(previous) = previous {
            // Retire the old generation off the critical path so the next
            // candidate can be accepted immediately.
            let grace = self.overlap_grace;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(grace) => {
                        info!("Overlap grace elapsed, closing {}", previous.name);
                    }
                    _ = previous.closing.wait() => {}
                }
                previous.closing.fall();
            });
        }
    }

    /// Install every configured redirect for `generation`, rolling back the
    /// already-installed rules if any of them cannot be applied.
    async fn install_rules(
        &self,
        generation: &Arc<Generation>,
    ) -> crate::error::Result<Vec<Box<dyn RuleInverse>>> {
        let container_ip = generation
            .ip_address()
            .ok_or_else(|| HanoverdError::internal("no network snapshot for generation"))?;

        let mut inverses: Vec<Box<dyn RuleInverse>> = Vec::new();

        for (&internal, bindings) in &self.port_bindings {
            let Some(mapped) = generation.mapped_port(internal) else {
                rollback(inverses).await;
                return Err(HanoverdError::PortNotExposed(internal));
            };

            for binding in bindings {
                // If no public port was specified, use the internal port.
                let public = binding.host_port.unwrap_or(internal);
                match self.firewall.install(public, mapped, &container_ip, internal).await {
                    Ok(inverse) => inverses.push(inverse),
                    Err(e) => {
                        rollback(inverses).await;
                        return Err(e);
                    }
                }
            }
        }

        Ok(inverses)
    }
}

async fn rollback(inverses: Vec<Box<dyn RuleInverse>>) {
    for inverse in inverses {
        if let Err(e) = inverse.remove().await {
            warn!("Rolling back firewall rule failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Options, PublishBinding};
    use crate::firewall::MockFirewall;
    use crate::latch::TaskGroup;
    use crate::runtime::{ContainerRuntime, CreateSpec, MappedPort, MockRuntime, NetworkInfo};
    use std::collections::HashMap;

    async fn started_generation(ports: HashMap<u16, Vec<MappedPort>>) -> Arc<Generation> {
        // Drive a mock container far enough that the generation has a
        // network snapshot, by creating/inspecting through the same path the
        // lifecycle uses.
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::with_networks(vec![
            NetworkInfo { ip_address: "172.17.0.2".to_string(), ports },
        ]));
        let options = Options {
            env: vec![],
            volumes: vec![],
            container_args: vec![],
            status_uri: "/".to_string(),
            port_bindings: HashMap::new(),
            disable_overlap: false,
            overlap_grace: Duration::from_millis(10),
        };
        let generation = Generation::new(
            runtime.clone(),
            crate::container::probe::client(),
            "web-0".to_string(),
            0,
            &options,
            TaskGroup::new(),
        );

        // Populate the snapshot the way run() does.
        let id = runtime
            .create(&CreateSpec { name: "web-0".to_string(), ..Default::default() })
            .await
            .unwrap();
        let network = runtime.inspect(&id).await.unwrap();
        generation.set_network(network);
        generation
    }

    fn bindings(public: Option<u16>, internal: u16) -> PortBindings {
        HashMap::from([(
            internal,
            vec![PublishBinding { host_ip: None, host_port: public }],
        )])
    }

    #[tokio::test]
    async fn test_promote_installs_rules_and_removes_on_closing() {
        let generation = started_generation(HashMap::from([(
            80,
            vec![MappedPort { host_ip: "127.0.0.1".to_string(), host_port: 49153 }],
        )]))
        .await;

        let firewall = Arc::new(MockFirewall::new());
        let group = TaskGroup::new();
        let mut controller = FlipController::new(
            firewall.clone(),
            bindings(Some(8080), 80),
            Duration::from_millis(10),
            group.clone(),
        );

        controller.promote(generation.clone()).await;
        assert_eq!(
            firewall.installed(),
            vec![(8080, 49153, "172.17.0.2".to_string(), 80)]
        );
        assert_eq!(firewall.active(), 1);

        generation.closing.fall();
        group.wait().await;
        assert_eq!(firewall.active(), 0);
        assert_eq!(firewall.removed(), vec![8080]);
    }

    #[tokio::test]
    async fn test_missing_host_port_defaults_to_internal() {
        let generation = started_generation(HashMap::from([(
            80,
            vec![MappedPort { host_ip: "127.0.0.1".to_string(), host_port: 49153 }],
        )]))
        .await;

        let firewall = Arc::new(MockFirewall::new());
        let mut controller = FlipController::new(
            firewall.clone(),
            bindings(None, 80),
            Duration::from_millis(10),
            TaskGroup::new(),
        );

        controller.promote(generation).await;
        assert_eq!(firewall.installed()[0].0, 80);
    }

    #[tokio::test]
    async fn test_unexposed_port_fails_generation() {
        let generation = started_generation(HashMap::new()).await;

        let firewall = Arc::new(MockFirewall::new());
        let mut controller = FlipController::new(
            firewall.clone(),
            bindings(Some(8080), 80),
            Duration::from_millis(10),
            TaskGroup::new(),
        );

        controller.promote(generation.clone()).await;
        assert!(generation.failed.has_fallen());
        assert!(firewall.installed().is_empty());
    }

    #[tokio::test]
    async fn test_install_error_rolls_back_and_fails() {
        let generation = started_generation(HashMap::from([(
            80,
            vec![MappedPort { host_ip: "127.0.0.1".to_string(), host_port: 49153 }],
        )]))
        .await;

        let firewall = Arc::new(MockFirewall::new());
        firewall.fail_installs();
        let mut controller = FlipController::new(
            firewall.clone(),
            bindings(Some(8080), 80),
            Duration::from_millis(10),
            TaskGroup::new(),
        );

        controller.promote(generation.clone()).await;
        assert!(generation.failed.has_fallen());
        assert_eq!(firewall.active(), 0);
    }

    #[tokio::test]
    async fn test_new_live_closes_previous_after_grace() {
        let first = started_generation(HashMap::from([(
            80,
            vec![MappedPort { host_ip: "127.0.0.1".to_string(), host_port: 49153 }],
        )]))
        .await;
        let second = started_generation(HashMap::from([(
            80,
            vec![MappedPort { host_ip: "127.0.0.1".to_string(), host_port: 49154 }],
        )]))
        .await;

        let firewall = Arc::new(MockFirewall::new());
        let mut controller = FlipController::new(
            firewall.clone(),
            bindings(Some(8080), 80),
            Duration::from_millis(20),
            TaskGroup::new(),
        );

        controller.promote(first.clone()).await;
        controller.promote(second.clone()).await;

        assert!(!second.closing.has_fallen());
        tokio::time::timeout(Duration::from_secs(1), first.closing.wait())
            .await
            .expect("previous live generation must close after grace");
    }

    #[tokio::test]
    async fn test_none_request_retires_live() {
        let generation = started_generation(HashMap::from([(
            80,
            vec![MappedPort { host_ip: "127.0.0.1".to_string(), host_port: 49153 }],
        )]))
        .await;

        let firewall = Arc::new(MockFirewall::new());
        let controller = FlipController::new(
            firewall.clone(),
            bindings(Some(8080), 80),
            Duration::from_millis(10),
            TaskGroup::new(),
        );

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(controller.run(rx));

        tx.send(Some(generation.clone())).await.unwrap();
        tx.send(None).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(generation.closing.has_fallen());
    }
}
