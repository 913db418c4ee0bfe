//! The supervisor loop.
//!
//! Translates the external trigger stream into a disciplined series of
//! generations: each trigger supersedes the previous generation, spawns a
//! new one, and watches its fate. Generations that become ready are handed
//! to the flip controller in the order they became ready; failed or
//! superseded ones are torn down and never reach it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Options;
use crate::container::{probe, Generation};
use crate::flip::FlipRequest;
use crate::latch::{Latch, TaskGroup};
use crate::runtime::ContainerRuntime;
use crate::source::ImageSource;
use crate::trigger::Trigger;

pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    options: Options,
    base_name: String,

    flip_tx: mpsc::Sender<FlipRequest>,

    /// Global shutdown; forwarded into every generation's `closing`.
    dying: Latch,
    group: TaskGroup,

    /// Next generation index. Strictly monotonic for the supervisor's life.
    next_index: u64,

    /// The previous generation's `superseded` latch, fallen when a newer
    /// generation is requested.
    supersede: Option<Latch>,
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        options: Options,
        base_name: String,
        flip_tx: mpsc::Sender<FlipRequest>,
        dying: Latch,
        group: TaskGroup,
    ) -> Self {
        Self {
            runtime,
            http: probe::client(),
            options,
            base_name,
            flip_tx,
            dying,
            group,
            next_index: 0,
            supersede: None,
        }
    }

    /// Consume triggers until global shutdown or the trigger stream closes.
    pub async fn run(
        mut self,
        mut triggers: mpsc::Receiver<Trigger>,
        source: Arc<dyn ImageSource>,
    ) {
        loop {
            let trigger = tokio::select! {
                _ = self.dying.wait() => break,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            self.launch(trigger, source.clone()).await;
        }

        // All generations receive closing through the dying forwarder.
        self.dying.fall();
        info!("Supervisor loop finished");
    }

    /// Start a new generation for one trigger, superseding the previous one.
    pub async fn launch(&mut self, trigger: Trigger, source: Arc<dyn ImageSource>) {
        let index = self.next_index;
        self.next_index += 1;
        let name = format!("{}-{}", self.base_name, index);

        if self.options.disable_overlap {
            // Kill the current live container before the new one starts.
            if self.flip_tx.send(None).await.is_err() {
                warn!("Flip controller gone, dropping disable-overlap request");
            }
        }

        let generation = Generation::new(
            self.runtime.clone(),
            self.http.clone(),
            name,
            index,
            &self.options,
            self.group.clone(),
        );

        // Let the trigger's originator observe when acquisition is taken off
        // the queue, and make global shutdown close this generation.
        generation.obtained.forward(&trigger.obtained);
        self.dying.forward(&generation.closing);

        if let Some(previous) = self.supersede.replace(generation.superseded.clone()) {
            previous.fall();
        }

        // Lifecycle driver.
        {
            let generation = generation.clone();
            let payload = trigger.payload;
            let guard = self.group.guard();
            tokio::spawn(async move {
                let _guard = guard;
                let name = generation.name.clone();
                match generation.run(source, payload).await {
                    Ok(status) => {
                        info!("Container {} quit, exit status: {}", name, status);
                    }
                    Err(e) if e.is_name_conflict() => {
                        error!("Container with name {:?} exists, aborting...", name);
                    }
                    Err(e) => {
                        error!("Container {} run failed: {}", name, e);
                    }
                }
            });
        }

        // Fate watcher: the first latch to fall decides what happens next.
        {
            let generation = generation.clone();
            let flip_tx = self.flip_tx.clone();
            tokio::spawn(async move {
                info!("Awaiting container fate: {:?}", generation.name);
                tokio::select! {
                    _ = generation.failed.wait() => {
                        warn!("Container failed before going live: {}", generation.name);
                        generation.closing.fall();
                    }
                    _ = generation.superseded.wait() => {
                        info!("Container superseded before going live: {}", generation.name);
                        generation.closing.fall();
                    }
                    _ = generation.closing.wait() => {
                        info!("Container closed before going live: {}", generation.name);
                    }
                    _ = generation.ready.wait() => {
                        if flip_tx.send(Some(generation)).await.is_err() {
                            warn!("Flip controller gone, dropping ready generation");
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortBindings;
    use crate::error::{HanoverdError, Result};
    use crate::flip::FlipController;
    use crate::firewall::MockFirewall;
    use crate::runtime::{MappedPort, MockRuntime, NetworkInfo};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct SlowSource {
        image: String,
        delay: Duration,
    }

    #[async_trait]
    impl ImageSource for SlowSource {
        async fn obtain(&self, _payload: &[u8], cancel: Latch) -> Result<String> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(self.image.clone()),
                _ = cancel.wait() => Err(HanoverdError::ShuttingDown),
            }
        }
    }

    fn test_options(port_bindings: PortBindings) -> Options {
        Options {
            env: vec![],
            volumes: vec![],
            container_args: vec![],
            status_uri: "/".to_string(),
            port_bindings,
            disable_overlap: false,
            overlap_grace: Duration::from_millis(20),
        }
    }

    fn network(host_port: u16) -> NetworkInfo {
        NetworkInfo {
            ip_address: "172.17.0.2".to_string(),
            ports: HashMap::from([(
                80,
                vec![MappedPort { host_ip: "127.0.0.1".to_string(), host_port }],
            )]),
        }
    }

    #[tokio::test]
    async fn test_generation_names_are_monotonic() {
        let runtime = Arc::new(MockRuntime::new());
        let (flip_tx, _flip_rx) = mpsc::channel(8);
        let mut supervisor = Supervisor::new(
            runtime.clone(),
            test_options(HashMap::new()),
            "web".to_string(),
            flip_tx,
            Latch::new(),
            TaskGroup::new(),
        );

        let source = Arc::new(SlowSource {
            image: "web:latest".to_string(),
            delay: Duration::from_secs(60),
        });
        supervisor.launch(Trigger::empty(), source.clone()).await;
        supervisor.launch(Trigger::empty(), source).await;

        assert_eq!(supervisor.next_index, 2);
    }

    #[tokio::test]
    async fn test_supersession_before_ready() {
        let runtime = Arc::new(MockRuntime::with_networks(vec![network(49153), network(49154)]));
        let firewall = Arc::new(MockFirewall::new());
        let group = TaskGroup::new();
        let (flip_tx, flip_rx) = mpsc::channel(8);
        let controller = FlipController::new(
            firewall.clone(),
            HashMap::new(),
            Duration::from_millis(20),
            group.clone(),
        );
        tokio::spawn(controller.run(flip_rx));

        let dying = Latch::new();
        let mut supervisor = Supervisor::new(
            runtime,
            test_options(HashMap::new()),
            "web".to_string(),
            flip_tx,
            dying.clone(),
            group.clone(),
        );

        // Acquisition is artificially slow, so the first generation cannot
        // become ready before the second trigger arrives.
        let source = Arc::new(SlowSource {
            image: "web:latest".to_string(),
            delay: Duration::from_millis(500),
        });

        let first = Trigger::empty();
        supervisor.launch(first, source.clone()).await;
        let first_superseded = supervisor.supersede.clone().unwrap();

        supervisor.launch(Trigger::empty(), source).await;

        tokio::time::timeout(Duration::from_secs(1), first_superseded.wait())
            .await
            .expect("first generation must be superseded by the second trigger");

        dying.fall();
        tokio::time::timeout(Duration::from_secs(5), group.wait())
            .await
            .expect("all activities must drain on shutdown");
    }
}
