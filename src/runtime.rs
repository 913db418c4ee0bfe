//! Container runtime abstraction.
//!
//! The supervisor drives containers through the [`ContainerRuntime`] trait.
//! [`DockerRuntime`] is the production implementation on top of bollard;
//! [`MockRuntime`] backs the state-machine tests without a Docker daemon.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config as ContainerConfig, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use crate::error::{HanoverdError, Result};
use crate::latch::Latch;

/// Everything needed to `docker create` one container.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    /// Anonymous volumes (no `:` in the spec).
    pub volumes: Vec<String>,
    /// Bind mounts (`host:container`).
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// One public binding of a container-internal port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPort {
    pub host_ip: String,
    pub host_port: u16,
}

/// The network settings snapshot taken after a container starts.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    pub ip_address: String,
    /// Container-internal port to its published host bindings.
    pub ports: HashMap<u16, Vec<MappedPort>>,
}

impl NetworkInfo {
    /// The first published host port for an internal port, if any.
    pub fn mapped_port(&self, internal: u16) -> Option<u16> {
        self.ports
            .get(&internal)
            .and_then(|bindings| bindings.first())
            .map(|b| b.host_port)
    }
}

/// A chunk of container output from an attach stream.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type OutputStream = Pin<Box<dyn futures_util::Stream<Item = Result<OutputChunk>> + Send>>;

/// The container operations the handover state machine consumes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container, returning its runtime-assigned id.
    async fn create(&self, spec: &CreateSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Capture the network settings snapshot (published ports, ip).
    async fn inspect(&self, id: &str) -> Result<NetworkInfo>;

    /// Attach to the container's stdout+stderr, from process start onwards.
    async fn attach(&self, id: &str) -> Result<OutputStream>;

    async fn kill(&self, id: &str) -> Result<()>;

    /// Block until the container exits, returning its exit status.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Force-remove the container and its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Production runtime backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    /// Connect to the Docker daemon, honoring `DOCKER_HOST`,
    /// `DOCKER_TLS_VERIFY` and `DOCKER_CERT_PATH`, and verify it responds.
    pub async fn connect() -> Result<Self> {
        let tls = std::env::var("DOCKER_TLS_VERIFY").map(|v| !v.is_empty()).unwrap_or(false);
        let docker = if tls {
            Docker::connect_with_ssl_defaults()?
        } else if std::env::var("DOCKER_HOST").is_ok() {
            Docker::connect_with_http_defaults()?
        } else {
            Docker::connect_with_socket_defaults()
                .or_else(|_| Docker::connect_with_local_defaults())?
        };

        let version = docker.version().await?;
        info!(
            "Connected to Docker Engine version {}",
            version.version.unwrap_or_default()
        );

        Ok(Self { docker: Arc::new(docker) })
    }

    pub fn docker(&self) -> Arc<Docker> {
        self.docker.clone()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let volumes: HashMap<String, HashMap<(), ()>> = spec
            .volumes
            .iter()
            .map(|v| (v.clone(), HashMap::new()))
            .collect();

        let config = ContainerConfig {
            hostname: Some(spec.hostname.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            env: Some(spec.env.clone()),
            cmd: if spec.cmd.is_empty() { None } else { Some(spec.cmd.clone()) },
            image: Some(spec.image.clone()),
            volumes: Some(volumes),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                binds: if spec.binds.is_empty() { None } else { Some(spec.binds.clone()) },
                // Avoid zombie containers if the supervisor crashes.
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions { name: spec.name.clone(), platform: None }),
                config,
            )
            .await?;

        for warning in &response.warnings {
            debug!("create_container warning: {}", warning);
        }

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<NetworkInfo> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let mut info = NetworkInfo::default();
        if let Some(settings) = details.network_settings {
            info.ip_address = settings.ip_address.unwrap_or_default();
            for (port_proto, bindings) in settings.ports.unwrap_or_default() {
                // Keys look like "80/tcp".
                let internal = match port_proto
                    .trim_end_matches("/tcp")
                    .trim_end_matches("/udp")
                    .parse::<u16>()
                {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let mapped: Vec<MappedPort> = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|b| {
                        let host_port = b.host_port.as_deref()?.parse::<u16>().ok()?;
                        let host_ip = match b.host_ip.as_deref() {
                            // Docker reports wildcard binds as 0.0.0.0 or
                            // empty; neither is a probeable address.
                            None | Some("") | Some("0.0.0.0") | Some("::") => {
                                "127.0.0.1".to_string()
                            }
                            Some(ip) => ip.to_string(),
                        };
                        Some(MappedPort { host_ip, host_port })
                    })
                    .collect();
                if !mapped.is_empty() {
                    info.ports.insert(internal, mapped);
                }
            }
        }

        Ok(info)
    }

    async fn attach(&self, id: &str) -> Result<OutputStream> {
        let results = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    // Capture messages from process start, then stream.
                    logs: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        let stream = results.output.map(|chunk| {
            use bollard::container::LogOutput;
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Ok(OutputChunk::Stdout(message.to_vec()))
                }
                Ok(LogOutput::StdErr { message }) => Ok(OutputChunk::Stderr(message.to_vec())),
                Ok(LogOutput::StdIn { .. }) => Ok(OutputChunk::Stdout(Vec::new())),
                Err(e) => Err(HanoverdError::from(e)),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut wait_stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);

        match wait_stream.next().await {
            Some(Ok(response)) => {
                if let Some(error) = response.error.and_then(|e| e.message) {
                    if !error.is_empty() {
                        return Err(HanoverdError::internal(format!("container wait: {}", error)));
                    }
                }
                Ok(response.status_code)
            }
            // With auto-remove, the daemon can report the exit via a 404/409
            // error once the container is already gone; surface it as-is.
            Some(Err(e)) => Err(e.into()),
            None => Err(HanoverdError::internal("container wait stream ended early")),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions { force: true, v: true, ..Default::default() }),
            )
            .await?;
        Ok(())
    }
}

/// In-memory runtime for tests: containers "run" until killed.
///
/// Each created container is assigned the next entry from the configured
/// network queue (falling back to no published ports), which is what the
/// inspect snapshot reports.
#[derive(Default)]
pub struct MockRuntime {
    counter: AtomicU64,
    networks: Mutex<Vec<NetworkInfo>>,
    containers: Mutex<HashMap<String, MockContainer>>,
    events: Mutex<Vec<String>>,
}

struct MockContainer {
    network: NetworkInfo,
    exited: Latch,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the network snapshots handed to successive containers, in
    /// creation order.
    pub fn with_networks(networks: Vec<NetworkInfo>) -> Self {
        Self {
            networks: Mutex::new(networks),
            ..Default::default()
        }
    }

    /// The recorded operation log, e.g. `["create hanoverd-0", "start mock-0"]`.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{}", n);
        let network = {
            let mut networks = self.networks.lock().unwrap();
            if networks.is_empty() {
                NetworkInfo::default()
            } else {
                networks.remove(0)
            }
        };
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), MockContainer { network, exited: Latch::new() });
        self.record(format!("create {}", spec.name));
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start {}", id));
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<NetworkInfo> {
        let containers = self.containers.lock().unwrap();
        containers
            .get(id)
            .map(|c| c.network.clone())
            .ok_or_else(|| HanoverdError::internal(format!("no such mock container {}", id)))
    }

    async fn attach(&self, _id: &str) -> Result<OutputStream> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.record(format!("kill {}", id));
        let exited = {
            let containers = self.containers.lock().unwrap();
            containers.get(id).map(|c| c.exited.clone())
        };
        match exited {
            Some(exited) => {
                exited.fall();
                Ok(())
            }
            None => Err(HanoverdError::internal(format!("no such mock container {}", id))),
        }
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let exited = {
            let containers = self.containers.lock().unwrap();
            containers
                .get(id)
                .map(|c| c.exited.clone())
                .ok_or_else(|| HanoverdError::internal(format!("no such mock container {}", id)))?
        };
        exited.wait().await;
        // Killed containers report the conventional SIGKILL status.
        Ok(137)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record(format!("remove {}", id));
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_runtime_lifecycle() {
        let runtime = MockRuntime::with_networks(vec![NetworkInfo {
            ip_address: "172.17.0.2".to_string(),
            ports: HashMap::from([(
                80,
                vec![MappedPort { host_ip: "127.0.0.1".to_string(), host_port: 49153 }],
            )]),
        }]);

        let spec = CreateSpec { name: "web-0".to_string(), ..Default::default() };
        let id = runtime.create(&spec).await.unwrap();
        runtime.start(&id).await.unwrap();

        let network = runtime.inspect(&id).await.unwrap();
        assert_eq!(network.mapped_port(80), Some(49153));
        assert_eq!(network.mapped_port(81), None);

        runtime.kill(&id).await.unwrap();
        let status = runtime.wait(&id).await.unwrap();
        assert_eq!(status, 137);

        assert!(runtime.events().iter().any(|e| e.starts_with("create")));
    }

    #[tokio::test]
    async fn test_mock_runtime_defaults_to_no_ports() {
        let runtime = MockRuntime::new();
        let id = runtime
            .create(&CreateSpec { name: "web-1".to_string(), ..Default::default() })
            .await
            .unwrap();
        let network = runtime.inspect(&id).await.unwrap();
        assert!(network.ports.is_empty());
    }
}
