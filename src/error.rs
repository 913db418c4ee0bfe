use thiserror::Error;

pub type Result<T> = std::result::Result<T, HanoverdError>;

#[derive(Error, Debug)]
pub enum HanoverdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image acquisition failed: {0}")]
    Acquisition(String),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("no ports are exposed (specify EXPOSE in Dockerfile)")]
    NoPortsExposed,

    #[error("Docker image not exposing port {0}")]
    PortNotExposed(u16),

    #[error("Readiness probe failed: {0}")]
    Readiness(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HanoverdError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn acquisition(msg: impl Into<String>) -> Self {
        Self::Acquisition(msg.into())
    }

    pub fn readiness(msg: impl Into<String>) -> Self {
        Self::Readiness(msg.into())
    }

    pub fn firewall(msg: impl Into<String>) -> Self {
        Self::Firewall(msg.into())
    }

    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if this is a Docker name-conflict response (HTTP 409), which
    /// happens when a container with the requested name already exists.
    pub fn is_name_conflict(&self) -> bool {
        matches!(
            self,
            Self::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                ..
            })
        )
    }

    /// True if this is a "no such container" response (HTTP 404). Seen when
    /// killing a container that already exited and was auto-removed.
    pub fn is_no_such_container(&self) -> bool {
        matches!(
            self,
            Self::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}
