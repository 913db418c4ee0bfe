//! Image acquisition.
//!
//! An [`ImageSource`] turns an opaque trigger payload into a runnable image
//! reference. Three providers exist: building the current working directory,
//! pulling a tagged image, and building a revision fetched from a git host.

pub mod build;
pub mod git;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use serde::Deserialize;
use tracing::{info, warn};

use crate::container::split_image_ref;
use crate::error::{HanoverdError, Result};
use crate::latch::Latch;

/// Produces a runnable image reference (`repo[:tag|@digest]`) from an
/// optional payload. Acquisition must honor `cancel`: when it falls, any
/// blocking work should stop and return an error.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn obtain(&self, payload: &[u8], cancel: Latch) -> Result<String>;
}

/// Builds the current working directory; the image is named after it.
pub struct CwdSource {
    docker: Arc<Docker>,
}

impl CwdSource {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    pub fn name() -> Result<String> {
        let cwd = std::env::current_dir()?;
        cwd.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| HanoverdError::config("cannot determine working directory name"))
    }
}

#[async_trait]
impl ImageSource for CwdSource {
    async fn obtain(&self, _payload: &[u8], cancel: Latch) -> Result<String> {
        let image = Self::name()?;
        build::build_directory(&self.docker, &image, Path::new("."), &cancel).await?;
        finish_with_runtime_stage(&self.docker, image, Path::new("."), &cancel).await
    }
}

/// Pulls `repository:tag` from a registry.
pub struct PullSource {
    docker: Arc<Docker>,
    repository: String,
    tag: String,
}

impl PullSource {
    pub fn new(docker: Arc<Docker>, repository: String, tag: String) -> Self {
        Self { docker, repository, tag }
    }

    /// Build a pull source from an image reference, defaulting the tag to
    /// `latest` when omitted.
    pub fn from_image(docker: Arc<Docker>, image: &str) -> Self {
        let (repository, tag) = split_image_ref(image);
        Self { docker, repository, tag }
    }
}

#[async_trait]
impl ImageSource for PullSource {
    async fn obtain(&self, _payload: &[u8], cancel: Latch) -> Result<String> {
        let image = format!("{}:{}", self.repository, self.tag);
        build::pull_image(&self.docker, &image, &cancel).await?;
        Ok(image)
    }
}

/// Builds a revision of a repository hosted on a git server.
///
/// A non-empty payload is JSON `{"SHA": "..."}` selecting the revision to
/// build; an empty payload builds `initial_branch`. The image tag is the
/// `git describe` of the revision.
pub struct GitRevisionSource {
    pub docker: Arc<Docker>,
    pub host: String,
    pub user: String,
    pub repository: String,
    pub initial_branch: String,
    /// Directory inside the checkout in which to run the build. Repository
    /// root if empty.
    pub image_subdir: String,
}

impl GitRevisionSource {
    /// ssh when the caller has an SSH key available, https otherwise.
    pub fn clone_url(&self) -> String {
        if have_ssh_key() {
            format!("ssh://git@{}/{}/{}", self.host, self.user, self.repository)
        } else {
            format!("https://{}/{}/{}", self.host, self.user, self.repository)
        }
    }

    /// The revision a payload selects, or the initial branch for an empty
    /// payload.
    fn git_ref(&self, payload: &[u8]) -> Result<String> {
        if payload.is_empty() {
            return Ok(self.initial_branch.clone());
        }

        #[derive(Deserialize)]
        struct Push {
            #[serde(rename = "SHA")]
            sha: String,
        }

        let push: Push = serde_json::from_slice(payload)?;
        Ok(push.sha)
    }
}

#[async_trait]
impl ImageSource for GitRevisionSource {
    async fn obtain(&self, payload: &[u8], cancel: Latch) -> Result<String> {
        let git_ref = self.git_ref(payload)?;

        let git_dir = std::env::current_dir()?
            .join("src")
            .join(&self.host)
            .join(&self.user)
            .join(&self.repository);

        let checkout =
            git::prep_build_directory(&git_dir, &self.clone_url(), &git_ref, &cancel).await?;

        let image = format!("{}:{}", self.repository, checkout.name);
        let build_path = checkout.dir.join(&self.image_subdir);

        let result = async {
            build::build_directory(&self.docker, &image, &build_path, &cancel).await?;
            finish_with_runtime_stage(&self.docker, image, &build_path, &cancel).await
        }
        .await;

        if let Err(e) = checkout.cleanup() {
            warn!("Error cleaning up checkout {:?}: {}", checkout.dir, e);
        }

        result
    }
}

/// If the build context carries a `runtime/Dockerfile`, the image just built
/// is a *build-time* image: run it, and use its standard output as the tar
/// build context of a second image named `<image>-runtime`.
async fn finish_with_runtime_stage(
    docker: &Docker,
    image: String,
    build_path: &Path,
    cancel: &Latch,
) -> Result<String> {
    if !build_path.join("runtime").join("Dockerfile").exists() {
        return Ok(image);
    }
    info!("Generating runtime image for {}", image);
    build::construct_runtime(docker, &image, cancel).await
}

/// True if `$HOME/.ssh` contains a usable private key.
fn have_ssh_key() -> bool {
    let Ok(home) = std::env::var("HOME") else { return false };
    ["id_dsa", "id_ecdsa", "id_rsa", "id_ed25519"]
        .iter()
        .any(|name| Path::new(&home).join(".ssh").join(name).exists())
}
