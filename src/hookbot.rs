//! Hookbot endpoint recognition and subscription.
//!
//! A hookbot URL both selects the image source and provides the websocket
//! stream of update payloads. Two endpoint shapes are recognized:
//!
//! - `/sub/<host>/repo/<user>/<repository>/branch/<branch>[#<subdir>]`
//!   builds from a git host; payloads carry `{"SHA": ...}`.
//! - `/sub/docker-pull/<repository>/tag/<tag>` pulls a tagged image.

use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::error::{HanoverdError, Result};
use crate::source::{GitRevisionSource, ImageSource, PullSource};
use crate::trigger::Trigger;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Derive the container base name and image source from a hookbot URL.
pub fn recognize(url_str: &str, docker: Arc<Docker>) -> Result<(String, Arc<dyn ImageSource>)> {
    let url = url::Url::parse(url_str)
        .map_err(|e| HanoverdError::config(format!("Hookbot URL {:?} does not parse: {}", url_str, e)))?;

    let githost_re =
        Regex::new(r"^/sub/([^/]+)/repo/([^/]+)/([^/]+)/branch/([^/#]+)$").unwrap();
    let docker_pull_re = Regex::new(r"^/sub/docker-pull/(.*)/tag/([^/]+)$").unwrap();

    if let Some(groups) = githost_re.captures(url.path()) {
        let (host, user, repository, branch) =
            (&groups[1], &groups[2], &groups[3], &groups[4]);
        let image_subdir = url.fragment().unwrap_or("").to_string();

        info!(
            "Hookbot monitoring {}@{} via {} (subdir {:?})",
            repository,
            branch,
            url.host_str().unwrap_or(""),
            image_subdir
        );

        let source = GitRevisionSource {
            docker,
            host: host.to_string(),
            user: user.to_string(),
            repository: repository.to_string(),
            initial_branch: branch.to_string(),
            image_subdir,
        };
        return Ok((repository.to_string(), Arc::new(source)));
    }

    if let Some(groups) = docker_pull_re.captures(url.path()) {
        let (repository, tag) = (&groups[1], &groups[2]);

        info!(
            "Hookbot monitoring {}:{} via {}",
            repository,
            tag,
            url.host_str().unwrap_or("")
        );

        let name = repository.rsplit('/').next().unwrap_or(repository).to_string();
        let source = PullSource::new(docker, repository.to_string(), tag.to_string());
        return Ok((name, Arc::new(source)));
    }

    Err(HanoverdError::config(format!(
        "Unrecognized hookbot URL {:?}",
        url.path()
    )))
}

/// Subscribe to a hookbot endpoint, forwarding each message payload as a
/// trigger. Reconnects on error; the subscription outlives any one
/// connection. Each trigger is held until its acquisition is taken off the
/// supervisor's queue, matching hookbot's at-most-one-outstanding-build
/// expectation.
pub async fn subscribe(url: String, triggers: mpsc::Sender<Trigger>) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((mut stream, _response)) => {
                info!("Monitoring hookbot");
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if !deliver(&triggers, text.into_bytes()).await {
                                return;
                            }
                        }
                        Ok(Message::Binary(payload)) => {
                            if !deliver(&triggers, payload).await {
                                return;
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = stream.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            error!("Error in hookbot stream: {}", e);
                            break;
                        }
                    }
                }
                warn!("Hookbot stream ended, reconnecting");
            }
            Err(e) => {
                error!("Hookbot connect failed: {}", e);
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Send one payload as a trigger and wait until its image acquisition has
/// been picked up. Returns false when the supervisor is gone.
async fn deliver(triggers: &mpsc::Sender<Trigger>, payload: Vec<u8>) -> bool {
    let trigger = Trigger::with_payload(payload);
    let obtained = trigger.obtained.clone();
    if triggers.send(trigger).await.is_err() {
        return false;
    }
    obtained.wait().await;
    info!("--- Build picked up ---");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker() -> Arc<Docker> {
        // Lazy client; no daemon contact happens during recognition.
        Arc::new(Docker::connect_with_socket_defaults().unwrap())
    }

    #[test]
    fn test_recognize_githost() {
        let (name, _source) = recognize(
            "wss://hookbot.example.com/sub/github.com/repo/acme/widgets/branch/main",
            docker(),
        )
        .unwrap();
        assert_eq!(name, "widgets");
    }

    #[test]
    fn test_recognize_githost_with_subdir() {
        let (name, _source) = recognize(
            "wss://hookbot.example.com/sub/github.com/repo/acme/widgets/branch/main#services/api",
            docker(),
        )
        .unwrap();
        assert_eq!(name, "widgets");
    }

    #[test]
    fn test_recognize_docker_pull() {
        let (name, _source) = recognize(
            "wss://hookbot.example.com/sub/docker-pull/registry.example.com/acme/widgets/tag/latest",
            docker(),
        )
        .unwrap();
        assert_eq!(name, "widgets");
    }

    #[test]
    fn test_recognize_rejects_unknown_paths() {
        assert!(recognize("wss://hookbot.example.com/sub/unknown/thing", docker()).is_err());
        assert!(recognize("not a url", docker()).is_err());
    }
}
