//! Readiness probing.
//!
//! One poller per exposed public port repeatedly GETs the status URI until
//! the first 200 OK. The winning poller performs an acknowledgement
//! handshake with the coordinator so that success cannot be lost in the
//! window where the other pollers have already given up.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{HanoverdError, Result};
use crate::latch::Latch;
use crate::runtime::NetworkInfo;

/// Give up probing after this long.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Approximate polls per second, per port.
const POLL_FREQUENCY: u32 = 5;

/// Per-request timeout. An endpoint that accepts the connection but never
/// answers retries like a refused connection instead of wedging its poller.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The HTTP client used for status polling. Every request carries a
/// timeout so no poll can block past cancellation.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("Failed to create HTTP client")
}

/// Outcome of a single poll of one status URL.
enum Poll {
    /// First 200 OK observed.
    Success,
    /// Transient condition, try again.
    Retry,
    /// This endpoint will never succeed; stop polling it.
    GiveUp,
}

/// Poll `GET http://<host>:<port><status_uri>` on every published port until
/// one returns 200 OK.
///
/// Individual pollers give up on a terminal response (a non-200, non-404
/// status, or an endpoint that does not speak HTTP) without aborting the
/// others. The probe as a whole fails when all pollers have given up, when
/// `closing` falls, or when the deadline elapses.
pub async fn await_listening(
    client: &reqwest::Client,
    network: &NetworkInfo,
    status_uri: &str,
    closing: &Latch,
) -> Result<()> {
    if network.ports.is_empty() {
        return Err(HanoverdError::NoPortsExposed);
    }

    // Pollers hand a response channel over `success`; the coordinator
    // acknowledges through it. Dropping `alive` handles signals poller exit.
    let (success_tx, mut success_rx) = mpsc::channel::<oneshot::Sender<()>>(1);
    let (alive_tx, mut alive_rx) = mpsc::channel::<()>(1);
    let finished = Latch::new();

    for bindings in network.ports.values() {
        // Take the first public binding for each internal port.
        let Some(binding) = bindings.first() else { continue };
        let status_url =
            format!("http://{}:{}{}", binding.host_ip, binding.host_port, status_uri);

        let client = client.clone();
        let success_tx = success_tx.clone();
        let alive = alive_tx.clone();
        let finished = finished.clone();
        tokio::spawn(async move {
            let _alive = alive;
            loop {
                // The round-trip itself must observe the probe ending, not
                // just the inter-poll sleep.
                let outcome = tokio::select! {
                    outcome = poll_once(&client, &status_url) => outcome,
                    _ = finished.wait() => return,
                };
                match outcome {
                    Poll::Success => {
                        let (ack_tx, ack_rx) = oneshot::channel();
                        tokio::select! {
                            sent = success_tx.send(ack_tx) => {
                                if sent.is_ok() {
                                    // Hold on until the coordinator has seen
                                    // the success.
                                    let _ = ack_rx.await;
                                }
                            }
                            _ = finished.wait() => {
                                // Something else already decided the outcome.
                            }
                        }
                        return;
                    }
                    Poll::GiveUp => return,
                    Poll::Retry => {}
                }
                tokio::select! {
                    _ = finished.wait() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1) / POLL_FREQUENCY) => {}
                }
            }
        });
    }
    drop(success_tx);
    drop(alive_tx);

    let _finished = finished.fall_on_drop();

    tokio::select! {
        Some(ack) = success_rx.recv() => {
            let _ = ack.send(());
            Ok(())
        }
        // No sends ever arrive on `alive`; it resolves when every poller has
        // dropped its handle.
        _ = alive_rx.recv() => Err(HanoverdError::readiness("no status checks succeeded")),
        _ = closing.wait() => Err(HanoverdError::ShuttingDown),
        _ = tokio::time::sleep(DEFAULT_TIMEOUT) => Err(HanoverdError::readiness(format!(
            "took longer than {:?} to start, giving up",
            DEFAULT_TIMEOUT
        ))),
    }
}

async fn poll_once(client: &reqwest::Client, status_url: &str) -> Poll {
    let response = match client.get(status_url).send().await {
        Ok(response) => response,
        Err(e) if e.is_builder() => {
            warn!("Malformed status URL {:?}: {}", status_url, e);
            return Poll::GiveUp;
        }
        Err(e) if e.is_connect() || e.is_timeout() => {
            // Container probably isn't listening yet.
            return Poll::Retry;
        }
        Err(e) => {
            // Seen when the endpoint doesn't speak HTTP. Give up.
            debug!("Status poll of {:?} failed terminally: {}", status_url, e);
            return Poll::GiveUp;
        }
    };

    match response.status() {
        StatusCode::OK => Poll::Success,
        // The application is up but the route isn't ready yet.
        StatusCode::NOT_FOUND => Poll::Retry,
        status => {
            warn!("Status poller got non-200 status: {:?} returned {}", status_url, status);
            Poll::GiveUp
        }
    }
}
