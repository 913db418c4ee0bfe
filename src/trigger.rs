//! External trigger fan-in.
//!
//! Merges the startup event, `SIGHUP`, webhook messages, and stdin EOF into
//! one FIFO stream for the supervisor. `SIGINT`/`SIGTERM` (and stdin EOF)
//! fall the global `dying` latch instead of producing triggers.

use std::io::IsTerminal;

use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::hookbot;
use crate::latch::Latch;

/// One request for a new generation. `obtained` falls once the generation
/// spawned for this trigger has finished image acquisition, letting the
/// trigger's originator know the work was taken off the queue.
#[derive(Debug)]
pub struct Trigger {
    pub payload: Vec<u8>,
    pub obtained: Latch,
}

impl Trigger {
    pub fn empty() -> Self {
        Self { payload: Vec::new(), obtained: Latch::new() }
    }

    pub fn with_payload(payload: Vec<u8>) -> Self {
        Self { payload, obtained: Latch::new() }
    }
}

/// Start every trigger producer and return the merged stream.
///
/// The stream starts with one synthetic empty-payload event so the first
/// generation launches immediately.
pub fn start(dying: &Latch, hookbot_url: Option<String>) -> mpsc::Receiver<Trigger> {
    let (tx, rx) = mpsc::channel::<Trigger>(8);

    // Initial build.
    let _ = tx.try_send(Trigger::empty());

    // SIGHUP rebuilds from source.
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(hup) => hup,
                Err(e) => {
                    error!("Unable to install SIGHUP handler: {}", e);
                    return;
                }
            };
            while hup.recv().await.is_some() {
                info!("Received SIGHUP, rebuilding");
                if tx.send(Trigger::empty()).await.is_err() {
                    return;
                }
            }
        });
    }

    // SIGINT / SIGTERM end the process.
    {
        let dying = dying.clone();
        tokio::spawn(async move {
            let (mut int, mut term) = match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(int), Ok(term)) => (int, term),
                _ => {
                    error!("Unable to install shutdown signal handlers");
                    return;
                }
            };
            tokio::select! {
                _ = int.recv() => info!("Received SIGINT, exiting..."),
                _ = term.recv() => info!("Received SIGTERM, exiting..."),
            }
            dying.fall();
        });
    }

    // Stdin EOF also ends the process, but only when stdin is a readable
    // non-terminal (e.g. a pipe from a process supervisor).
    if !std::io::stdin().is_terminal() {
        let dying = dying.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 4096];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            info!("Stdin closed, exiting...");
            dying.fall();
        });
    }

    // Webhook subscription.
    if let Some(url) = hookbot_url {
        let tx = tx.clone();
        tokio::spawn(async move {
            hookbot::subscribe(url, tx).await;
        });
    }

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_starts_with_initial_event() {
        let dying = Latch::new();
        let mut rx = start(&dying, None);
        let trigger = rx.recv().await.expect("initial trigger must be queued");
        assert!(trigger.payload.is_empty());
        assert!(!trigger.obtained.has_fallen());
    }
}
