use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use hanoverd::cli::Cli;
use hanoverd::config::Options;
use hanoverd::firewall::IptablesController;
use hanoverd::flip::FlipController;
use hanoverd::latch::{Latch, TaskGroup};
use hanoverd::runtime::DockerRuntime;
use hanoverd::source::{CwdSource, ImageSource, PullSource};
use hanoverd::supervisor::Supervisor;
use hanoverd::{hookbot, trigger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "hanoverd=debug,info" } else { "hanoverd=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Hanoverd");

    // Anything wrong from here to the supervisor starting is fatal.
    let firewall = IptablesController::new();
    firewall
        .check()
        .await
        .context("Unable to run `iptables --list`; hanoverd needs iptables privileges")?;

    let runtime = DockerRuntime::connect()
        .await
        .context("Connecting to Docker failed")?;
    let docker = runtime.docker();

    // Positional arguments choose the image source: none or `@` builds the
    // working directory, anything else is a pull reference. A hookbot URL
    // overrides both and brings its own source.
    let (base_name, source, container_args): (String, Arc<dyn ImageSource>, Vec<String>) =
        if let Some(url) = &cli.hookbot {
            let (name, source) = hookbot::recognize(url, docker.clone())?;
            (name, source, cli.args.clone())
        } else {
            match cli.args.split_first() {
                None => (
                    CwdSource::name()?,
                    Arc::new(CwdSource::new(docker.clone())),
                    Vec::new(),
                ),
                Some((first, rest)) if first == "@" => (
                    CwdSource::name()?,
                    Arc::new(CwdSource::new(docker.clone())),
                    rest.to_vec(),
                ),
                Some((image, rest)) => {
                    let name = image
                        .rsplit('/')
                        .next()
                        .unwrap_or(image)
                        .split([':', '@'])
                        .next()
                        .unwrap_or(image)
                        .to_string();
                    (
                        name,
                        Arc::new(PullSource::from_image(docker.clone(), image)),
                        rest.to_vec(),
                    )
                }
            }
        };

    let options = Options::from_cli(&cli, container_args)?;

    let dying = Latch::new();
    let group = TaskGroup::new();

    let triggers = trigger::start(&dying, cli.hookbot.clone());

    let (flip_tx, flip_rx) = mpsc::channel(8);
    let controller = FlipController::new(
        Arc::new(firewall),
        options.port_bindings.clone(),
        options.overlap_grace,
        group.clone(),
    );
    tokio::spawn(controller.run(flip_rx));

    let supervisor = Supervisor::new(
        Arc::new(runtime),
        options,
        base_name,
        flip_tx,
        dying.clone(),
        group.clone(),
    );
    supervisor.run(triggers, source).await;

    // Outstanding activities: log streams, kill watchers, firewall-rule
    // removals. Exit only when they have drained.
    group.wait().await;
    info!("Shutdown complete");
    Ok(())
}
