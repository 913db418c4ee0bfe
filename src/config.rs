//! Runtime options assembled from the command line.

use std::collections::HashMap;
use std::time::Duration;

use crate::cli::Cli;
use crate::error::{HanoverdError, Result};

/// One `--publish` binding for a container-internal port. An absent
/// `host_port` means "use the internal port number as the public port".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

/// Container-internal port to the list of requested public bindings.
pub type PortBindings = HashMap<u16, Vec<PublishBinding>>;

/// Everything a generation needs to construct and probe a container.
#[derive(Debug, Clone)]
pub struct Options {
    pub env: Vec<String>,
    pub volumes: Vec<String>,
    pub container_args: Vec<String>,
    pub status_uri: String,
    pub port_bindings: PortBindings,
    pub disable_overlap: bool,
    pub overlap_grace: Duration,
}

impl Options {
    pub fn from_cli(cli: &Cli, container_args: Vec<String>) -> Result<Self> {
        Ok(Self {
            env: make_env(&cli.env),
            volumes: cli.volume.clone(),
            container_args,
            status_uri: cli.status_uri.clone(),
            port_bindings: parse_port_specs(&cli.publish)?,
            disable_overlap: cli.disable_overlap,
            overlap_grace: parse_duration(&cli.overlap_grace_duration)?,
        })
    }
}

/// Build a `KEY=VALUE` environment list from `--env` options. A bare `KEY`
/// reads the value from the caller's environment.
pub fn make_env(opts: &[String]) -> Vec<String> {
    opts.iter()
        .map(|spec| {
            if spec.contains('=') {
                spec.clone()
            } else {
                format!("{}={}", spec, std::env::var(spec).unwrap_or_default())
            }
        })
        .collect()
}

/// Parse Docker-style `--publish` specs into a port binding map.
///
/// Accepted forms: `80`, `8080:80`, `1.2.3.4:8080:80`, `1.2.3.4::80`, each
/// optionally suffixed with `/tcp`. Port ranges are not supported.
pub fn parse_port_specs(specs: &[String]) -> Result<PortBindings> {
    let mut bindings: PortBindings = HashMap::new();

    for spec in specs {
        let spec = spec.strip_suffix("/tcp").unwrap_or(spec);
        if spec.strip_suffix("/udp").is_some() {
            return Err(HanoverdError::config(format!(
                "--publish: only tcp is supported: {:?}",
                spec
            )));
        }

        let parts: Vec<&str> = spec.split(':').collect();
        let (host_ip, host_part, container_part) = match parts.as_slice() {
            [container] => (None, "", *container),
            [host, container] => (None, *host, *container),
            [ip, host, container] => (Some(ip.to_string()), *host, *container),
            _ => {
                return Err(HanoverdError::config(format!(
                    "--publish: invalid port spec: {:?}",
                    spec
                )))
            }
        };

        let internal = parse_port(container_part, spec)?;
        let host_port = if host_part.is_empty() {
            None
        } else {
            Some(parse_port(host_part, spec)?)
        };

        bindings
            .entry(internal)
            .or_default()
            .push(PublishBinding { host_ip, host_port });
    }

    Ok(bindings)
}

fn parse_port(s: &str, spec: &str) -> Result<u16> {
    s.parse::<u16>().map_err(|_| {
        HanoverdError::config(format!("--publish: invalid port {:?} in {:?}", s, spec))
    })
}

/// Volume specs without a `:` become anonymous volumes.
pub fn anonymous_volumes(volumes: &[String]) -> Vec<String> {
    volumes
        .iter()
        .filter(|v| !v.contains(':'))
        .cloned()
        .collect()
}

/// Volume specs containing a `:` become bind mounts.
pub fn bind_mounts(volumes: &[String]) -> Vec<String> {
    volumes
        .iter()
        .filter(|v| v.contains(':'))
        .cloned()
        .collect()
}

/// Parse durations of the form `300ms`, `1s`, `2m`, `1h`, or a bare number
/// of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let err = || HanoverdError::config(format!("invalid duration: {:?}", s));

    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = number.parse().map_err(|_| err())?;

    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(err()),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(err());
    }
    Ok(Duration::from_secs_f64(secs))
}
