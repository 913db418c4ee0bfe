//! Command-line surface.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "hanoverd")]
#[command(about = "Zero-downtime handover between versions of a containerized service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment variables to pass (reads from the caller's environment if
    /// `=VALUE` is omitted)
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Ports to publish (same syntax as docker, e.g. 8080:80)
    #[arg(short = 'p', long = "publish")]
    pub publish: Vec<String>,

    /// Volumes: an anonymous volume (no `:`) or a bind mount (`host:container`)
    #[arg(short = 'v', long = "volume")]
    pub volume: Vec<String>,

    /// URI which returns 200 OK when the container is functioning correctly
    #[arg(long = "status-uri", default_value = "/")]
    pub status_uri: String,

    /// URL of a hookbot websocket endpoint to monitor for updates
    #[arg(long, env = "HOOKBOT_URL")]
    pub hookbot: Option<String>,

    /// Shut down the current live container before starting the next
    #[arg(long = "disable-overlap")]
    pub disable_overlap: bool,

    /// Delay between a new container going live and the old one being torn down
    #[arg(long = "overlap-grace-duration", default_value = "1s")]
    pub overlap_grace_duration: String,

    /// Enable debug logging
    #[arg(long)]
    pub verbose: bool,

    /// Image to run, then arguments for the container. With no image, or with
    /// `@`, the current working directory is built instead.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["hanoverd"]);
        assert_eq!(cli.status_uri, "/");
        assert_eq!(cli.overlap_grace_duration, "1s");
        assert!(!cli.disable_overlap);
        assert!(cli.args.is_empty());
    }

    #[test]
    fn test_repeatable_flags() {
        let cli = Cli::parse_from([
            "hanoverd", "-e", "FOO=1", "-e", "BAR", "-p", "8080:80", "-p", "9090:90",
            "-v", "/data",
        ]);
        assert_eq!(cli.env.len(), 2);
        assert_eq!(cli.publish.len(), 2);
        assert_eq!(cli.volume, vec!["/data"]);
    }

    #[test]
    fn test_positional_image_and_args() {
        let cli = Cli::parse_from(["hanoverd", "nginx:1.25", "nginx", "-g", "daemon off;"]);
        assert_eq!(cli.args[0], "nginx:1.25");
        assert_eq!(cli.args.len(), 4);
    }
}
