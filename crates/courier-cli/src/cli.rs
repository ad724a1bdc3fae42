//! Clap CLI definitions for the courier tool.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  courier simulate                       Negotiate a host page with three frames
  courier simulate --frames 5 --tags \"a b\"
  courier simulate --no-channels --json  Force the shared transport, print JSON
  courier config show                    Print the effective configuration";

/// Frame courier: peer discovery and addressed messaging between frames.
#[derive(Parser)]
#[command(name = "courier", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the protocol between a simulated host page and its frames.
    Simulate(SimulateArgs),
    /// Inspect the configuration.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of frames embedded in the host page.
    #[arg(long, default_value_t = 3)]
    pub frames: usize,

    /// Whitespace-separated tags given to every frame.
    #[arg(long, default_value = "")]
    pub tags: String,

    /// Simulate an environment without dedicated channels.
    #[arg(long)]
    pub no_channels: bool,

    /// Output as JSON for scripting.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the path of the config file.
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulate_defaults() {
        let cli = Cli::try_parse_from(["courier", "simulate"]).unwrap();
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.frames, 3);
        assert!(args.tags.is_empty());
        assert!(!args.no_channels);
        assert!(!args.json);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_global_config_after_subcommand() {
        let cli = Cli::try_parse_from([
            "courier",
            "simulate",
            "--frames",
            "2",
            "--tags",
            "a b",
            "--no-channels",
            "--config",
            "/tmp/courier.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/courier.toml")));
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.frames, 2);
        assert_eq!(args.tags, "a b");
        assert!(args.no_channels);
    }

    #[test]
    fn test_parse_config_subcommands() {
        let cli = Cli::try_parse_from(["courier", "config", "path"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Path)));
        assert!(Cli::try_parse_from(["courier"]).is_err());
    }
}
