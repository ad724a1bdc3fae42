//! Courier CLI: simulate the frame courier protocol in-process and inspect
//! its configuration.

mod cli;
mod cmd;
pub mod table;
mod ui;

use crate::cli::*;
use clap::Parser;
use courier_types::load_config;

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing_stderr(&config.log_level);

    match cli.command {
        Commands::Simulate(args) => cmd::simulate::cmd_simulate(&config, &args),
        Commands::Config(sub) => match sub {
            ConfigCommands::Show => cmd::config::cmd_config_show(cli.config.as_deref(), &config),
            ConfigCommands::Path => cmd::config::cmd_config_path(cli.config.as_deref()),
        },
    }
}
