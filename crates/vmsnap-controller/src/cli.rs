//! Command-line interface for the `vmsnap` binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::clock::SystemClock;
use crate::config::{ControllerConfig, LogFormat};
use crate::controller::Controller;
use crate::scenario::{self, Scenario};

/// vmsnap command line.
#[derive(Parser, Debug)]
#[command(name = "vmsnap")]
#[command(about = "VM snapshot controller", long_about = None)]
pub struct Cli {
    /// Controller config file (`.toml` or `.json`).
    #[arg(short, long, env = "VMSNAP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured log format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive a scenario on a simulated clock and print the outcome as JSON.
    Simulate {
        /// Scenario file (JSON).
        #[arg(short, long)]
        scenario: PathBuf,
        /// Maximum controller passes.
        #[arg(short, long, default_value = "600")]
        max_steps: usize,
    },
    /// Load a scenario and run the controller in real time until Ctrl-C.
    Serve {
        /// Scenario file (JSON).
        #[arg(short, long)]
        scenario: PathBuf,
    },
    /// Configuration commands.
    Config {
        #[command(subcommand)]
        /// Config subcommand.
        cmd: ConfigCmd,
    },
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCmd {
    /// Print the effective configuration as TOML.
    Show,
}

impl Cli {
    /// Effective configuration: file (if given) plus command-line overrides.
    pub fn load_config(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => ControllerConfig::default(),
        };
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        Ok(config)
    }

    /// Executes the selected subcommand.
    pub async fn run(&self, config: ControllerConfig) -> Result<()> {
        match &self.command {
            Command::Simulate {
                scenario: path,
                max_steps,
            } => {
                let scenario = Scenario::from_file(path)
                    .with_context(|| format!("loading scenario {}", path.display()))?;
                let report = scenario::run(&scenario, config, *max_steps).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.settled {
                    anyhow::bail!("scenario did not settle within {} passes", max_steps);
                }
                Ok(())
            }
            Command::Serve { scenario: path } => {
                let scenario = Scenario::from_file(path)
                    .with_context(|| format!("loading scenario {}", path.display()))?;
                let cluster = scenario.load(Arc::new(SystemClock)).await?;
                let controller = Controller::new(cluster.ports(), config);
                let (tx, rx) = watch::channel(false);
                let loop_handle = tokio::spawn(async move { controller.run(rx).await });
                tokio::signal::ctrl_c().await?;
                tracing::info!("interrupt received");
                let _ = tx.send(true);
                loop_handle.await??;
                Ok(())
            }
            Command::Config { cmd: ConfigCmd::Show } => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }
}
