//! Command-line interface for component-chunks
//!
//! Provides the main CLI structure using clap with subcommands for:
//! - `optimize`: seal a module graph and report the optimized chunks

mod optimize;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

pub use optimize::OptimizeCommand;

/// Chunk graph optimizer for the Component build tool
#[derive(Parser, Debug)]
#[command(name = "component-chunks")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to component.toml config file [default: ./component.toml when present]
    #[arg(short, long, global = true, env = "COMPONENT_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build and optimize the chunk graph of a module graph
    Optimize(OptimizeCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Optimize(cmd) => {
                if !cmd.json {
                    print_banner();
                }
                cmd.execute(self.config.as_deref())
            }
        }
    }
}

/// Print the banner
fn print_banner() {
    eprintln!(
        "\n{} {} {}\n",
        "⚡".cyan(),
        "component-chunks".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
}
