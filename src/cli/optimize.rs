//! Optimize command implementation

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::{info, warn};

use crate::bundler::{BuildResult, Bundler, Compilation, GraphDescription, ModuleGraph, Records};
use crate::config::{Config, CONFIG_FILE};
use crate::utils::{format_duration, format_size};

/// Seal a module graph and print the resulting chunks
#[derive(Args, Debug)]
pub struct OptimizeCommand {
    /// Module graph description (JSON)
    pub graph: PathBuf,

    /// Records file, overrides `[records] path`
    #[arg(long)]
    pub records: Option<PathBuf>,

    /// Print the build result as JSON
    #[arg(long)]
    pub json: bool,
}

impl OptimizeCommand {
    pub fn execute(&self, config_path: Option<&Path>) -> Result<()> {
        let start = Instant::now();

        let config = load_config(config_path)?;
        let graph = load_graph(&self.graph)?;

        let records_path = self.records.clone().or_else(|| config.records_path());
        let records = match &records_path {
            Some(path) => Records::load_or_default(path)
                .with_context(|| format!("Failed to read records: {}", path.display()))?,
            None => Records::default(),
        };

        let mut compilation = Compilation::new(graph)
            .with_context(config.context())
            .with_records(records);
        let mut bundler = Bundler::from_config(&config).context("Invalid optimization options")?;
        let result = bundler
            .seal(&mut compilation)
            .context("Failed to optimize the chunk graph")?;

        if let Some(path) = &records_path {
            compilation
                .records
                .save(path)
                .with_context(|| format!("Failed to write records: {}", path.display()))?;
            info!("Records written to {}", path.display());
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_summary(&result);
            eprintln!(
                "\n{} Optimized {} chunk(s) in {}\n",
                "✓".green().bold(),
                result.chunks.len(),
                format_duration(start.elapsed())
            );
        }

        Ok(())
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Config::load(path)
        }
        None if Path::new(CONFIG_FILE).exists() => {
            info!("Loading configuration from {}", CONFIG_FILE);
            Config::load(CONFIG_FILE)
        }
        None => Ok(Config {
            root: std::env::current_dir()?,
            ..Config::default()
        }),
    }
}

fn load_graph(path: &Path) -> Result<ModuleGraph> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read module graph: {}", path.display()))?;
    let description: GraphDescription = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse module graph: {}", path.display()))?;
    let graph = ModuleGraph::from_description(description)
        .with_context(|| format!("Invalid module graph: {}", path.display()))?;
    if graph.is_empty() {
        warn!("Module graph {} declares no modules", path.display());
    }
    info!("Loaded {} modules from {}", graph.len(), path.display());
    Ok(graph)
}

/// Print one line per chunk, followed by the entrypoints
fn print_summary(result: &BuildResult) {
    for chunk in &result.chunks {
        let id = chunk
            .id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "?".to_string());
        let name = chunk.name.as_deref().unwrap_or("(unnamed)");
        let kind = if chunk.entry {
            "entry".green()
        } else if chunk.initial {
            "initial".yellow()
        } else {
            "async".blue()
        };

        eprintln!(
            "  {} {} {} {} {}",
            "•".dimmed(),
            format!("[{id}]").bold(),
            name.cyan(),
            kind,
            format_size(chunk.size).dimmed()
        );
        if let Some(reason) = &chunk.reason {
            eprintln!("      {}", reason.dimmed());
        }
        for module in &chunk.modules {
            eprintln!("      {}", module);
        }
    }

    for (name, ids) in &result.entrypoints {
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        eprintln!("  {} {} → {}", "▸".cyan(), name.bold(), ids.join(", "));
    }
}
