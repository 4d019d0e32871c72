//! Configuration handling for component-chunks
//!
//! Parses and validates component.toml configuration files.

mod schema;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::optimize::{
    AggressiveSplittingPass, EnsureChunkConditionsPass, PassManager, RemoveEmptyChunksPass,
    SplitChunksPass,
};

pub use schema::*;

/// Default configuration file name
pub const CONFIG_FILE: &str = "component.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Project metadata
    #[serde(default)]
    pub project: ProjectConfig,

    /// Records persistence
    #[serde(default)]
    pub records: RecordsConfig,

    /// Optimization passes
    #[serde(default)]
    pub optimization: OptimizationConfig,

    /// Root directory (computed from config file location)
    #[serde(skip)]
    pub root: PathBuf,
}

impl Config {
    /// Load configuration from a file path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let canonical_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        let content = fs::read_to_string(&canonical_path)
            .with_context(|| format!("Failed to read config file: {}", canonical_path.display()))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse {}", canonical_path.display()))?;

        // Set root directory to the directory containing the config file
        config.root = canonical_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        debug!("Loaded configuration for {}", config.project.name);
        Ok(config)
    }

    /// Parse and validate configuration text; `root` is left empty
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.project.name.trim().is_empty() {
            anyhow::bail!("Project name must not be empty");
        }
        if let Some(split_chunks) = &self.optimization.split_chunks {
            split_chunks
                .to_options()
                .context("Invalid [optimization.split_chunks] section")?;
        }
        if let Some(aggressive) = &self.optimization.aggressive_splitting {
            aggressive
                .to_options()
                .context("Invalid [optimization.aggressive_splitting] section")?;
        }
        Ok(())
    }

    /// Get the absolute project context
    pub fn context(&self) -> PathBuf {
        self.root.join(&self.project.context)
    }

    /// Get the absolute records path, if records are kept
    pub fn records_path(&self) -> Option<PathBuf> {
        self.records.path.as_ref().map(|p| self.root.join(p))
    }
}

impl OptimizationConfig {
    /// Instantiate the enabled passes in their fixed order
    pub fn pass_manager(&self) -> crate::Result<PassManager> {
        let mut passes = PassManager::new();
        if self.ensure_chunk_conditions {
            passes.register(Box::new(EnsureChunkConditionsPass::new()));
        }
        if let Some(split_chunks) = &self.split_chunks {
            passes.register(Box::new(SplitChunksPass::new(split_chunks.to_options()?)?));
        }
        if let Some(aggressive) = &self.aggressive_splitting {
            passes.register(Box::new(AggressiveSplittingPass::new(aggressive.to_options()?)?));
        }
        if self.remove_empty_chunks {
            passes.register(Box::new(RemoveEmptyChunksPass::new()));
        }
        Ok(passes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::{CacheGroupTest, CacheGroups, ChunkNameOption, ChunksFilter};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const FULL: &str = r#"
[project]
name = "shop"
context = "web"

[records]
path = "build/records.json"

[optimization]
remove_empty_chunks = false

[optimization.split_chunks]
chunks = "async"
min_size = 0
name = true

[[optimization.split_chunks.cache_groups]]
key = "vendors"
test = { regex = "[\\/]node_modules[\\/]" }
enforce = true

[[optimization.split_chunks.cache_groups]]
key = "common"
test = "shared"
min_chunks = 2
reuse_existing_chunk = true

[optimization.aggressive_splitting]
min_size = 100
max_size = 200
"#;

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, FULL).unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.project.name, "shop");
        assert_eq!(config.root, dir.path());
        assert_eq!(config.context(), dir.path().join("web"));
        assert_eq!(config.records_path(), Some(dir.path().join("build/records.json")));
        assert!(config.optimization.ensure_chunk_conditions);
        assert!(!config.optimization.remove_empty_chunks);

        let split = config.optimization.split_chunks.as_ref().unwrap().to_options().unwrap();
        assert_eq!(split.chunks, ChunksFilter::Async);
        assert_eq!(split.min_size, 0);
        assert_eq!(split.max_initial_requests, 3);
        assert!(matches!(split.name, ChunkNameOption::Auto));
        let CacheGroups::Keyed(groups) = &split.cache_groups else {
            panic!("expected keyed cache groups, got {:?}", split.cache_groups);
        };
        assert_eq!(groups.len(), 2);
        assert!(groups[0].enforce);
        assert!(matches!(groups[0].test, Some(CacheGroupTest::Regex(_))));
        assert!(matches!(&groups[1].test, Some(CacheGroupTest::Prefix(p)) if p == "shared"));
        assert_eq!(groups[1].min_chunks, Some(2));

        let aggressive = config.optimization.aggressive_splitting.as_ref().unwrap();
        assert_eq!(aggressive.max_size, 200);
        assert_eq!(aggressive.entry_chunk_multiplicator, 1);

        let passes = config.optimization.pass_manager().unwrap();
        assert_eq!(
            passes.names(),
            vec!["ensure-chunk-conditions", "split-chunks", "aggressive-splitting"]
        );
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.project.name, "app");
        assert_eq!(config.records_path(), None);
        assert!(config.optimization.split_chunks.is_none());
        assert_eq!(
            config.optimization.pass_manager().unwrap().names(),
            vec!["ensure-chunk-conditions", "remove-empty-chunks"]
        );
    }

    #[test]
    fn test_cache_group_shorthands() {
        let config = Config::parse(
            "[optimization.split_chunks]\ncache_groups = \"node_modules\"\nname = \"vendor\"\n",
        )
        .unwrap();
        let split = config.optimization.split_chunks.unwrap().to_options().unwrap();
        assert!(matches!(
            split.cache_groups,
            CacheGroups::Test(CacheGroupTest::Prefix(ref p)) if p == "node_modules"
        ));
        assert!(matches!(split.name, ChunkNameOption::Fixed(ref n) if n == "vendor"));

        let config = Config::parse(
            "[optimization.split_chunks]\ncache_groups = { regex = \"^lib\" }\n",
        )
        .unwrap();
        let split = config.optimization.split_chunks.unwrap().to_options().unwrap();
        assert!(matches!(split.cache_groups, CacheGroups::Test(CacheGroupTest::Regex(_))));
    }

    #[test]
    fn test_rejects_invalid_options() {
        let cases = [
            "[optimization.split_chunks]\nmin_chunks = 0\n",
            "[optimization.split_chunks]\nmax_async_requests = 0\n",
            "[optimization.split_chunks]\ncache_groups = { regex = \"(\" }\n",
            "[[optimization.split_chunks.cache_groups]]\nkey = \"a\"\n[[optimization.split_chunks.cache_groups]]\nkey = \"a\"\n",
            "[[optimization.split_chunks.cache_groups]]\nkey = \"\"\n",
            "[optimization.aggressive_splitting]\nmin_size = 10\nmax_size = 5\n",
            "[optimization.aggressive_splitting]\nentry_chunk_multiplicator = 0\n",
            "[project]\nname = \"\"\n",
        ];
        for case in cases {
            assert!(Config::parse(case).is_err(), "accepted:\n{case}");
        }
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(Config::parse("[optimization]\nminimize = true\n").is_err());
        assert!(Config::parse("[optimization.split_chunks]\nmax_size = 1\n").is_err());
        assert!(Config::parse("[dev]\nport = 3000\n").is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
