//! Configuration schema definitions

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::optimize::{
    AggressiveSplittingOptions, CacheGroupOptions, CacheGroupTest, CacheGroups, ChunkNameOption,
    ChunksFilter, SplitChunksOptions,
};

/// Project metadata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project name
    #[serde(default = "default_name")]
    pub name: String,

    /// Project root that record identifiers are made relative to
    #[serde(default = "default_context")]
    pub context: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            context: default_context(),
        }
    }
}

fn default_name() -> String {
    "app".to_string()
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

/// Where records are kept between builds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordsConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Which passes run, and their options.
///
/// Split chunks and aggressive splitting only run when their table is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizationConfig {
    #[serde(default = "default_true")]
    pub ensure_chunk_conditions: bool,

    #[serde(default = "default_true")]
    pub remove_empty_chunks: bool,

    #[serde(default)]
    pub split_chunks: Option<SplitChunksConfig>,

    #[serde(default)]
    pub aggressive_splitting: Option<AggressiveSplittingConfig>,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            ensure_chunk_conditions: true,
            remove_empty_chunks: true,
            split_chunks: None,
            aggressive_splitting: None,
        }
    }
}

/// `name = true` derives names from the split chunks, a string fixes one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameConfig {
    Auto(bool),
    Fixed(String),
}

impl From<&NameConfig> for ChunkNameOption {
    fn from(name: &NameConfig) -> Self {
        match name {
            NameConfig::Auto(true) => ChunkNameOption::Auto,
            NameConfig::Auto(false) => ChunkNameOption::None,
            NameConfig::Fixed(name) => ChunkNameOption::Fixed(name.clone()),
        }
    }
}

/// A regular expression test, written `{ regex = "..." }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegexTest {
    pub regex: String,
}

/// Cache group test: a boolean, a name prefix or a regular expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestConfig {
    Bool(bool),
    Prefix(String),
    Regex(RegexTest),
}

impl TestConfig {
    pub fn to_test(&self) -> Result<CacheGroupTest> {
        Ok(match self {
            TestConfig::Bool(value) => CacheGroupTest::Bool(*value),
            TestConfig::Prefix(prefix) => CacheGroupTest::Prefix(prefix.clone()),
            TestConfig::Regex(RegexTest { regex }) => {
                let compiled = Regex::new(regex).map_err(|e| {
                    Error::invalid_options(format!("invalid cache group regex \"{regex}\": {e}"))
                })?;
                CacheGroupTest::Regex(compiled)
            }
        })
    }
}

/// One keyed cache group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheGroupConfig {
    pub key: String,

    #[serde(default)]
    pub test: Option<TestConfig>,

    #[serde(default)]
    pub name: Option<NameConfig>,

    #[serde(default)]
    pub chunks: Option<ChunksFilter>,

    #[serde(default)]
    pub enforce: bool,

    #[serde(default)]
    pub min_size: Option<usize>,

    #[serde(default)]
    pub min_chunks: Option<usize>,

    #[serde(default)]
    pub max_async_requests: Option<usize>,

    #[serde(default)]
    pub max_initial_requests: Option<usize>,

    #[serde(default)]
    pub reuse_existing_chunk: bool,
}

impl CacheGroupConfig {
    fn to_options(&self) -> Result<CacheGroupOptions> {
        Ok(CacheGroupOptions {
            key: self.key.clone(),
            test: self.test.as_ref().map(TestConfig::to_test).transpose()?,
            name: self.name.as_ref().map(ChunkNameOption::from),
            chunks: self.chunks,
            enforce: self.enforce,
            min_size: self.min_size,
            min_chunks: self.min_chunks,
            max_async_requests: self.max_async_requests,
            max_initial_requests: self.max_initial_requests,
            reuse_existing_chunk: self.reuse_existing_chunk,
        })
    }
}

/// Either an ordered list of cache groups or the single-group shorthand
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheGroupsConfig {
    Keyed(Vec<CacheGroupConfig>),
    Shorthand(TestConfig),
}

/// `[optimization.split_chunks]`; unset values keep the built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitChunksConfig {
    #[serde(default)]
    pub chunks: Option<ChunksFilter>,

    #[serde(default)]
    pub min_size: Option<usize>,

    #[serde(default)]
    pub min_chunks: Option<usize>,

    #[serde(default)]
    pub max_async_requests: Option<usize>,

    #[serde(default)]
    pub max_initial_requests: Option<usize>,

    #[serde(default)]
    pub name: Option<NameConfig>,

    #[serde(default)]
    pub cache_groups: Option<CacheGroupsConfig>,
}

impl SplitChunksConfig {
    /// Convert to validated pass options
    pub fn to_options(&self) -> Result<SplitChunksOptions> {
        let defaults = SplitChunksOptions::default();
        let cache_groups = match &self.cache_groups {
            None => CacheGroups::None,
            Some(CacheGroupsConfig::Shorthand(test)) => CacheGroups::Test(test.to_test()?),
            Some(CacheGroupsConfig::Keyed(groups)) => CacheGroups::Keyed(
                groups
                    .iter()
                    .map(CacheGroupConfig::to_options)
                    .collect::<Result<Vec<_>>>()?,
            ),
        };

        let options = SplitChunksOptions {
            chunks: self.chunks.unwrap_or(defaults.chunks),
            min_size: self.min_size.unwrap_or(defaults.min_size),
            min_chunks: self.min_chunks.unwrap_or(defaults.min_chunks),
            max_async_requests: self.max_async_requests.unwrap_or(defaults.max_async_requests),
            max_initial_requests: self
                .max_initial_requests
                .unwrap_or(defaults.max_initial_requests),
            name: self.name.as_ref().map(ChunkNameOption::from).unwrap_or(defaults.name),
            cache_groups,
        };
        options.validate()?;
        Ok(options)
    }
}

/// `[optimization.aggressive_splitting]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggressiveSplittingConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub chunk_overhead: usize,
    pub entry_chunk_multiplicator: usize,
}

impl Default for AggressiveSplittingConfig {
    fn default() -> Self {
        let defaults = AggressiveSplittingOptions::default();
        Self {
            min_size: defaults.min_size,
            max_size: defaults.max_size,
            chunk_overhead: defaults.chunk_overhead,
            entry_chunk_multiplicator: defaults.entry_chunk_multiplicator,
        }
    }
}

impl AggressiveSplittingConfig {
    pub fn to_options(&self) -> Result<AggressiveSplittingOptions> {
        let options = AggressiveSplittingOptions {
            min_size: self.min_size,
            max_size: self.max_size,
            chunk_overhead: self.chunk_overhead,
            entry_chunk_multiplicator: self.entry_chunk_multiplicator,
        };
        options.validate()?;
        Ok(options)
    }
}
