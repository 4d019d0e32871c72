//! Split chunks: move modules shared between chunks into split chunks,
//! grouped by configurable cache groups

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::OptimizePass;
use crate::bundler::{helpers, ChunkIdx, Compilation, ModuleIdx};
use crate::error::{Error, Result};

pub const DEFAULT_MIN_SIZE: usize = 30_000;
pub const DEFAULT_MIN_CHUNKS: usize = 1;
pub const DEFAULT_MAX_ASYNC_REQUESTS: usize = 5;
pub const DEFAULT_MAX_INITIAL_REQUESTS: usize = 3;

/// Key used for the `cache_groups = "..."` shorthand
pub const SHORTHAND_CACHE_GROUP_KEY: &str = "vendors";

/// Computes the split chunk name for a module and its selected chunks
pub type NameFn =
    Arc<dyn Fn(&Compilation, ModuleIdx, &[ChunkIdx], Option<&str>) -> Option<String> + Send + Sync>;

/// Cache-group membership predicate over a module and its selected chunks
pub type TestFn = Arc<dyn Fn(&Compilation, ModuleIdx, &[ChunkIdx]) -> bool + Send + Sync>;

/// Selects the cache group of a module directly
pub type CacheGroupFn =
    Arc<dyn Fn(&Compilation, ModuleIdx, &[ChunkIdx]) -> Option<CacheGroupOptions> + Send + Sync>;

/// Which chunks a split may take modules from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunksFilter {
    Initial,
    Async,
    #[default]
    All,
}

impl ChunksFilter {
    fn selects(self, compilation: &Compilation, chunk: ChunkIdx) -> bool {
        match self {
            ChunksFilter::Initial => compilation.chunk_is_initial(chunk),
            ChunksFilter::Async => !compilation.chunk_is_initial(chunk),
            ChunksFilter::All => true,
        }
    }
}

/// How a split chunk is named
#[derive(Clone, Default)]
pub enum ChunkNameOption {
    /// Unnamed split chunks
    #[default]
    None,
    /// Sorted names of the selected chunks joined by `~`, prefixed with the cache group key
    Auto,
    Fixed(String),
    Fn(NameFn),
}

impl ChunkNameOption {
    fn resolve(
        &self,
        compilation: &Compilation,
        module: ModuleIdx,
        chunks: &[ChunkIdx],
        cache_group: Option<&str>,
    ) -> Option<String> {
        match self {
            ChunkNameOption::None => None,
            ChunkNameOption::Fixed(name) => Some(name.clone()),
            ChunkNameOption::Fn(name_fn) => name_fn(compilation, module, chunks, cache_group),
            ChunkNameOption::Auto => {
                let mut names = chunks
                    .iter()
                    .map(|&c| compilation.chunk(c).name.clone())
                    .collect::<Option<Vec<_>>>()?;
                names.sort();
                let joined = names.join("~");
                Some(match cache_group {
                    Some(key) => format!("{key}~{joined}"),
                    None => joined,
                })
            }
        }
    }
}

impl fmt::Debug for ChunkNameOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkNameOption::None => f.write_str("None"),
            ChunkNameOption::Auto => f.write_str("Auto"),
            ChunkNameOption::Fixed(name) => f.debug_tuple("Fixed").field(name).finish(),
            ChunkNameOption::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// Decides whether a module belongs to a cache group
#[derive(Clone)]
pub enum CacheGroupTest {
    Bool(bool),
    /// Chunk names or the module's condition name start with this prefix
    Prefix(String),
    /// Chunk names or the module's condition name match
    Regex(Regex),
    Fn(TestFn),
}

impl CacheGroupTest {
    fn matches(&self, compilation: &Compilation, module: ModuleIdx, chunks: &[ChunkIdx]) -> bool {
        let names = || {
            chunks
                .iter()
                .filter_map(|&c| compilation.chunk(c).name.as_deref())
                .chain(
                    compilation
                        .module_graph()
                        .module(module)
                        .name_for_condition
                        .as_deref(),
                )
        };
        match self {
            CacheGroupTest::Bool(value) => *value,
            CacheGroupTest::Fn(test) => test(compilation, module, chunks),
            CacheGroupTest::Prefix(prefix) => names().any(|name| name.starts_with(prefix.as_str())),
            CacheGroupTest::Regex(regex) => names().any(|name| regex.is_match(name)),
        }
    }
}

impl fmt::Debug for CacheGroupTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheGroupTest::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            CacheGroupTest::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            CacheGroupTest::Regex(regex) => f.debug_tuple("Regex").field(&regex.as_str()).finish(),
            CacheGroupTest::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// One cache group; unset thresholds fall back to the global options
#[derive(Debug, Clone, Default)]
pub struct CacheGroupOptions {
    pub key: String,
    /// A group without a test never matches
    pub test: Option<CacheGroupTest>,
    pub name: Option<ChunkNameOption>,
    pub chunks: Option<ChunksFilter>,
    /// Ignore every size, chunk-count and request limit
    pub enforce: bool,
    pub min_size: Option<usize>,
    pub min_chunks: Option<usize>,
    pub max_async_requests: Option<usize>,
    pub max_initial_requests: Option<usize>,
    pub reuse_existing_chunk: bool,
}

impl CacheGroupOptions {
    pub fn new(key: impl Into<String>, test: CacheGroupTest) -> Self {
        Self {
            key: key.into(),
            test: Some(test),
            ..Self::default()
        }
    }
}

/// Cache group configuration
#[derive(Clone, Default)]
pub enum CacheGroups {
    #[default]
    None,
    /// Shorthand for a single cache group keyed `vendors`
    Test(CacheGroupTest),
    /// Groups tried in order, first match wins
    Keyed(Vec<CacheGroupOptions>),
    Fn(CacheGroupFn),
}

impl CacheGroups {
    fn select(
        &self,
        compilation: &Compilation,
        module: ModuleIdx,
        chunks: &[ChunkIdx],
    ) -> Option<CacheGroupOptions> {
        match self {
            CacheGroups::None => None,
            CacheGroups::Fn(select) => select(compilation, module, chunks),
            CacheGroups::Test(test) => test
                .matches(compilation, module, chunks)
                .then(|| CacheGroupOptions::new(SHORTHAND_CACHE_GROUP_KEY, test.clone())),
            CacheGroups::Keyed(groups) => groups
                .iter()
                .find(|group| {
                    group
                        .test
                        .as_ref()
                        .is_some_and(|test| test.matches(compilation, module, chunks))
                })
                .cloned(),
        }
    }
}

impl fmt::Debug for CacheGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheGroups::None => f.write_str("None"),
            CacheGroups::Test(test) => f.debug_tuple("Test").field(test).finish(),
            CacheGroups::Keyed(groups) => f.debug_tuple("Keyed").field(groups).finish(),
            CacheGroups::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// Split chunks options
#[derive(Debug, Clone)]
pub struct SplitChunksOptions {
    pub chunks: ChunksFilter,
    /// Smallest total module size worth a split
    pub min_size: usize,
    /// Number of chunks a module must be shared by
    pub min_chunks: usize,
    pub max_async_requests: usize,
    pub max_initial_requests: usize,
    pub name: ChunkNameOption,
    pub cache_groups: CacheGroups,
}

impl Default for SplitChunksOptions {
    fn default() -> Self {
        Self {
            chunks: ChunksFilter::All,
            min_size: DEFAULT_MIN_SIZE,
            min_chunks: DEFAULT_MIN_CHUNKS,
            max_async_requests: DEFAULT_MAX_ASYNC_REQUESTS,
            max_initial_requests: DEFAULT_MAX_INITIAL_REQUESTS,
            name: ChunkNameOption::None,
            cache_groups: CacheGroups::None,
        }
    }
}

impl SplitChunksOptions {
    pub fn validate(&self) -> Result<()> {
        check_thresholds(
            "split chunks",
            Some(self.min_chunks),
            Some(self.max_async_requests),
            Some(self.max_initial_requests),
        )?;

        if let CacheGroups::Keyed(groups) = &self.cache_groups {
            let mut keys = HashSet::new();
            for group in groups {
                if group.key.is_empty() {
                    return Err(Error::invalid_options("cache group key must not be empty"));
                }
                if !keys.insert(group.key.as_str()) {
                    return Err(Error::invalid_options(format!(
                        "cache group \"{}\" is defined more than once",
                        group.key
                    )));
                }
                check_thresholds(
                    &format!("cache group \"{}\"", group.key),
                    group.min_chunks,
                    group.max_async_requests,
                    group.max_initial_requests,
                )?;
            }
        }

        Ok(())
    }
}

fn check_thresholds(
    owner: &str,
    min_chunks: Option<usize>,
    max_async_requests: Option<usize>,
    max_initial_requests: Option<usize>,
) -> Result<()> {
    for (field, value) in [
        ("min_chunks", min_chunks),
        ("max_async_requests", max_async_requests),
        ("max_initial_requests", max_initial_requests),
    ] {
        if value == Some(0) {
            return Err(Error::invalid_options(format!("{owner}: {field} must be at least 1")));
        }
    }
    Ok(())
}

/// Thresholds in effect for one module
#[derive(Debug, Clone)]
struct ResolvedCacheGroup {
    key: Option<String>,
    chunks: ChunksFilter,
    min_size: usize,
    min_chunks: usize,
    max_async_requests: usize,
    max_initial_requests: usize,
    name: ChunkNameOption,
    reuse_existing_chunk: bool,
    enforce: bool,
}

impl ResolvedCacheGroup {
    fn from_options(group: CacheGroupOptions, options: &SplitChunksOptions) -> Self {
        let name = group.name.unwrap_or_else(|| options.name.clone());
        let chunks = group.chunks.unwrap_or(options.chunks);
        if group.enforce {
            return Self {
                key: Some(group.key),
                chunks,
                min_size: 0,
                min_chunks: 1,
                max_async_requests: usize::MAX,
                max_initial_requests: usize::MAX,
                name,
                reuse_existing_chunk: group.reuse_existing_chunk,
                enforce: true,
            };
        }
        Self {
            key: Some(group.key),
            chunks,
            min_size: group.min_size.unwrap_or(options.min_size),
            min_chunks: group.min_chunks.unwrap_or(options.min_chunks),
            max_async_requests: group.max_async_requests.unwrap_or(options.max_async_requests),
            max_initial_requests: group
                .max_initial_requests
                .unwrap_or(options.max_initial_requests),
            name,
            reuse_existing_chunk: group.reuse_existing_chunk,
            enforce: false,
        }
    }

    fn default_group(options: &SplitChunksOptions) -> Self {
        Self {
            key: None,
            chunks: options.chunks,
            min_size: options.min_size,
            min_chunks: options.min_chunks,
            max_async_requests: options.max_async_requests,
            max_initial_requests: options.max_initial_requests,
            name: options.name.clone(),
            reuse_existing_chunk: true,
            enforce: false,
        }
    }

    fn max_requests(&self, initial: bool) -> usize {
        if initial {
            self.max_initial_requests
        } else {
            self.max_async_requests
        }
    }
}

/// Modules collected under one key, with the chunks they span
#[derive(Debug)]
struct SplitCandidate {
    modules: Vec<ModuleIdx>,
    cache_group: ResolvedCacheGroup,
    name: Option<String>,
    /// Spanned chunks with their module count when first seen
    chunks: BTreeMap<ChunkIdx, usize>,
    chunks_keys: HashSet<String>,
    size: usize,
}

/// The split chunks pass
#[derive(Debug)]
pub struct SplitChunksPass {
    options: SplitChunksOptions,
    already_optimized: bool,
}

impl SplitChunksPass {
    pub fn new(options: SplitChunksOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            already_optimized: false,
        })
    }

    fn collect_candidates(&self, compilation: &Compilation) -> BTreeMap<String, SplitCandidate> {
        let graph = compilation.module_graph();
        let chunk_index: BTreeMap<ChunkIdx, usize> = compilation
            .chunks()
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i + 1))
            .collect();

        let mut candidates: BTreeMap<String, SplitCandidate> = BTreeMap::new();

        for (module_idx, module) in graph.modules() {
            // Entry modules stay in their entry chunks
            if graph.is_entry_module(module_idx) {
                continue;
            }
            let chunks: Vec<ChunkIdx> = module.chunks().collect();
            let cache_group = match self.options.cache_groups.select(compilation, module_idx, &chunks) {
                Some(group) => ResolvedCacheGroup::from_options(group, &self.options),
                None => ResolvedCacheGroup::default_group(&self.options),
            };

            let selected: Vec<ChunkIdx> = chunks
                .into_iter()
                .filter(|&c| cache_group.chunks.selects(compilation, c))
                .collect();
            if selected.len() < cache_group.min_chunks {
                continue;
            }
            // A lone chunk is only split off for a cache group
            if selected.len() == 1 && cache_group.key.is_none() {
                continue;
            }

            let name = cache_group.name.resolve(
                compilation,
                module_idx,
                &selected,
                cache_group.key.as_deref(),
            );

            let mut indices: Vec<usize> = selected.iter().map(|c| chunk_index[c]).collect();
            indices.sort_unstable();
            let chunks_key = indices
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let key = match (&name, &cache_group.key) {
                (Some(name), _) => format!("name:{name}"),
                (None, Some(group)) => format!("key:{group}"),
                (None, None) => format!("chunks:{chunks_key}"),
            };

            let candidate = candidates.entry(key).or_insert_with(|| SplitCandidate {
                modules: Vec::new(),
                cache_group: cache_group.clone(),
                name: name.clone(),
                chunks: BTreeMap::new(),
                chunks_keys: HashSet::new(),
                size: 0,
            });
            candidate.modules.push(module_idx);
            candidate.size += module.size;
            if candidate.chunks_keys.insert(chunks_key) {
                for &chunk in &selected {
                    candidate
                        .chunks
                        .insert(chunk, compilation.chunk(chunk).number_of_modules());
                }
            }
        }

        for candidate in candidates.values_mut() {
            candidate
                .modules
                .sort_by(|a, b| graph.module(*a).identifier.cmp(&graph.module(*b).identifier));
        }

        candidates
    }

    /// Enforced first, then larger size, then more modules, then identifiers
    fn compare_candidates(compilation: &Compilation, a: &SplitCandidate, b: &SplitCandidate) -> Ordering {
        let graph = compilation.module_graph();
        b.cache_group
            .enforce
            .cmp(&a.cache_group.enforce)
            .then_with(|| b.size.cmp(&a.size))
            .then_with(|| b.modules.len().cmp(&a.modules.len()))
            .then_with(|| {
                let ours = a.modules.iter().map(|m| &graph.module(*m).identifier);
                let theirs = b.modules.iter().map(|m| &graph.module(*m).identifier);
                theirs.cmp(ours)
            })
    }

    /// An existing spanned chunk holding exactly the candidate's modules
    fn find_reusable_chunk(compilation: &Compilation, candidate: &SplitCandidate) -> Option<ChunkIdx> {
        let mut best: Option<ChunkIdx> = None;
        for (&chunk_idx, &count) in &candidate.chunks {
            let chunk = compilation.chunk(chunk_idx);
            if count != candidate.modules.len()
                || chunk.is_removed()
                || chunk.has_entry_module()
                || chunk.number_of_modules() != candidate.modules.len()
                || !candidate.modules.iter().all(|&m| chunk.contains_module(m))
            {
                continue;
            }
            let better = match best.map(|b| compilation.chunk(b).name.as_deref()) {
                None | Some(None) => true,
                Some(Some(current)) => match chunk.name.as_deref() {
                    Some(name) => (name.len(), name) < (current.len(), current),
                    None => false,
                },
            };
            if better {
                best = Some(chunk_idx);
            }
        }
        best
    }

    fn materialize(&self, compilation: &mut Compilation, candidate: &SplitCandidate) -> bool {
        let mut chunk_name = candidate.name.clone();
        let mut new_chunk = None;
        let mut is_reused = false;

        if candidate.cache_group.reuse_existing_chunk {
            if let Some(existing) = Self::find_reusable_chunk(compilation, candidate) {
                new_chunk = Some(existing);
                chunk_name = None;
                is_reused = true;
            }
        }

        for &chunk in candidate.chunks.keys() {
            if Some(chunk) == new_chunk || compilation.chunk(chunk).is_removed() {
                continue;
            }
            // Don't split a chunk off itself
            if chunk_name.is_some() && compilation.chunk(chunk).name == chunk_name {
                continue;
            }
            if !candidate
                .modules
                .iter()
                .any(|&m| compilation.chunk(chunk).contains_module(m))
            {
                continue;
            }
            let max_requests = candidate
                .cache_group
                .max_requests(compilation.chunk_is_initial(chunk));
            if max_requests != usize::MAX && compilation.chunk_requests(chunk) >= max_requests {
                trace!(
                    "Chunk {} already loads {} chunks per request",
                    compilation.chunk(chunk).debug_id,
                    compilation.chunk_requests(chunk)
                );
                continue;
            }

            let target = *new_chunk.get_or_insert_with(|| compilation.add_chunk(chunk_name.clone()));
            compilation.split_chunk(chunk, target);
            for &module in &candidate.modules {
                helpers::disconnect_chunk_and_module(compilation, chunk, module);
                compilation
                    .module_graph_mut()
                    .module_mut(module)
                    .rewrite_chunk_in_reasons(chunk, &[target]);
            }
        }

        let Some(new_chunk) = new_chunk else {
            return false;
        };

        let mut reason = String::from(if is_reused {
            "reused as split chunk"
        } else {
            "split chunk"
        });
        if let Some(key) = &candidate.cache_group.key {
            reason.push_str(&format!(" (cache group: {key})"));
        }
        if let Some(name) = &chunk_name {
            reason.push_str(&format!(" (name: {name})"));
            if compilation.entrypoint(name).is_some() {
                Self::demote_entrypoint(compilation, name, new_chunk);
            }
        }
        compilation.chunk_mut(new_chunk).chunk_reason = Some(reason);

        if !is_reused {
            for &module in &candidate.modules {
                helpers::connect_chunk_and_module(compilation, new_chunk, module);
            }
        }

        debug!(
            "Split {} modules into chunk {} ({})",
            candidate.modules.len(),
            compilation.chunk(new_chunk).debug_id,
            compilation.chunk(new_chunk).chunk_reason.as_deref().unwrap_or_default()
        );
        true
    }

    /// The split chunk took the name of an entry: the entrypoint goes away
    /// and its chunks become plain split chunks loaded after `new_chunk`
    fn demote_entrypoint(compilation: &mut Compilation, name: &str, new_chunk: ChunkIdx) {
        let Some(entrypoint) = compilation.entrypoint(name) else {
            return;
        };
        debug!(
            "Split chunk {} replaces entrypoint {}",
            compilation.chunk(new_chunk).debug_id,
            name
        );

        let former: Vec<ChunkIdx> = compilation
            .chunk_group(entrypoint)
            .chunks()
            .iter()
            .copied()
            .filter(|&c| c != new_chunk)
            .collect();
        compilation.remove_entrypoint(name);
        compilation.chunk_mut(new_chunk).entry_module = None;

        let groups: Vec<_> = compilation.chunk(new_chunk).groups().collect();
        let mut after = new_chunk;
        for chunk in former {
            compilation.chunk_mut(chunk).entry_module = None;
            if compilation.chunk(chunk).number_of_groups() > 0 {
                continue;
            }
            for &group in &groups {
                helpers::insert_chunk_into_group(compilation, group, chunk, after);
            }
            after = chunk;
        }
    }
}

impl OptimizePass for SplitChunksPass {
    fn name(&self) -> &str {
        "split-chunks"
    }

    fn optimize_chunks_advanced(&mut self, compilation: &mut Compilation) -> Result<bool> {
        if self.already_optimized {
            return Ok(false);
        }
        self.already_optimized = true;

        let candidates = self.collect_candidates(compilation);
        let mut entries: Vec<SplitCandidate> = candidates
            .into_values()
            .filter(|c| c.cache_group.enforce || c.size >= c.cache_group.min_size)
            .collect();
        entries.sort_by(|a, b| Self::compare_candidates(compilation, a, b));
        debug!("{} split candidates", entries.len());

        let mut changed = false;
        for candidate in &entries {
            changed |= self.materialize(compilation, candidate);
        }
        Ok(changed)
    }

    fn unseal(&mut self) {
        self.already_optimized = false;
    }
}
