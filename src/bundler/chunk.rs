//! Chunks: deduplicated module sets destined for one output unit

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use once_cell::unsync::OnceCell;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::{debug, trace};

use super::{helpers, ChunkGroupIdx, Compilation, ModuleGraph, ModuleIdx};

/// Index of a chunk in the [`Compilation`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkIdx(pub(crate) usize);

impl ChunkIdx {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Public chunk id, assigned at finalize or replayed from a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkId {
    Number(u64),
    Name(String),
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkId::Number(id) => write!(f, "{id}"),
            ChunkId::Name(id) => f.write_str(id),
        }
    }
}

impl From<u64> for ChunkId {
    fn from(id: u64) -> Self {
        ChunkId::Number(id)
    }
}

impl From<&str> for ChunkId {
    fn from(id: &str) -> Self {
        ChunkId::Name(id.to_string())
    }
}

pub const DEFAULT_CHUNK_OVERHEAD: usize = 10_000;
pub const DEFAULT_ENTRY_CHUNK_MULTIPLICATOR: usize = 10;

/// Constants turning a module byte count into a chunk cost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizeOptions {
    /// Fixed cost of one more request
    pub chunk_overhead: usize,
    /// Weight of modules in initial chunks
    pub entry_chunk_multiplicator: usize,
}

impl Default for ChunkSizeOptions {
    fn default() -> Self {
        Self {
            chunk_overhead: DEFAULT_CHUNK_OVERHEAD,
            entry_chunk_multiplicator: DEFAULT_ENTRY_CHUNK_MULTIPLICATOR,
        }
    }
}

impl ChunkSizeOptions {
    pub fn add_multiplier_and_overhead(&self, size: usize, is_initial: bool) -> usize {
        let multiplicator = if is_initial {
            self.entry_chunk_multiplicator
        } else {
            1
        };
        size * multiplicator + self.chunk_overhead
    }
}

/// Values derived from the module set, dropped on every membership change
#[derive(Debug, Default)]
struct ModuleCaches {
    sorted: OnceCell<Vec<ModuleIdx>>,
    size: OnceCell<usize>,
    ident: OnceCell<String>,
}

/// A chunk is a group of modules that will be emitted together
#[derive(Debug)]
pub struct Chunk {
    /// Public id, `None` until assigned
    pub id: Option<ChunkId>,

    pub ids: Option<Vec<ChunkId>>,

    /// Creation order, for diagnostics only
    pub debug_id: u32,

    /// Chunk name (used for output filename)
    pub name: Option<String>,

    /// Entry module this chunk bootstraps
    pub entry_module: Option<ModuleIdx>,

    pub hash: Option<String>,

    pub rendered_hash: Option<String>,

    /// Why an optimizer created or kept this chunk
    pub chunk_reason: Option<String>,

    pub(crate) removed: bool,
    modules: HashSet<ModuleIdx>,
    groups: BTreeSet<ChunkGroupIdx>,
    caches: ModuleCaches,
}

impl Chunk {
    pub(crate) fn new(name: Option<String>, debug_id: u32) -> Self {
        Self {
            id: None,
            ids: None,
            debug_id,
            name,
            entry_module: None,
            hash: None,
            rendered_hash: None,
            chunk_reason: None,
            removed: false,
            modules: HashSet::new(),
            groups: BTreeSet::new(),
            caches: ModuleCaches::default(),
        }
    }

    pub fn has_entry_module(&self) -> bool {
        self.entry_module.is_some()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Check if chunk is empty
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Number of modules in chunk
    pub fn number_of_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn contains_module(&self, module: ModuleIdx) -> bool {
        self.modules.contains(&module)
    }

    pub(crate) fn add_module(&mut self, module: ModuleIdx) -> bool {
        let added = self.modules.insert(module);
        if added {
            self.invalidate_caches();
        }
        added
    }

    pub(crate) fn remove_module(&mut self, module: ModuleIdx) -> bool {
        let removed = self.modules.remove(&module);
        if removed {
            self.invalidate_caches();
        }
        removed
    }

    fn invalidate_caches(&mut self) {
        self.caches = ModuleCaches::default();
    }

    /// Member modules sorted by identifier
    pub fn modules<'a>(&'a self, graph: &ModuleGraph) -> &'a [ModuleIdx] {
        self.caches.sorted.get_or_init(|| {
            let mut modules: Vec<_> = self.modules.iter().copied().collect();
            modules.sort_by(|a, b| {
                graph
                    .module(*a)
                    .identifier
                    .cmp(&graph.module(*b).identifier)
            });
            modules
        })
    }

    /// Sum of member module sizes
    pub fn modules_size(&self, graph: &ModuleGraph) -> usize {
        *self
            .caches
            .size
            .get_or_init(|| self.modules.iter().map(|m| graph.module(*m).size).sum())
    }

    /// Identity string of the module set: sorted identifiers, `#`-terminated
    pub fn modules_ident(&self, graph: &ModuleGraph) -> &str {
        self.caches.ident.get_or_init(|| {
            self.modules(graph)
                .iter()
                .fold(String::new(), |mut ident, m| {
                    ident.push_str(&graph.module(*m).identifier);
                    ident.push('#');
                    ident
                })
        })
    }

    /// Total order used by every deterministic chunk sort: more modules first,
    /// then by module identifiers, larger first
    pub fn compare_to(&self, other: &Chunk, graph: &ModuleGraph) -> Ordering {
        other
            .number_of_modules()
            .cmp(&self.number_of_modules())
            .then_with(|| {
                let ours = self.modules(graph).iter().map(|m| &graph.module(*m).identifier);
                let theirs = other.modules(graph).iter().map(|m| &graph.module(*m).identifier);
                theirs.cmp(ours)
            })
    }

    /// Chunk groups this chunk belongs to, in creation order
    pub fn groups(&self) -> impl Iterator<Item = ChunkGroupIdx> + '_ {
        self.groups.iter().copied()
    }

    pub fn number_of_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn is_in_group(&self, group: ChunkGroupIdx) -> bool {
        self.groups.contains(&group)
    }

    pub(crate) fn add_group(&mut self, group: ChunkGroupIdx) -> bool {
        self.groups.insert(group)
    }

    pub(crate) fn remove_group(&mut self, group: ChunkGroupIdx) -> bool {
        self.groups.remove(&group)
    }

    /// Feed id, name and module hashes into `hasher`
    pub fn update_hash<H: Digest>(&self, hasher: &mut H, graph: &ModuleGraph) {
        let id = self.id.as_ref().map(ToString::to_string).unwrap_or_default();
        hasher.update(format!("{id} "));
        if let Some(ids) = &self.ids {
            let ids: Vec<_> = ids.iter().map(ToString::to_string).collect();
            hasher.update(ids.join(","));
        }
        hasher.update(format!("{} ", self.name.as_deref().unwrap_or("")));
        for module in self.modules(graph) {
            hasher.update(&graph.module(*module).hash);
        }
    }
}

impl Compilation {
    /// A chunk is initial when an entrypoint loads it synchronously
    pub fn chunk_is_initial(&self, chunk: ChunkIdx) -> bool {
        self.chunk(chunk)
            .groups()
            .any(|g| self.chunk_group(g).is_initial())
    }

    /// Whether the chunk carries the bootstrap code of one of its entrypoints
    pub fn chunk_has_runtime(&self, chunk: ChunkIdx) -> bool {
        self.chunk(chunk).groups().any(|g| {
            let group = self.chunk_group(g);
            group.is_entrypoint() && group.runtime_chunk() == Some(chunk)
        })
    }

    /// Chunks of the parent groups of every group containing `chunk`, never `chunk` itself
    pub fn chunk_parents(&self, chunk: ChunkIdx) -> BTreeSet<ChunkIdx> {
        self.chunk(chunk)
            .groups()
            .flat_map(|g| self.chunk_group(g).parents())
            .flat_map(|p| self.chunk_group(p).chunks().iter().copied())
            .filter(|&p| p != chunk)
            .collect()
    }

    /// Chunks of the child groups of every group containing `chunk`, never `chunk` itself
    pub fn chunk_children(&self, chunk: ChunkIdx) -> BTreeSet<ChunkIdx> {
        self.chunk(chunk)
            .groups()
            .flat_map(|g| self.chunk_group(g).children())
            .flat_map(|c| self.chunk_group(c).chunks().iter().copied())
            .filter(|&c| c != chunk)
            .collect()
    }

    /// Weighted size: module bytes, scaled for initial chunks, plus request overhead
    pub fn chunk_size(&self, chunk: ChunkIdx, options: &ChunkSizeOptions) -> usize {
        let modules_size = self.chunk(chunk).modules_size(self.module_graph());
        options.add_multiplier_and_overhead(modules_size, self.chunk_is_initial(chunk))
    }

    /// Size `chunk` would have after absorbing `other`, `None` when the merge is illegal
    pub fn chunk_integrated_size(
        &self,
        chunk: ChunkIdx,
        other: ChunkIdx,
        options: &ChunkSizeOptions,
    ) -> Option<usize> {
        if !self.can_be_integrated(chunk, other) {
            return None;
        }

        let graph = self.module_graph();
        let this = self.chunk(chunk);
        let mut integrated_modules_size = this.modules_size(graph);
        for &module in self.chunk(other).modules(graph) {
            if !this.contains_module(module) {
                integrated_modules_size += graph.module(module).size;
            }
        }

        Some(options.add_multiplier_and_overhead(integrated_modules_size, self.chunk_is_initial(chunk)))
    }

    /// Initial chunks are never absorbed, and an initial chunk only absorbs its own children
    pub fn can_be_integrated(&self, chunk: ChunkIdx, other: ChunkIdx) -> bool {
        if chunk == other || self.chunk(chunk).is_removed() || self.chunk(other).is_removed() {
            return false;
        }
        if self.chunk_is_initial(other) {
            return false;
        }
        if self.chunk_is_initial(chunk) {
            let parents = self.chunk_parents(other);
            if parents.len() != 1 || !parents.contains(&chunk) {
                return false;
            }
        }
        true
    }

    /// Move `module` from `from` to `to`, rewriting its reasons accordingly
    pub fn move_module(&mut self, module: ModuleIdx, from: ChunkIdx, to: ChunkIdx) {
        trace!(
            "Moving {} from chunk {} to chunk {}",
            self.module_graph().module(module).identifier,
            self.chunk(from).debug_id,
            self.chunk(to).debug_id
        );
        helpers::disconnect_chunk_and_module(self, from, module);
        helpers::connect_chunk_and_module(self, to, module);
        self.module_graph_mut()
            .module_mut(module)
            .rewrite_chunk_in_reasons(from, &[to]);
    }

    /// Merge `other` into `chunk`; `other` is removed afterwards.
    ///
    /// Returns `false` without touching the graph when the merge is illegal.
    pub fn integrate_chunks(&mut self, chunk: ChunkIdx, other: ChunkIdx, reason: &str) -> bool {
        if !self.can_be_integrated(chunk, other) {
            return false;
        }

        let modules = self.chunk(other).modules(self.module_graph()).to_vec();
        for module in modules {
            self.move_module(module, other, chunk);
        }

        let groups: Vec<_> = self.chunk(other).groups().collect();
        for group in groups {
            if self.chunk_group_mut(group).replace_chunk(other, chunk) {
                self.chunk_mut(chunk).add_group(group);
            }
            self.chunk_mut(other).remove_group(group);
        }

        let other_name = self.chunk(other).name.clone();
        let this = self.chunk_mut(chunk);
        if this.name.is_none() {
            this.name = other_name;
        }
        this.chunk_reason = Some(reason.to_string());

        self.remove_chunk(other, reason);
        true
    }

    /// Record in every owning group that `new_chunk` is split off `chunk`
    pub fn split_chunk(&mut self, chunk: ChunkIdx, new_chunk: ChunkIdx) {
        let groups: Vec<_> = self.chunk(chunk).groups().collect();
        for group in groups {
            helpers::insert_chunk_into_group(self, group, new_chunk, chunk);
        }
    }

    /// Detach the chunk from its modules and groups and drop it from the chunk list
    pub fn remove_chunk(&mut self, chunk: ChunkIdx, reason: &str) {
        debug!("Removing chunk {} ({})", self.chunk(chunk).debug_id, reason);

        let modules = self.chunk(chunk).modules(self.module_graph()).to_vec();
        for module in modules {
            helpers::disconnect_chunk_and_module(self, chunk, module);
        }

        let groups: Vec<_> = self.chunk(chunk).groups().collect();
        for group in groups {
            helpers::disconnect_chunk_group_and_chunk(self, group, chunk);
        }

        self.chunk_mut(chunk).removed = true;
        self.detach_chunk(chunk);
    }

    /// See [`Chunk::compare_to`]
    pub fn compare_chunks(&self, a: ChunkIdx, b: ChunkIdx) -> Ordering {
        self.chunk(a).compare_to(self.chunk(b), self.module_graph())
    }

    /// Largest number of chunks any group of `chunk` loads in one request
    pub fn chunk_requests(&self, chunk: ChunkIdx) -> usize {
        self.chunk(chunk)
            .groups()
            .map(|g| self.chunk_group(g).chunks().len())
            .max()
            .unwrap_or(0)
    }
}
