//! Module graph data structures
//!
//! Modules are owned here; chunks only hold [`ModuleIdx`] handles into this
//! arena, and every module keeps the mirror set of chunks it belongs to.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use super::{ChunkIdx, Compilation};
use crate::error::{Error, Result};
use crate::utils::hash_content;

/// Index of a module in the [`ModuleGraph`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleIdx(pub(crate) usize);

impl ModuleIdx {
    pub fn index(self) -> usize {
        self.0
    }
}

pub type ChunkConditionFn = Arc<dyn Fn(&Compilation, ChunkIdx) -> bool + Send + Sync>;

/// Placement predicate a module imposes on the chunks that may contain it
#[derive(Clone)]
pub enum ChunkCondition {
    /// Must live in a chunk loaded synchronously by an entrypoint
    Initial,
    /// Must live in an on-demand chunk
    Async,
    Custom(ChunkConditionFn),
}

impl ChunkCondition {
    pub fn is_satisfied_by(&self, compilation: &Compilation, chunk: ChunkIdx) -> bool {
        match self {
            ChunkCondition::Initial => compilation.chunk_is_initial(chunk),
            ChunkCondition::Async => !compilation.chunk_is_initial(chunk),
            ChunkCondition::Custom(condition) => condition(compilation, chunk),
        }
    }
}

impl fmt::Debug for ChunkCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkCondition::Initial => f.write_str("Initial"),
            ChunkCondition::Async => f.write_str("Async"),
            ChunkCondition::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Why a module is part of some chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReason {
    /// Importing module, `None` for entries
    pub origin: Option<ModuleIdx>,
    /// Chunks in which this reason applies
    pub chunks: Vec<ChunkIdx>,
}

impl ModuleReason {
    fn rewrite_chunks(&mut self, old_chunk: ChunkIdx, new_chunks: &[ChunkIdx]) {
        if let Some(position) = self.chunks.iter().position(|&c| c == old_chunk) {
            self.chunks.remove(position);
            for &chunk in new_chunks {
                if !self.chunks.contains(&chunk) {
                    self.chunks.push(chunk);
                }
            }
        }
    }
}

/// A module in the dependency graph
#[derive(Debug, Clone)]
pub struct Module {
    /// Stable identifier, the comparison key for every deterministic order
    pub identifier: String,

    /// Size in bytes
    pub size: usize,

    /// Content hash, fed into chunk hashes
    pub hash: String,

    /// Numeric id, assigned when the chunk graph is finalized
    pub id: Option<usize>,

    /// Name matched by cache-group tests
    pub name_for_condition: Option<String>,

    /// Placement predicate over candidate chunks
    pub chunk_condition: Option<ChunkCondition>,

    chunks: BTreeSet<ChunkIdx>,
    reasons: Vec<ModuleReason>,
}

impl Module {
    pub fn new(identifier: impl Into<String>, size: usize) -> Self {
        let identifier = identifier.into();
        let hash = hash_content(format!("{identifier}:{size}").as_bytes());
        Self {
            identifier,
            size,
            hash,
            id: None,
            name_for_condition: None,
            chunk_condition: None,
            chunks: BTreeSet::new(),
            reasons: Vec::new(),
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    pub fn with_name_for_condition(mut self, name: impl Into<String>) -> Self {
        self.name_for_condition = Some(name.into());
        self
    }

    pub fn with_chunk_condition(mut self, condition: ChunkCondition) -> Self {
        self.chunk_condition = Some(condition);
        self
    }

    /// Chunks containing this module, in creation order
    pub fn chunks(&self) -> impl Iterator<Item = ChunkIdx> + '_ {
        self.chunks.iter().copied()
    }

    pub fn number_of_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_in_chunk(&self, chunk: ChunkIdx) -> bool {
        self.chunks.contains(&chunk)
    }

    pub(crate) fn add_chunk(&mut self, chunk: ChunkIdx) -> bool {
        self.chunks.insert(chunk)
    }

    pub(crate) fn remove_chunk(&mut self, chunk: ChunkIdx) -> bool {
        self.chunks.remove(&chunk)
    }

    pub(crate) fn clear_chunks(&mut self) {
        self.chunks.clear();
        self.reasons.clear();
    }

    pub fn reasons(&self) -> &[ModuleReason] {
        &self.reasons
    }

    pub(crate) fn add_reason(&mut self, origin: Option<ModuleIdx>, chunk: ChunkIdx) {
        if let Some(reason) = self.reasons.iter_mut().find(|r| r.origin == origin) {
            if !reason.chunks.contains(&chunk) {
                reason.chunks.push(chunk);
            }
            return;
        }
        self.reasons.push(ModuleReason {
            origin,
            chunks: vec![chunk],
        });
    }

    /// Point every reason recorded against `old_chunk` at `new_chunks` instead
    pub fn rewrite_chunk_in_reasons(&mut self, old_chunk: ChunkIdx, new_chunks: &[ChunkIdx]) {
        for reason in &mut self.reasons {
            reason.rewrite_chunks(old_chunk, new_chunks);
        }
    }
}

/// A dynamic-import call site: `importer` loads `target` on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncBlock {
    pub importer: ModuleIdx,
    pub target: ModuleIdx,
    /// Requested chunk name, blocks sharing a name share one chunk group
    pub chunk_name: Option<String>,
    /// Source location of the call site
    pub loc: Option<String>,
}

/// The module dependency graph
#[derive(Debug, Default)]
pub struct ModuleGraph {
    /// All modules indexed by their index
    modules: Vec<Module>,

    /// Map from identifier to module index
    identifier_to_idx: HashMap<String, ModuleIdx>,

    /// Static dependency edges in declaration order
    edges: HashMap<ModuleIdx, Vec<ModuleIdx>>,

    /// Dynamic-import call sites
    blocks: Vec<AsyncBlock>,

    /// Named entries in declaration order
    entries: Vec<(String, ModuleIdx)>,
}

impl ModuleGraph {
    /// Create a new empty module graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module to the graph, returning the existing index for a known identifier
    pub fn add_module(&mut self, module: Module) -> ModuleIdx {
        if let Some(&idx) = self.identifier_to_idx.get(&module.identifier) {
            return idx;
        }

        let idx = ModuleIdx(self.modules.len());
        self.identifier_to_idx.insert(module.identifier.clone(), idx);
        self.modules.push(module);
        self.edges.insert(idx, Vec::new());

        idx
    }

    /// Add a static dependency edge between modules
    pub fn add_dependency(&mut self, from: ModuleIdx, to: ModuleIdx) {
        if let Some(deps) = self.edges.get_mut(&from) {
            if !deps.contains(&to) {
                deps.push(to);
            }
        }
    }

    /// Add a dynamic-import call site
    pub fn add_async_dependency(
        &mut self,
        importer: ModuleIdx,
        target: ModuleIdx,
        chunk_name: Option<String>,
    ) -> usize {
        let loc = Some(format!("{}:{}", self.module(importer).identifier, self.blocks.len()));
        self.blocks.push(AsyncBlock {
            importer,
            target,
            chunk_name,
            loc,
        });
        self.blocks.len() - 1
    }

    /// Register a named entry
    pub fn add_entry(&mut self, name: impl Into<String>, module: ModuleIdx) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|(existing, _)| *existing == name) {
            return Err(Error::DuplicateEntry(name));
        }
        self.entries.push((name, module));
        Ok(())
    }

    /// Get module index from identifier
    pub fn get_module_idx(&self, identifier: &str) -> Option<ModuleIdx> {
        self.identifier_to_idx.get(identifier).copied()
    }

    pub fn module(&self, idx: ModuleIdx) -> &Module {
        &self.modules[idx.0]
    }

    pub fn module_mut(&mut self, idx: ModuleIdx) -> &mut Module {
        &mut self.modules[idx.0]
    }

    /// All modules with their indices, in insertion order
    pub fn modules(&self) -> impl Iterator<Item = (ModuleIdx, &Module)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(idx, module)| (ModuleIdx(idx), module))
    }

    pub fn module_indices(&self) -> impl Iterator<Item = ModuleIdx> {
        (0..self.modules.len()).map(ModuleIdx)
    }

    /// Get direct static dependencies of a module
    pub fn get_dependencies(&self, idx: ModuleIdx) -> &[ModuleIdx] {
        self.edges.get(&idx).map(Vec::as_slice).unwrap_or_default()
    }

    /// Dynamic-import call sites located in `importer`, with their block indices
    pub fn blocks_of(&self, importer: ModuleIdx) -> impl Iterator<Item = (usize, &AsyncBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter(move |(_, block)| block.importer == importer)
    }

    pub fn entries(&self) -> &[(String, ModuleIdx)] {
        &self.entries
    }

    /// Whether some entry starts at `module`
    pub fn is_entry_module(&self, module: ModuleIdx) -> bool {
        self.entries.iter().any(|(_, m)| *m == module)
    }

    pub(crate) fn clear_chunk_memberships(&mut self) {
        for module in &mut self.modules {
            module.clear_chunks();
        }
    }

    /// Total number of modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Check if graph is empty
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Build a module graph from a deserialized description
    pub fn from_description(description: GraphDescription) -> Result<Self> {
        let mut graph = Self::new();

        for desc in &description.modules {
            let mut module = Module::new(desc.identifier.clone(), desc.size);
            if let Some(hash) = &desc.hash {
                module = module.with_hash(hash.clone());
            }
            if let Some(name) = &desc.name_for_condition {
                module = module.with_name_for_condition(name.clone());
            }
            module.chunk_condition = desc.chunk_condition.map(ChunkCondition::from);
            graph.add_module(module);
        }

        let lookup = |graph: &Self, identifier: &str| {
            graph
                .get_module_idx(identifier)
                .ok_or_else(|| Error::UnknownModule(identifier.to_string()))
        };

        for desc in &description.modules {
            let from = lookup(&graph, &desc.identifier)?;
            for dep in &desc.dependencies {
                let to = lookup(&graph, dep)?;
                graph.add_dependency(from, to);
            }
            for dep in &desc.async_dependencies {
                let to = lookup(&graph, &dep.module)?;
                graph.add_async_dependency(from, to, dep.chunk_name.clone());
            }
        }

        for entry in description.entries {
            let module = lookup(&graph, &entry.module)?;
            graph.add_entry(entry.name, module)?;
        }

        Ok(graph)
    }
}

/// Serialized form of a module graph, as produced by the module resolution layer
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDescription {
    pub modules: Vec<ModuleDescription>,

    #[serde(default)]
    pub entries: Vec<EntryDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDescription {
    pub identifier: String,

    pub size: usize,

    #[serde(default)]
    pub hash: Option<String>,

    #[serde(default)]
    pub name_for_condition: Option<String>,

    #[serde(default)]
    pub chunk_condition: Option<ChunkConditionKind>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub async_dependencies: Vec<AsyncDependencyDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncDependencyDescription {
    pub module: String,

    #[serde(default)]
    pub chunk_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryDescription {
    pub name: String,
    pub module: String,
}

/// Serializable subset of [`ChunkCondition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkConditionKind {
    Initial,
    Async,
}

impl From<ChunkConditionKind> for ChunkCondition {
    fn from(kind: ChunkConditionKind) -> Self {
        match kind {
            ChunkConditionKind::Initial => ChunkCondition::Initial,
            ChunkConditionKind::Async => ChunkCondition::Async,
        }
    }
}
