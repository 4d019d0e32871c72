//! The compilation: arenas for modules, chunks and chunk groups

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::{
    helpers, BlockOrigin, Chunk, ChunkGroup, ChunkGroupIdx, ChunkGroupKind, ChunkId, ChunkIdx,
    ModuleGraph, ModuleIdx, Records,
};
use crate::utils::make_paths_relative;

/// Length of the hash shown in output names
pub const RENDERED_HASH_LENGTH: usize = 20;

/// Owns the module graph and the chunk graph built from it
#[derive(Debug)]
pub struct Compilation {
    /// Project root, used to make record identifiers portable
    context: PathBuf,

    module_graph: ModuleGraph,

    chunk_arena: Vec<Chunk>,
    chunk_group_arena: Vec<ChunkGroup>,

    /// Live chunks in creation order
    chunks: Vec<ChunkIdx>,

    /// Live chunk groups in creation order
    chunk_groups: Vec<ChunkGroupIdx>,

    entrypoints: BTreeMap<String, ChunkGroupIdx>,

    /// Persisted state carried between builds
    pub records: Records,

    next_chunk_debug_id: u32,
    next_group_debug_id: u32,
}

impl Compilation {
    pub fn new(module_graph: ModuleGraph) -> Self {
        Self {
            context: PathBuf::from("."),
            module_graph,
            chunk_arena: Vec::new(),
            chunk_group_arena: Vec::new(),
            chunks: Vec::new(),
            chunk_groups: Vec::new(),
            entrypoints: BTreeMap::new(),
            records: Records::default(),
            next_chunk_debug_id: 0,
            next_group_debug_id: 0,
        }
    }

    pub fn with_context(mut self, context: impl Into<PathBuf>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_records(mut self, records: Records) -> Self {
        self.records = records;
        self
    }

    pub fn context(&self) -> &Path {
        &self.context
    }

    pub fn module_graph(&self) -> &ModuleGraph {
        &self.module_graph
    }

    pub fn module_graph_mut(&mut self) -> &mut ModuleGraph {
        &mut self.module_graph
    }

    /// Module identifier relative to the project context
    pub fn relative_identifier(&self, module: ModuleIdx) -> String {
        make_paths_relative(&self.context, &self.module_graph.module(module).identifier)
    }

    pub fn chunk(&self, idx: ChunkIdx) -> &Chunk {
        &self.chunk_arena[idx.0]
    }

    pub fn chunk_mut(&mut self, idx: ChunkIdx) -> &mut Chunk {
        &mut self.chunk_arena[idx.0]
    }

    pub fn chunk_group(&self, idx: ChunkGroupIdx) -> &ChunkGroup {
        &self.chunk_group_arena[idx.0]
    }

    pub fn chunk_group_mut(&mut self, idx: ChunkGroupIdx) -> &mut ChunkGroup {
        &mut self.chunk_group_arena[idx.0]
    }

    /// Live chunks in creation order
    pub fn chunks(&self) -> &[ChunkIdx] {
        &self.chunks
    }

    pub fn chunk_groups(&self) -> &[ChunkGroupIdx] {
        &self.chunk_groups
    }

    pub fn entrypoints(&self) -> &BTreeMap<String, ChunkGroupIdx> {
        &self.entrypoints
    }

    pub fn entrypoint(&self, name: &str) -> Option<ChunkGroupIdx> {
        self.entrypoints.get(name).copied()
    }

    pub fn named_chunk(&self, name: &str) -> Option<ChunkIdx> {
        self.chunks
            .iter()
            .copied()
            .find(|&c| self.chunk(c).name.as_deref() == Some(name))
    }

    /// Create a chunk, or return the live chunk already carrying `name`
    pub fn add_chunk(&mut self, name: Option<String>) -> ChunkIdx {
        if let Some(existing) = name.as_deref().and_then(|n| self.named_chunk(n)) {
            return existing;
        }

        let idx = ChunkIdx(self.chunk_arena.len());
        self.chunk_arena.push(Chunk::new(name, self.next_chunk_debug_id));
        self.next_chunk_debug_id += 1;
        self.chunks.push(idx);
        idx
    }

    pub fn add_chunk_group(&mut self, name: Option<String>, kind: ChunkGroupKind) -> ChunkGroupIdx {
        let idx = ChunkGroupIdx(self.chunk_group_arena.len());
        self.chunk_group_arena
            .push(ChunkGroup::new(name, kind, self.next_group_debug_id));
        self.next_group_debug_id += 1;
        self.chunk_groups.push(idx);
        idx
    }

    /// Create the entrypoint group for the named entry
    pub fn add_entrypoint(&mut self, name: impl Into<String>) -> ChunkGroupIdx {
        let name = name.into();
        let group = self.add_chunk_group(
            Some(name.clone()),
            ChunkGroupKind::Entrypoint { runtime_chunk: None },
        );
        self.entrypoints.insert(name, group);
        group
    }

    /// Delete the named entrypoint and detach its group from the graph
    pub fn remove_entrypoint(&mut self, name: &str) -> Option<ChunkGroupIdx> {
        let group = self.entrypoints.remove(name)?;
        self.remove_chunk_group(group);
        Some(group)
    }

    pub(crate) fn detach_chunk(&mut self, chunk: ChunkIdx) {
        self.chunks.retain(|&c| c != chunk);
    }

    pub(crate) fn detach_chunk_group(&mut self, group: ChunkGroupIdx) {
        self.chunk_groups.retain(|&g| g != group);
    }

    /// Build the initial chunk graph from the module graph's entries.
    ///
    /// Every entry gets a chunk and an entrypoint; statically reachable
    /// modules join the chunk of the group they are reached from and every
    /// async block opens a child group with a chunk of its own.
    pub fn build_chunk_graph(&mut self) {
        let entries = self.module_graph.entries().to_vec();
        let mut block_groups: HashMap<usize, (ChunkGroupIdx, ChunkIdx)> = HashMap::new();
        let mut named_groups: HashMap<String, (ChunkGroupIdx, ChunkIdx)> = HashMap::new();
        let mut queue = VecDeque::new();

        for (name, module) in entries {
            let chunk = self.add_chunk(Some(name.clone()));
            let group = self.add_entrypoint(name.clone());
            helpers::connect_chunk_group_and_chunk(self, group, chunk);
            let request = self.module_graph.module(module).identifier.clone();
            let entrypoint = self.chunk_group_mut(group);
            entrypoint.set_runtime_chunk(chunk);
            entrypoint.add_origin(BlockOrigin {
                module: None,
                loc: None,
                request: Some(request),
            });
            self.chunk_mut(chunk).entry_module = Some(module);

            if helpers::connect_chunk_and_module(self, chunk, module) {
                queue.push_back((module, chunk, group));
            }
            self.module_graph.module_mut(module).add_reason(None, chunk);
            debug!("Entry {} starts chunk {}", name, self.chunk(chunk).debug_id);
        }

        while let Some((module, chunk, group)) = queue.pop_front() {
            for dep in self.module_graph.get_dependencies(module).to_vec() {
                if helpers::connect_chunk_and_module(self, chunk, dep) {
                    queue.push_back((dep, chunk, group));
                }
                self.module_graph.module_mut(dep).add_reason(Some(module), chunk);
            }

            let blocks: Vec<_> = self
                .module_graph
                .blocks_of(module)
                .map(|(idx, block)| (idx, block.clone()))
                .collect();
            for (block_idx, block) in blocks {
                let known = block_groups.get(&block_idx).copied().or_else(|| {
                    block
                        .chunk_name
                        .as_ref()
                        .and_then(|name| named_groups.get(name).copied())
                });
                let (child_group, child_chunk) = match known {
                    Some(existing) => existing,
                    None => {
                        let child_group =
                            self.add_chunk_group(block.chunk_name.clone(), ChunkGroupKind::Normal);
                        let child_chunk = self.add_chunk(block.chunk_name.clone());
                        helpers::connect_chunk_group_and_chunk(self, child_group, child_chunk);
                        if let Some(name) = &block.chunk_name {
                            named_groups.insert(name.clone(), (child_group, child_chunk));
                        }
                        trace!(
                            "Async block {} opens chunk group {}",
                            block_idx,
                            self.chunk_group(child_group).debug_id
                        );
                        (child_group, child_chunk)
                    }
                };
                block_groups.insert(block_idx, (child_group, child_chunk));

                let request = self.module_graph.module(block.target).identifier.clone();
                let child = self.chunk_group_mut(child_group);
                if child.add_block(block_idx) {
                    child.add_origin(BlockOrigin {
                        module: Some(block.importer),
                        loc: block.loc.clone(),
                        request: Some(request),
                    });
                }
                if child_group != group {
                    helpers::connect_chunk_groups(self, group, child_group);
                }

                if helpers::connect_chunk_and_module(self, child_chunk, block.target) {
                    queue.push_back((block.target, child_chunk, child_group));
                }
                self.module_graph
                    .module_mut(block.target)
                    .add_reason(Some(module), child_chunk);
            }
        }
    }

    /// Throw away the chunk graph so the next seal starts from scratch
    pub fn unseal(&mut self) {
        debug!("Unsealing compilation");
        self.chunk_arena.clear();
        self.chunk_group_arena.clear();
        self.chunks.clear();
        self.chunk_groups.clear();
        self.entrypoints.clear();
        self.next_chunk_debug_id = 0;
        self.next_group_debug_id = 0;
        self.module_graph.clear_chunk_memberships();
    }

    /// Module ids follow identifier order; chunk ids follow the chunk list,
    /// skipping ids already taken (for instance replayed from records)
    pub fn assign_ids(&mut self) {
        let mut modules: Vec<_> = self.module_graph.module_indices().collect();
        modules.sort_by(|a, b| {
            self.module_graph
                .module(*a)
                .identifier
                .cmp(&self.module_graph.module(*b).identifier)
        });
        for (id, module) in modules.into_iter().enumerate() {
            self.module_graph.module_mut(module).id = Some(id);
        }

        let mut used: BTreeSet<ChunkId> = self
            .chunks
            .iter()
            .filter_map(|&c| self.chunk(c).id.clone())
            .collect();
        let mut next_id = 0u64;
        for chunk in self.chunks.clone() {
            if self.chunk(chunk).id.is_none() {
                while used.contains(&ChunkId::Number(next_id)) {
                    next_id += 1;
                }
                used.insert(ChunkId::Number(next_id));
                self.chunk_mut(chunk).id = Some(ChunkId::Number(next_id));
            }
            let id = self.chunk(chunk).id.clone();
            self.chunk_mut(chunk).ids = id.map(|id| vec![id]);
        }
    }

    /// Hash every live chunk from its ids, name and module hashes
    pub fn create_hash(&mut self) {
        for chunk in self.chunks.clone() {
            let mut hasher = Sha256::new();
            self.chunk(chunk).update_hash(&mut hasher, &self.module_graph);
            let hash = hex::encode(hasher.finalize());
            let rendered = hash[..RENDERED_HASH_LENGTH].to_string();

            let chunk = self.chunk_mut(chunk);
            chunk.hash = Some(hash);
            chunk.rendered_hash = Some(rendered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::Module;
    use pretty_assertions::assert_eq;

    fn identifiers(compilation: &Compilation, chunk: ChunkIdx) -> Vec<&str> {
        compilation
            .chunk(chunk)
            .modules(compilation.module_graph())
            .iter()
            .map(|m| compilation.module_graph().module(*m).identifier.as_str())
            .collect()
    }

    fn sample_graph() -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(Module::new("/app/index.js", 10));
        let util = graph.add_module(Module::new("/app/util.js", 20));
        let page = graph.add_module(Module::new("/app/page.js", 30));
        let widget = graph.add_module(Module::new("/app/widget.js", 40));
        graph.add_dependency(index, util);
        graph.add_dependency(page, util);
        graph.add_dependency(page, widget);
        graph.add_async_dependency(index, page, Some("page".into()));
        // Lazy cycle back into the importer
        graph.add_async_dependency(page, index, None);
        graph.add_entry("main", index).unwrap();
        graph
    }

    #[test]
    fn test_build_chunk_graph() {
        let mut compilation = Compilation::new(sample_graph());
        compilation.build_chunk_graph();

        let entrypoint = compilation.entrypoint("main").unwrap();
        let main = compilation.chunk_group(entrypoint).chunks()[0];
        assert_eq!(compilation.chunk(main).name.as_deref(), Some("main"));
        assert!(compilation.chunk(main).has_entry_module());
        assert!(compilation.chunk_has_runtime(main));
        assert_eq!(identifiers(&compilation, main), vec!["/app/index.js", "/app/util.js"]);

        let page = compilation.named_chunk("page").unwrap();
        assert!(!compilation.chunk_is_initial(page));
        assert_eq!(
            identifiers(&compilation, page),
            vec!["/app/page.js", "/app/util.js", "/app/widget.js"]
        );

        // The lazy import of the entry module opens a third group, which
        // loads the page group again
        assert_eq!(compilation.chunks().len(), 3);
        assert_eq!(compilation.chunk_groups().len(), 3);
        let lazy_index = compilation.chunks()[2];
        assert_eq!(identifiers(&compilation, lazy_index), vec!["/app/index.js", "/app/util.js"]);
        assert_eq!(
            compilation.chunk_parents(page).into_iter().collect::<Vec<_>>(),
            vec![main, lazy_index]
        );

        let util = compilation.module_graph().get_module_idx("/app/util.js").unwrap();
        assert_eq!(compilation.module_graph().module(util).number_of_chunks(), 3);
    }

    #[test]
    fn test_add_chunk_reuses_named_chunk() {
        let mut compilation = Compilation::new(ModuleGraph::new());
        let first = compilation.add_chunk(Some("vendors".into()));
        assert_eq!(compilation.add_chunk(Some("vendors".into())), first);
        assert_ne!(compilation.add_chunk(None), compilation.add_chunk(None));
        assert_eq!(compilation.chunks().len(), 3);
    }

    #[test]
    fn test_assign_ids_skips_taken_ids() {
        let mut compilation = Compilation::new(sample_graph());
        compilation.build_chunk_graph();
        let chunks = compilation.chunks().to_vec();
        compilation.chunk_mut(chunks[1]).id = Some(ChunkId::Number(0));

        compilation.assign_ids();

        let ids: Vec<_> = chunks
            .iter()
            .map(|c| compilation.chunk(*c).id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec![ChunkId::Number(1), ChunkId::Number(0), ChunkId::Number(2)]);
        assert_eq!(
            compilation.chunk(chunks[0]).ids,
            Some(vec![ChunkId::Number(1)])
        );

        let index = compilation.module_graph().get_module_idx("/app/index.js").unwrap();
        let widget = compilation.module_graph().get_module_idx("/app/widget.js").unwrap();
        assert_eq!(compilation.module_graph().module(index).id, Some(0));
        assert_eq!(compilation.module_graph().module(widget).id, Some(3));
    }

    #[test]
    fn test_create_hash_renders_prefix() {
        let mut compilation = Compilation::new(sample_graph());
        compilation.build_chunk_graph();
        compilation.assign_ids();
        compilation.create_hash();

        for &chunk in compilation.chunks() {
            let chunk = compilation.chunk(chunk);
            let hash = chunk.hash.as_ref().unwrap();
            assert_eq!(hash.len(), 64);
            assert_eq!(chunk.rendered_hash.as_deref(), Some(&hash[..RENDERED_HASH_LENGTH]));
        }
    }

    #[test]
    fn test_unseal_clears_chunk_graph() {
        let mut compilation = Compilation::new(sample_graph());
        compilation.build_chunk_graph();
        compilation.unseal();

        assert!(compilation.chunks().is_empty());
        assert!(compilation.entrypoints().is_empty());
        assert!(compilation
            .module_graph()
            .modules()
            .all(|(_, m)| m.number_of_chunks() == 0 && m.reasons().is_empty()));

        compilation.build_chunk_graph();
        assert_eq!(compilation.chunks().len(), 3);
    }

    #[test]
    fn test_relative_identifier() {
        let mut graph = ModuleGraph::new();
        let m = graph.add_module(Module::new("/project/src/a.js", 1));
        let compilation = Compilation::new(graph).with_context("/project");
        assert_eq!(compilation.relative_identifier(m), "./src/a.js");
    }

    #[test]
    fn test_remove_entrypoint() {
        let mut compilation = Compilation::new(sample_graph());
        compilation.build_chunk_graph();
        let main = compilation.named_chunk("main").unwrap();

        let removed = compilation.remove_entrypoint("main").unwrap();

        assert!(compilation.entrypoint("main").is_none());
        assert!(compilation.chunk_group(removed).is_removed());
        assert!(!compilation.chunk_is_initial(main));
        assert!(compilation.remove_entrypoint("main").is_none());
    }
}
