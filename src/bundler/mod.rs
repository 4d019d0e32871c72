//! Chunk graph core and the seal driver
//!
//! The [`Compilation`] owns the module graph and the chunk graph built from
//! it; the [`Bundler`] seals a compilation by running the registered
//! optimization passes to a fixpoint.

mod chunk;
mod chunk_group;
mod compilation;
mod entrypoint;
mod graph;
pub mod helpers;
mod records;

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::optimize::{OptimizeHook, PassManager};

pub use chunk::{
    Chunk, ChunkId, ChunkIdx, ChunkSizeOptions, DEFAULT_CHUNK_OVERHEAD,
    DEFAULT_ENTRY_CHUNK_MULTIPLICATOR,
};
pub use chunk_group::{BlockOrigin, ChunkGroup, ChunkGroupIdx, ChunkGroupKind};
pub use compilation::{Compilation, RENDERED_HASH_LENGTH};
pub use entrypoint::{ChunkMaps, ChunkModuleMaps};
pub use graph::{
    AsyncBlock, AsyncDependencyDescription, ChunkCondition, ChunkConditionFn, ChunkConditionKind,
    EntryDescription, GraphDescription, Module, ModuleDescription, ModuleGraph, ModuleIdx, ModuleReason,
};
pub use records::{Records, SplitRecord};

/// Upper bound on seals of one compilation
pub const MAX_SEALS: usize = 16;

/// Result of sealing a compilation
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    /// Live chunks in chunk-list order
    pub chunks: Vec<ChunkSummary>,

    /// Entrypoint name → ids of its chunks, in load order
    pub entrypoints: BTreeMap<String, Vec<ChunkId>>,

    /// Entrypoint name → hashes and names of the chunks it loads on demand
    pub chunk_maps: BTreeMap<String, ChunkMaps>,

    /// Number of seals it took to reach a stable chunk graph
    pub seals: usize,
}

/// Summary of one output chunk
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub id: Option<ChunkId>,
    pub name: Option<String>,
    pub initial: bool,
    pub entry: bool,
    /// Total size of the chunk's modules
    pub size: usize,
    pub hash: Option<String>,
    pub reason: Option<String>,
    /// Module identifiers, sorted
    pub modules: Vec<String>,
}

impl BuildResult {
    fn from_compilation(compilation: &Compilation, seals: usize) -> Self {
        let graph = compilation.module_graph();
        let chunks = compilation
            .chunks()
            .iter()
            .map(|&idx| {
                let chunk = compilation.chunk(idx);
                ChunkSummary {
                    id: chunk.id.clone(),
                    name: chunk.name.clone(),
                    initial: compilation.chunk_is_initial(idx),
                    entry: chunk.has_entry_module(),
                    size: chunk.modules_size(graph),
                    hash: chunk.rendered_hash.clone(),
                    reason: chunk.chunk_reason.clone(),
                    modules: chunk
                        .modules(graph)
                        .iter()
                        .map(|&m| graph.module(m).identifier.clone())
                        .collect(),
                }
            })
            .collect();

        let entrypoints = compilation
            .entrypoints()
            .iter()
            .map(|(name, &group)| {
                let ids = compilation
                    .chunk_group(group)
                    .chunks()
                    .iter()
                    .filter_map(|&c| compilation.chunk(c).id.clone())
                    .collect();
                (name.clone(), ids)
            })
            .collect();

        let chunk_maps = compilation
            .entrypoints()
            .iter()
            .map(|(name, &group)| (name.clone(), compilation.get_chunk_maps(group, false, false)))
            .collect();

        Self {
            chunks,
            entrypoints,
            chunk_maps,
            seals,
        }
    }

    /// Total size of all chunks
    pub fn total_size(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

/// Seals compilations with a fixed set of optimization passes
#[derive(Debug, Default)]
pub struct Bundler {
    passes: PassManager,
}

impl Bundler {
    pub fn new(passes: PassManager) -> Self {
        Self { passes }
    }

    /// Create a bundler running the passes enabled in the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.optimization.pass_manager()?))
    }

    pub fn passes(&self) -> &PassManager {
        &self.passes
    }

    /// Build, optimize, id and hash the chunk graph, sealing again for as
    /// long as a pass asks for it, at most [`MAX_SEALS`] times
    pub fn seal(&mut self, compilation: &mut Compilation) -> Result<BuildResult> {
        let start = Instant::now();
        let mut seals = 0;

        loop {
            seals += 1;
            debug!("Seal #{}", seals);

            compilation.build_chunk_graph();
            self.optimize(compilation)?;
            compilation.assign_ids();
            compilation.create_hash();

            let mut records = std::mem::take(&mut compilation.records);
            let recorded = self.passes.record_hash(compilation, &mut records);
            compilation.records = records;
            recorded?;

            let Some(pass) = self.passes.need_additional_seal(compilation).map(str::to_owned) else {
                break;
            };
            if seals >= MAX_SEALS {
                return Err(Error::SealLimitExceeded { seals, pass });
            }
            debug!("{} requested an additional seal", pass);
            compilation.unseal();
            self.passes.unseal();
        }

        info!(
            "Sealed {} chunks in {} seal(s), {:?}",
            compilation.chunks().len(),
            seals,
            start.elapsed()
        );
        Ok(BuildResult::from_compilation(compilation, seals))
    }

    fn optimize(&mut self, compilation: &mut Compilation) -> Result<()> {
        // Basic tier: both basic hooks restart together
        loop {
            let changed = self.passes.call_bail(OptimizeHook::ChunksBasic, compilation)?
                || self
                    .passes
                    .call_bail(OptimizeHook::ExtractedChunksBasic, compilation)?;
            if !changed {
                break;
            }
        }

        while self.passes.call_bail(OptimizeHook::ChunksAdvanced, compilation)? {}
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::{
        AggressiveSplittingOptions, AggressiveSplittingPass, EnsureChunkConditionsPass, OptimizePass,
        RemoveEmptyChunksPass, SplitChunksOptions, SplitChunksPass,
    };
    use pretty_assertions::assert_eq;

    /// `index` statically imports a, b, c and d
    fn flat_graph() -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(Module::new("index", 1));
        for id in ["a", "b", "c", "d"] {
            let m = graph.add_module(Module::new(id, 2));
            graph.add_dependency(index, m);
        }
        graph.add_entry("main", index).unwrap();
        graph
    }

    /// Two entries sharing a vendor module, one of them with a lazy page
    fn app_graph() -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        let home = graph.add_module(Module::new("home", 10));
        let admin = graph.add_module(Module::new("admin", 10));
        let vendor = graph.add_module(Module::new("vendor", 500));
        let page = graph.add_module(Module::new("page", 50));
        graph.add_dependency(home, vendor);
        graph.add_dependency(admin, vendor);
        graph.add_async_dependency(home, page, Some("page".into()));
        graph.add_entry("home", home).unwrap();
        graph.add_entry("admin", admin).unwrap();
        graph
    }

    /// `index` lazily loads `big`, which statically imports `small`
    fn oversized_graph() -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(Module::new("index", 1));
        let big = graph.add_module(Module::new("big", 10));
        let small = graph.add_module(Module::new("small", 1));
        graph.add_async_dependency(index, big, Some("lazy".into()));
        graph.add_dependency(big, small);
        graph.add_entry("main", index).unwrap();
        graph
    }

    fn window_bundler(min_size: usize, max_size: usize) -> Bundler {
        let mut passes = PassManager::new();
        passes.register(Box::new(
            AggressiveSplittingPass::new(AggressiveSplittingOptions {
                min_size,
                max_size,
                chunk_overhead: 0,
                entry_chunk_multiplicator: 1,
            })
            .unwrap(),
        ));
        passes.register(Box::new(RemoveEmptyChunksPass::new()));
        Bundler::new(passes)
    }

    fn aggressive_bundler() -> Bundler {
        window_bundler(2, 4)
    }

    /// Always wants another seal
    struct Restless;

    impl OptimizePass for Restless {
        fn name(&self) -> &str {
            "restless"
        }

        fn need_additional_seal(&self, _compilation: &Compilation) -> bool {
            true
        }
    }

    fn full_bundler() -> Bundler {
        let mut passes = PassManager::new();
        passes.register(Box::new(EnsureChunkConditionsPass::new()));
        passes.register(Box::new(
            SplitChunksPass::new(SplitChunksOptions {
                min_size: 0,
                ..SplitChunksOptions::default()
            })
            .unwrap(),
        ));
        passes.register(Box::new(RemoveEmptyChunksPass::new()));
        Bundler::new(passes)
    }

    fn partition(result: &BuildResult) -> Vec<Vec<String>> {
        let mut modules: Vec<Vec<String>> = result.chunks.iter().map(|c| c.modules.clone()).collect();
        modules.sort();
        modules
    }

    #[test]
    fn test_seal_is_deterministic() {
        let mut first = Compilation::new(app_graph());
        let mut second = Compilation::new(app_graph());

        let a = full_bundler().seal(&mut first).unwrap();
        let b = full_bundler().seal(&mut second).unwrap();

        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert_eq!(
            partition(&a),
            vec![
                vec!["admin".to_string()],
                vec!["home".to_string()],
                vec!["page".to_string()],
                vec!["vendor".to_string()],
            ]
        );
        test_utils::assert_membership_consistent(&first);
    }

    #[test]
    fn test_seal_summarizes_entrypoints() {
        let mut compilation = Compilation::new(app_graph());
        let result = full_bundler().seal(&mut compilation).unwrap();

        assert_eq!(result.seals, 1);
        assert_eq!(result.entrypoints.len(), 2);
        for ids in result.entrypoints.values() {
            // The shared vendor chunk comes with each entry chunk
            assert_eq!(ids.len(), 2);
        }
        let vendor = result
            .chunks
            .iter()
            .find(|c| c.modules == ["vendor"])
            .unwrap();
        assert!(vendor.initial);
        assert!(!vendor.entry);
        assert_eq!(vendor.reason.as_deref(), Some("split chunk"));
        assert_eq!(vendor.hash.as_ref().map(String::len), Some(RENDERED_HASH_LENGTH));
        assert_eq!(result.total_size(), 570);
    }

    #[test]
    fn test_recorded_splits_are_replayed() {
        let mut first = Compilation::new(flat_graph());
        let result = aggressive_bundler().seal(&mut first).unwrap();
        assert_eq!(result.seals, 1);
        assert_eq!(
            partition(&result),
            vec![vec!["a", "b"], vec!["c"], vec!["d", "index"]]
        );
        assert!(result.chunks.iter().all(|c| (2..=4).contains(&c.size)));
        assert_eq!(first.records.aggressive_splits.len(), 2);

        let records = first.records.clone();
        let mut second = Compilation::new(flat_graph()).with_records(records.clone());
        let replayed = aggressive_bundler().seal(&mut second).unwrap();

        assert_eq!(replayed.seals, 1);
        assert_eq!(partition(&replayed), partition(&result));
        let ids = |r: &BuildResult| {
            let mut ids: Vec<(Option<ChunkId>, Vec<String>)> =
                r.chunks.iter().map(|c| (c.id.clone(), c.modules.clone())).collect();
            ids.sort();
            ids
        };
        assert_eq!(ids(&replayed), ids(&result));
        assert_eq!(second.records, records);
    }

    #[test]
    fn test_single_oversized_module_keeps_its_own_chunk() {
        let mut compilation = Compilation::new(oversized_graph());
        let result = window_bundler(1, 5).seal(&mut compilation).unwrap();

        assert_eq!(result.seals, 1);
        assert_eq!(partition(&result), vec![vec!["big"], vec!["index"], vec!["small"]]);
        let big = result.chunks.iter().find(|c| c.modules == ["big"]).unwrap();
        assert_eq!(big.size, 10);
        assert!(!big.initial);
        assert_eq!(big.reason.as_deref(), Some("aggressive-splitting"));
        assert!(result.chunks.iter().filter(|c| c.size != 10).all(|c| c.size == 1));

        // Both on-demand chunks show up in the entrypoint's chunk maps
        assert_eq!(result.chunk_maps["main"].hash.len(), 2);
        assert_eq!(
            result.chunk_maps["main"].name.values().collect::<Vec<_>>(),
            vec!["lazy"]
        );
        test_utils::assert_membership_consistent(&compilation);
    }

    #[test]
    fn test_seal_gives_up_on_restless_pass() {
        let mut passes = PassManager::new();
        passes.register(Box::new(Restless));
        let mut compilation = Compilation::new(flat_graph());

        let err = Bundler::new(passes).seal(&mut compilation).unwrap_err();

        match err {
            Error::SealLimitExceeded { seals, pass } => {
                assert_eq!(seals, MAX_SEALS);
                assert_eq!(pass, "restless");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stale_record_triggers_additional_seal() {
        let mut records = Records::default();
        records.aggressive_splits.push(SplitRecord {
            hash: Some("stale".into()),
            id: Some(ChunkId::Number(7)),
            ..SplitRecord::new(vec!["a".into(), "b".into()])
        });
        let mut compilation = Compilation::new(flat_graph()).with_records(records);

        let result = aggressive_bundler().seal(&mut compilation).unwrap();

        assert_eq!(result.seals, 2);
        assert_eq!(
            partition(&result),
            vec![vec!["a", "b"], vec!["c"], vec!["d", "index"]]
        );
        assert!(result.chunks.iter().all(|c| c.id != Some(ChunkId::Number(7))));
        assert!(compilation
            .records
            .aggressive_splits
            .iter()
            .all(|split| split.hash.as_deref() != Some("stale")));
        test_utils::assert_membership_consistent(&compilation);
    }

    #[test]
    fn test_unsatisfiable_condition_fails_the_seal() {
        let mut graph = ModuleGraph::new();
        let index = graph.add_module(Module::new("index", 1));
        let lazy = graph.add_module(Module::new("lazy", 1).with_chunk_condition(ChunkCondition::Async));
        graph.add_dependency(index, lazy);
        graph.add_entry("main", index).unwrap();
        let mut compilation = Compilation::new(graph);

        let err = full_bundler().seal(&mut compilation).unwrap_err();
        assert!(matches!(err, Error::UnsatisfiableChunkCondition { .. }));
    }

    #[test]
    fn test_empty_pass_list_keeps_initial_graph() {
        let mut compilation = Compilation::new(app_graph());
        let result = Bundler::default().seal(&mut compilation).unwrap();

        assert_eq!(
            partition(&result),
            vec![
                vec!["admin".to_string(), "vendor".to_string()],
                vec!["home".to_string(), "vendor".to_string()],
                vec!["page".to_string()],
            ]
        );
        assert_eq!(result.entrypoints["home"].len(), 1);
    }
}
