//! Relocate modules whose chunk condition rejects the chunks they are in

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, trace};

use super::OptimizePass;
use crate::bundler::{helpers, ChunkCondition, ChunkIdx, Compilation, ModuleIdx};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct EnsureChunkConditionsPass {
    /// Chunks a module was already pushed out of
    tries: HashMap<ModuleIdx, BTreeSet<ChunkIdx>>,
}

impl EnsureChunkConditionsPass {
    pub fn new() -> Self {
        Self::default()
    }

    fn conditional_modules(compilation: &Compilation) -> Vec<(ModuleIdx, ChunkCondition)> {
        compilation
            .module_graph()
            .modules()
            .filter_map(|(idx, module)| module.chunk_condition.clone().map(|c| (idx, c)))
            .collect()
    }

    /// Move every rejected module into the nearest satisfying chunk of its
    /// chunk groups or their ancestors
    fn relocate(compilation: &mut Compilation) -> Result<bool> {
        let mut changed = false;

        for (module, condition) in Self::conditional_modules(compilation) {
            let source_chunks: Vec<ChunkIdx> = compilation
                .module_graph()
                .module(module)
                .chunks()
                .filter(|&c| !condition.is_satisfied_by(compilation, c))
                .collect();
            if source_chunks.is_empty() {
                continue;
            }

            // Work queue of groups, each visited once
            let mut queued = BTreeSet::new();
            let mut groups = Vec::new();
            for &chunk in &source_chunks {
                for group in compilation.chunk(chunk).groups() {
                    if queued.insert(group) {
                        groups.push(group);
                    }
                }
            }

            let mut target_chunks = Vec::new();
            let mut i = 0;
            while i < groups.len() {
                let group = groups[i];
                i += 1;

                let satisfying = compilation
                    .chunk_group(group)
                    .chunks()
                    .iter()
                    .copied()
                    .find(|&c| condition.is_satisfied_by(compilation, c));
                if let Some(chunk) = satisfying {
                    if !target_chunks.contains(&chunk) {
                        target_chunks.push(chunk);
                    }
                    continue;
                }

                if compilation.chunk_group(group).is_initial() {
                    return Err(Error::UnsatisfiableChunkCondition {
                        module: compilation.module_graph().module(module).identifier.clone(),
                    });
                }
                for parent in compilation.chunk_group(group).parents() {
                    if queued.insert(parent) {
                        groups.push(parent);
                    }
                }
            }

            debug!(
                "Moving {} out of {} chunks into {} chunks",
                compilation.module_graph().module(module).identifier,
                source_chunks.len(),
                target_chunks.len()
            );
            for &source in &source_chunks {
                helpers::disconnect_chunk_and_module(compilation, source, module);
                compilation
                    .module_graph_mut()
                    .module_mut(module)
                    .rewrite_chunk_in_reasons(source, &target_chunks);
            }
            for &target in &target_chunks {
                helpers::connect_chunk_and_module(compilation, target, module);
            }
            changed = true;
        }

        Ok(changed)
    }

    /// Push modules still failing their condition into the parent chunks
    /// they were not tried in yet
    fn push_to_parents(&mut self, compilation: &mut Compilation) -> bool {
        let mut changed = false;

        for chunk in compilation.chunks().to_vec() {
            let modules = compilation.chunk(chunk).modules(compilation.module_graph()).to_vec();
            for module in modules {
                let Some(condition) = compilation.module_graph().module(module).chunk_condition.clone() else {
                    continue;
                };
                if condition.is_satisfied_by(compilation, chunk) {
                    continue;
                }

                let tried = self.tries.entry(module).or_default();
                tried.insert(chunk);
                let mut new_chunks = Vec::new();
                for parent in compilation.chunk_parents(chunk) {
                    if !tried.contains(&parent) {
                        helpers::connect_chunk_and_module(compilation, parent, module);
                        new_chunks.push(parent);
                    }
                }
                trace!(
                    "Pushing {} into {} parent chunks",
                    compilation.module_graph().module(module).identifier,
                    new_chunks.len()
                );
                compilation
                    .module_graph_mut()
                    .module_mut(module)
                    .rewrite_chunk_in_reasons(chunk, &new_chunks);
                helpers::disconnect_chunk_and_module(compilation, chunk, module);
                changed = true;
            }
        }

        changed
    }

    fn ensure(&mut self, compilation: &mut Compilation) -> Result<bool> {
        let relocated = Self::relocate(compilation)?;
        let pushed = self.push_to_parents(compilation);
        Ok(relocated || pushed)
    }
}

impl OptimizePass for EnsureChunkConditionsPass {
    fn name(&self) -> &str {
        "ensure-chunk-conditions"
    }

    fn optimize_chunks_basic(&mut self, compilation: &mut Compilation) -> Result<bool> {
        self.ensure(compilation)
    }

    fn optimize_extracted_chunks_basic(&mut self, compilation: &mut Compilation) -> Result<bool> {
        self.ensure(compilation)
    }

    fn unseal(&mut self) {
        self.tries.clear();
    }
}
