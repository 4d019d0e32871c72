//! Aggressive splitting: keep chunks inside a size window, and stable
//! across builds by replaying the splits recorded in earlier builds

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, trace, warn};

use super::OptimizePass;
use crate::bundler::{ChunkIdx, ChunkSizeOptions, Compilation, ModuleIdx, Records, SplitRecord};
use crate::error::{Error, Result};

pub const DEFAULT_MIN_SIZE: usize = 30 * 1024;
pub const DEFAULT_MAX_SIZE: usize = 50 * 1024;

const REASON: &str = "aggressive-splitting";

/// Aggressive splitting options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggressiveSplittingOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub chunk_overhead: usize,
    pub entry_chunk_multiplicator: usize,
}

impl Default for AggressiveSplittingOptions {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            chunk_overhead: 0,
            entry_chunk_multiplicator: 1,
        }
    }
}

impl AggressiveSplittingOptions {
    pub fn validate(&self) -> Result<()> {
        if self.min_size > self.max_size {
            return Err(Error::invalid_options(format!(
                "aggressive splitting: min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.entry_chunk_multiplicator == 0 {
            return Err(Error::invalid_options(
                "aggressive splitting: entry_chunk_multiplicator must be at least 1",
            ));
        }
        Ok(())
    }

    fn size_options(&self) -> ChunkSizeOptions {
        ChunkSizeOptions {
            chunk_overhead: self.chunk_overhead,
            entry_chunk_multiplicator: self.entry_chunk_multiplicator,
        }
    }

    fn fits(&self, size: usize) -> bool {
        (self.min_size..=self.max_size).contains(&size)
    }
}

/// The aggressive splitting pass
#[derive(Debug)]
pub struct AggressiveSplittingPass {
    options: AggressiveSplittingOptions,
    /// Splits made by the greedy phase in this compilation
    stored_splits: Vec<SplitRecord>,
    /// Chunk produced for a record, keyed by its module list
    existing_splits: HashMap<Vec<String>, ChunkIdx>,
    /// Chunks this pass created
    from_aggressive: BTreeSet<ChunkIdx>,
    /// Chunk → index of the persisted record it reproduces
    index_map: BTreeMap<ChunkIdx, usize>,
    invalid_chunks: BTreeSet<ChunkIdx>,
}

impl AggressiveSplittingPass {
    pub fn new(options: AggressiveSplittingOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            stored_splits: Vec::new(),
            existing_splits: HashMap::new(),
            from_aggressive: BTreeSet::new(),
            index_map: BTreeMap::new(),
            invalid_chunks: BTreeSet::new(),
        })
    }

    fn chunk_size(&self, compilation: &Compilation, chunk: ChunkIdx) -> usize {
        compilation.chunk_size(chunk, &self.options.size_options())
    }

    /// Relative identifiers of the chunk's modules, in identifier order
    fn record_modules(compilation: &Compilation, chunk: ChunkIdx) -> Vec<String> {
        compilation
            .chunk(chunk)
            .modules(compilation.module_graph())
            .iter()
            .map(|&m| compilation.relative_identifier(m))
            .collect()
    }

    fn move_modules(compilation: &mut Compilation, modules: &[ModuleIdx], from: ChunkIdx, to: ChunkIdx) {
        for &module in modules {
            compilation.move_module(module, from, to);
        }
    }

    /// Reproduce recorded splits; returns whether a chunk was carved
    fn replay(&mut self, compilation: &mut Compilation) -> bool {
        let by_name: HashMap<String, ModuleIdx> = compilation
            .module_graph()
            .module_indices()
            .map(|m| (compilation.relative_identifier(m), m))
            .collect();

        let saved_len = compilation.records.aggressive_splits.len();
        let used_splits: Vec<SplitRecord> = compilation
            .records
            .aggressive_splits
            .iter()
            .chain(self.stored_splits.iter())
            .cloned()
            .collect();

        let mut changed = false;
        for (j, split) in used_splits.iter().enumerate() {
            let Some(modules) = split
                .modules
                .iter()
                .map(|name| by_name.get(name).copied())
                .collect::<Option<Vec<_>>>()
            else {
                trace!("Skipping split record with unknown modules");
                continue;
            };
            let Some(&first) = modules.first() else {
                continue;
            };

            // Chunks containing every module of the split
            let selected: Vec<ChunkIdx> = compilation
                .module_graph()
                .module(first)
                .chunks()
                .filter(|&c| {
                    let chunk = compilation.chunk(c);
                    !chunk.is_removed() && modules.iter().all(|&m| chunk.contains_module(m))
                })
                .collect();
            if selected.is_empty() {
                continue;
            }

            let mut target = self
                .existing_splits
                .get(&split.modules)
                .copied()
                .filter(|&c| !compilation.chunk(c).is_removed());
            let mut created = None;

            for chunk in selected {
                if Some(chunk) == target {
                    continue;
                }
                if compilation.chunk(chunk).number_of_modules() > modules.len() {
                    let split_chunk = *target.get_or_insert_with(|| {
                        let new_chunk = compilation.add_chunk(None);
                        created = Some(new_chunk);
                        new_chunk
                    });
                    Self::move_modules(compilation, &modules, chunk, split_chunk);
                    compilation.split_chunk(chunk, split_chunk);
                    changed = true;
                } else {
                    match target {
                        // Already identical to the split
                        None => target = Some(chunk),
                        Some(split_chunk) => {
                            if compilation.integrate_chunks(split_chunk, chunk, REASON) {
                                changed = true;
                            }
                        }
                    }
                }
            }

            let Some(target) = target else {
                continue;
            };
            if let Some(new_chunk) = created {
                debug!(
                    "Replayed split of {} modules into chunk {}",
                    modules.len(),
                    compilation.chunk(new_chunk).debug_id
                );
                self.from_aggressive.insert(new_chunk);
            }
            if j < saved_len {
                self.index_map.insert(target, j);
            }
            if let Some(id) = &split.id {
                compilation.chunk_mut(target).id = Some(id.clone());
            }
            self.existing_splits.insert(split.modules.clone(), target);
        }

        changed
    }

    /// Split the first oversized chunk; returns whether one was split
    fn split_oversized(&mut self, compilation: &mut Compilation) -> bool {
        let options = self.options;

        for chunk in compilation.chunks().to_vec() {
            if self.chunk_size(compilation, chunk) <= options.max_size
                || compilation.chunk(chunk).number_of_modules() <= 1
            {
                continue;
            }

            let entry_module = compilation.chunk(chunk).entry_module;
            let modules: Vec<ModuleIdx> = compilation
                .chunk(chunk)
                .modules(compilation.module_graph())
                .iter()
                .copied()
                .filter(|&m| Some(m) != entry_module)
                .collect();

            let new_chunk = compilation.add_chunk(None);
            for (k, &module) in modules.iter().enumerate() {
                compilation.move_module(module, chunk, new_chunk);
                let new_size = self.chunk_size(compilation, new_chunk);
                let chunk_size = self.chunk_size(compilation, chunk);

                if options.fits(new_size) && options.fits(chunk_size) {
                    break;
                }
                // A single module above the window stays on its own
                if new_size > options.max_size && k == 0 {
                    break;
                }
                if new_size > options.max_size || chunk_size < options.min_size {
                    compilation.move_module(module, new_chunk, chunk);
                    let new_size = self.chunk_size(compilation, new_chunk);
                    let chunk_size = self.chunk_size(compilation, chunk);
                    if options.fits(new_size) && chunk_size >= options.min_size {
                        break;
                    }
                }
            }

            if compilation.chunk(new_chunk).is_empty() {
                compilation.remove_chunk(new_chunk, REASON);
                continue;
            }

            compilation.split_chunk(chunk, new_chunk);
            compilation.chunk_mut(new_chunk).chunk_reason = Some(REASON.to_string());
            let record = SplitRecord::new(Self::record_modules(compilation, new_chunk));
            debug!(
                "Split {} modules off chunk {} into chunk {}",
                record.modules.len(),
                compilation.chunk(chunk).debug_id,
                compilation.chunk(new_chunk).debug_id
            );
            self.stored_splits.push(record);
            return true;
        }

        false
    }
}

impl OptimizePass for AggressiveSplittingPass {
    fn name(&self) -> &str {
        "aggressive-splitting"
    }

    fn optimize_chunks_advanced(&mut self, compilation: &mut Compilation) -> Result<bool> {
        if self.replay(compilation) {
            return Ok(true);
        }
        Ok(self.split_oversized(compilation))
    }

    fn record_hash(&mut self, compilation: &Compilation, records: &mut Records) -> Result<()> {
        let options = self.options;
        let mut new_splits = Vec::new();
        let mut splitting_invalid = false;

        for &chunk_idx in compilation.chunks() {
            let chunk = compilation.chunk(chunk_idx);
            if chunk.has_entry_module() {
                continue;
            }
            let size = self.chunk_size(compilation, chunk_idx);
            let incorrect_size = size < options.min_size
                || (size > options.max_size && chunk.number_of_modules() > 1);

            match self.index_map.get(&chunk_idx) {
                None => {
                    if incorrect_size {
                        continue;
                    }
                    new_splits.push(SplitRecord {
                        modules: Self::record_modules(compilation, chunk_idx),
                        hash: chunk.hash.clone(),
                        id: chunk.id.clone(),
                        invalid: false,
                    });
                }
                Some(&index) => {
                    let Some(split) = records.aggressive_splits.get_mut(index) else {
                        continue;
                    };
                    if split.hash != chunk.hash || incorrect_size {
                        if self.from_aggressive.contains(&chunk_idx) {
                            warn!(
                                "Recorded split of {} modules no longer matches, dropping it",
                                split.modules.len()
                            );
                            self.invalid_chunks.insert(chunk_idx);
                            split.invalid = true;
                            splitting_invalid = true;
                        } else {
                            split.hash = chunk.hash.clone();
                        }
                    }
                }
            }
        }

        if splitting_invalid {
            records.aggressive_splits.retain(|split| !split.invalid);
        } else {
            records.aggressive_splits.extend(new_splits);
        }
        Ok(())
    }

    fn need_additional_seal(&self, compilation: &Compilation) -> bool {
        compilation
            .chunks()
            .iter()
            .any(|c| self.invalid_chunks.contains(c))
    }

    fn unseal(&mut self) {
        self.existing_splits.clear();
        self.from_aggressive.clear();
        self.index_map.clear();
        self.invalid_chunks.clear();
    }
}
