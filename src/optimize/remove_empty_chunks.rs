//! Prune chunks left empty by other passes

use tracing::debug;

use super::OptimizePass;
use crate::bundler::Compilation;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct RemoveEmptyChunksPass;

impl RemoveEmptyChunksPass {
    pub fn new() -> Self {
        Self
    }

    /// Remove every chunk without modules, runtime or entry module.
    ///
    /// Never reports a change.
    fn prune(compilation: &mut Compilation) {
        let chunks = compilation.chunks().to_vec();
        for &chunk in chunks.iter().rev() {
            if compilation.chunk(chunk).is_empty()
                && !compilation.chunk_has_runtime(chunk)
                && !compilation.chunk(chunk).has_entry_module()
            {
                debug!("Pruning empty chunk {}", compilation.chunk(chunk).debug_id);
                compilation.remove_chunk(chunk, "empty");
            }
        }
    }
}

impl OptimizePass for RemoveEmptyChunksPass {
    fn name(&self) -> &str {
        "remove-empty-chunks"
    }

    fn optimize_chunks_basic(&mut self, compilation: &mut Compilation) -> Result<bool> {
        Self::prune(compilation);
        Ok(false)
    }

    fn optimize_chunks_advanced(&mut self, compilation: &mut Compilation) -> Result<bool> {
        Self::prune(compilation);
        Ok(false)
    }
}
