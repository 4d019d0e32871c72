//! Chunk graph optimization passes
//!
//! Every pass implements [`OptimizePass`]; the [`PassManager`] invokes the
//! registered passes hook by hook, in registration order.

mod aggressive_splitting;
mod ensure_chunk_conditions;
mod remove_empty_chunks;
mod split_chunks;

use std::fmt;

use tracing::debug;

use crate::bundler::{Compilation, Records};
use crate::error::Result;

pub use aggressive_splitting::{AggressiveSplittingOptions, AggressiveSplittingPass};
pub use ensure_chunk_conditions::EnsureChunkConditionsPass;
pub use remove_empty_chunks::RemoveEmptyChunksPass;
pub use split_chunks::{
    CacheGroupFn, CacheGroupOptions, CacheGroupTest, CacheGroups, ChunkNameOption, ChunksFilter,
    NameFn, SplitChunksOptions, SplitChunksPass, TestFn,
};

/// The optimization stages a pass can take part in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeHook {
    ChunksBasic,
    ExtractedChunksBasic,
    ChunksAdvanced,
}

impl fmt::Display for OptimizeHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizeHook::ChunksBasic => "optimize-chunks-basic",
            OptimizeHook::ExtractedChunksBasic => "optimize-extracted-chunks-basic",
            OptimizeHook::ChunksAdvanced => "optimize-chunks-advanced",
        };
        f.write_str(name)
    }
}

/// A chunk graph optimization pass.
///
/// Each optimize hook runs the pass once and reports whether the chunk
/// graph changed; hooks a pass does not take part in keep the default.
pub trait OptimizePass {
    /// Pass name for logging and debugging
    fn name(&self) -> &str;

    fn optimize_chunks_basic(&mut self, _compilation: &mut Compilation) -> Result<bool> {
        Ok(false)
    }

    fn optimize_extracted_chunks_basic(&mut self, _compilation: &mut Compilation) -> Result<bool> {
        Ok(false)
    }

    fn optimize_chunks_advanced(&mut self, _compilation: &mut Compilation) -> Result<bool> {
        Ok(false)
    }

    /// Called once per seal after hashing, to update persisted records
    fn record_hash(&mut self, _compilation: &Compilation, _records: &mut Records) -> Result<()> {
        Ok(())
    }

    /// Ask for the chunk graph to be rebuilt and optimized again
    fn need_additional_seal(&self, _compilation: &Compilation) -> bool {
        false
    }

    /// Forget per-seal state before the chunk graph is rebuilt
    fn unseal(&mut self) {}
}

/// Ordered list of passes
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn OptimizePass>>,
}

impl PassManager {
    /// Create an empty pass manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pass
    pub fn register(&mut self, pass: Box<dyn OptimizePass>) {
        debug!("Registered pass {}", pass.name());
        self.passes.push(pass);
    }

    pub fn names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run `hook` on every pass until one reports a change
    pub fn call_bail(&mut self, hook: OptimizeHook, compilation: &mut Compilation) -> Result<bool> {
        for pass in &mut self.passes {
            let changed = match hook {
                OptimizeHook::ChunksBasic => pass.optimize_chunks_basic(compilation)?,
                OptimizeHook::ExtractedChunksBasic => pass.optimize_extracted_chunks_basic(compilation)?,
                OptimizeHook::ChunksAdvanced => pass.optimize_chunks_advanced(compilation)?,
            };
            if changed {
                debug!("{} changed the chunk graph during {}", pass.name(), hook);
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn record_hash(&mut self, compilation: &Compilation, records: &mut Records) -> Result<()> {
        for pass in &mut self.passes {
            pass.record_hash(compilation, records)?;
        }
        Ok(())
    }

    /// First pass asking for another seal, if any
    pub fn need_additional_seal(&self, compilation: &Compilation) -> Option<&str> {
        self.passes
            .iter()
            .find(|p| p.need_additional_seal(compilation))
            .map(|p| p.name())
    }

    pub fn unseal(&mut self) {
        for pass in &mut self.passes {
            pass.unseal();
        }
    }
}

impl fmt::Debug for PassManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassManager")
            .field("passes", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::ModuleGraph;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        name: &'static str,
        changes: usize,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl OptimizePass for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn optimize_chunks_basic(&mut self, _compilation: &mut Compilation) -> Result<bool> {
            self.log.borrow_mut().push(self.name.to_string());
            if self.changes > 0 {
                self.changes -= 1;
                return Ok(true);
            }
            Ok(false)
        }
    }

    #[test]
    fn test_call_bail_stops_at_first_change() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager = PassManager::new();
        manager.register(Box::new(Recorder { name: "first", changes: 1, log: log.clone() }));
        manager.register(Box::new(Recorder { name: "second", changes: 0, log: log.clone() }));
        let mut compilation = Compilation::new(ModuleGraph::new());

        assert!(manager.call_bail(OptimizeHook::ChunksBasic, &mut compilation).unwrap());
        assert_eq!(*log.borrow(), vec!["first"]);

        assert!(!manager.call_bail(OptimizeHook::ChunksBasic, &mut compilation).unwrap());
        assert_eq!(*log.borrow(), vec!["first", "first", "second"]);

        // Hooks a pass does not implement never report changes
        assert!(!manager.call_bail(OptimizeHook::ChunksAdvanced, &mut compilation).unwrap());
        assert_eq!(manager.names(), vec!["first", "second"]);
        assert_eq!(manager.need_additional_seal(&compilation), None);
    }
}
