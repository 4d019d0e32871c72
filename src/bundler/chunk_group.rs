//! Chunk groups: ordered chunk sequences loaded together for one request

use std::collections::BTreeSet;

use tracing::debug;

use super::{helpers, ChunkIdx, Compilation, ModuleIdx};

/// Index of a chunk group in the [`Compilation`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkGroupIdx(pub(crate) usize);

impl ChunkGroupIdx {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What kind of request a chunk group stands for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkGroupKind {
    /// Loaded on demand by one or more dynamic imports
    Normal,
    /// Loaded by a build entry
    Entrypoint {
        /// Chunk carrying the module loader, first chunk when unset
        runtime_chunk: Option<ChunkIdx>,
    },
}

/// Call site that caused a chunk group to exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOrigin {
    /// Importing module, `None` for entries
    pub module: Option<ModuleIdx>,
    pub loc: Option<String>,
    pub request: Option<String>,
}

#[derive(Debug)]
pub struct ChunkGroup {
    pub debug_id: u32,

    /// Group name, the entry name for entrypoints
    pub name: Option<String>,

    pub kind: ChunkGroupKind,

    pub(crate) removed: bool,
    chunks: Vec<ChunkIdx>,
    parents: BTreeSet<ChunkGroupIdx>,
    children: BTreeSet<ChunkGroupIdx>,
    blocks: Vec<usize>,
    origins: Vec<BlockOrigin>,
}

impl ChunkGroup {
    pub(crate) fn new(name: Option<String>, kind: ChunkGroupKind, debug_id: u32) -> Self {
        Self {
            debug_id,
            name,
            kind,
            removed: false,
            chunks: Vec::new(),
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            blocks: Vec::new(),
            origins: Vec::new(),
        }
    }

    pub fn is_entrypoint(&self) -> bool {
        matches!(self.kind, ChunkGroupKind::Entrypoint { .. })
    }

    /// Entrypoints are always initial; on-demand groups never are
    pub fn is_initial(&self) -> bool {
        self.is_entrypoint()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Runtime chunk of an entrypoint: the explicit one, else the first chunk
    pub fn runtime_chunk(&self) -> Option<ChunkIdx> {
        match self.kind {
            ChunkGroupKind::Entrypoint { runtime_chunk } => {
                runtime_chunk.or_else(|| self.chunks.first().copied())
            }
            ChunkGroupKind::Normal => None,
        }
    }

    pub fn set_runtime_chunk(&mut self, chunk: ChunkIdx) {
        if let ChunkGroupKind::Entrypoint { runtime_chunk } = &mut self.kind {
            *runtime_chunk = Some(chunk);
        }
    }

    /// Chunks in load order
    pub fn chunks(&self) -> &[ChunkIdx] {
        &self.chunks
    }

    pub fn parents(&self) -> impl Iterator<Item = ChunkGroupIdx> + '_ {
        self.parents.iter().copied()
    }

    pub fn children(&self) -> impl Iterator<Item = ChunkGroupIdx> + '_ {
        self.children.iter().copied()
    }

    pub fn number_of_parents(&self) -> usize {
        self.parents.len()
    }

    pub fn has_parent(&self, group: ChunkGroupIdx) -> bool {
        self.parents.contains(&group)
    }

    pub fn has_child(&self, group: ChunkGroupIdx) -> bool {
        self.children.contains(&group)
    }

    /// Indices of the async blocks this group serves
    pub fn blocks(&self) -> &[usize] {
        &self.blocks
    }

    pub fn origins(&self) -> &[BlockOrigin] {
        &self.origins
    }

    pub fn add_block(&mut self, block: usize) -> bool {
        if self.blocks.contains(&block) {
            return false;
        }
        self.blocks.push(block);
        true
    }

    pub fn add_origin(&mut self, origin: BlockOrigin) {
        self.origins.push(origin);
    }

    pub(crate) fn push_chunk(&mut self, chunk: ChunkIdx) -> bool {
        if self.chunks.contains(&chunk) {
            return false;
        }
        self.chunks.push(chunk);
        true
    }

    /// Place `chunk` right after `after`; appended when `after` is not a member
    pub(crate) fn insert_chunk(&mut self, chunk: ChunkIdx, after: ChunkIdx) -> bool {
        if let Some(existing) = self.chunks.iter().position(|&c| c == chunk) {
            match self.chunks.iter().position(|&c| c == after) {
                Some(anchor) if existing == anchor + 1 => return false,
                _ => {
                    self.chunks.remove(existing);
                }
            }
        }
        match self.chunks.iter().position(|&c| c == after) {
            Some(anchor) => self.chunks.insert(anchor + 1, chunk),
            None => self.chunks.push(chunk),
        }
        true
    }

    /// Swap `old` for `new` in place, dropping `old` when `new` is already a member
    pub(crate) fn replace_chunk(&mut self, old: ChunkIdx, new: ChunkIdx) -> bool {
        let Some(old_position) = self.chunks.iter().position(|&c| c == old) else {
            return false;
        };
        if self.chunks.contains(&new) {
            self.chunks.remove(old_position);
        } else {
            self.chunks[old_position] = new;
        }
        true
    }

    pub(crate) fn remove_chunk(&mut self, chunk: ChunkIdx) -> bool {
        match self.chunks.iter().position(|&c| c == chunk) {
            Some(position) => {
                self.chunks.remove(position);
                true
            }
            None => false,
        }
    }

    pub(crate) fn add_parent(&mut self, group: ChunkGroupIdx) -> bool {
        self.parents.insert(group)
    }

    pub(crate) fn remove_parent(&mut self, group: ChunkGroupIdx) -> bool {
        self.parents.remove(&group)
    }

    pub(crate) fn add_child(&mut self, group: ChunkGroupIdx) -> bool {
        self.children.insert(group)
    }

    pub(crate) fn remove_child(&mut self, group: ChunkGroupIdx) -> bool {
        self.children.remove(&group)
    }
}

impl Compilation {
    /// Detach a chunk group from the graph.
    ///
    /// Parents inherit the group's children so load relationships survive,
    /// and its chunks lose their membership in it.
    pub fn remove_chunk_group(&mut self, group: ChunkGroupIdx) {
        debug!("Removing chunk group {}", self.chunk_group(group).debug_id);

        let parents: Vec<_> = self.chunk_group(group).parents().collect();
        let children: Vec<_> = self.chunk_group(group).children().collect();

        for &parent in &parents {
            helpers::disconnect_chunk_groups(self, parent, group);
            for &child in &children {
                if child != parent {
                    helpers::connect_chunk_groups(self, parent, child);
                }
            }
        }
        for &child in &children {
            helpers::disconnect_chunk_groups(self, group, child);
        }

        let chunks = self.chunk_group(group).chunks().to_vec();
        for chunk in chunks {
            helpers::disconnect_chunk_group_and_chunk(self, group, chunk);
        }

        self.chunk_group_mut(group).removed = true;
        self.detach_chunk_group(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::test_utils;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insert_chunk_after() {
        let mut group = ChunkGroup::new(None, ChunkGroupKind::Normal, 0);
        group.push_chunk(ChunkIdx(0));
        group.push_chunk(ChunkIdx(1));

        assert!(group.insert_chunk(ChunkIdx(2), ChunkIdx(0)));
        assert_eq!(group.chunks(), &[ChunkIdx(0), ChunkIdx(2), ChunkIdx(1)]);

        // Already in place
        assert!(!group.insert_chunk(ChunkIdx(2), ChunkIdx(0)));

        // Moved behind the new anchor
        assert!(group.insert_chunk(ChunkIdx(2), ChunkIdx(1)));
        assert_eq!(group.chunks(), &[ChunkIdx(0), ChunkIdx(1), ChunkIdx(2)]);

        // Unknown anchor appends
        assert!(group.insert_chunk(ChunkIdx(3), ChunkIdx(9)));
        assert_eq!(group.chunks().last(), Some(&ChunkIdx(3)));
    }

    #[test]
    fn test_push_and_replace() {
        let mut group = ChunkGroup::new(None, ChunkGroupKind::Normal, 0);
        assert!(group.push_chunk(ChunkIdx(1)));
        assert!(group.push_chunk(ChunkIdx(0)));
        assert!(!group.push_chunk(ChunkIdx(0)));
        assert_eq!(group.chunks(), &[ChunkIdx(1), ChunkIdx(0)]);

        assert!(group.replace_chunk(ChunkIdx(0), ChunkIdx(5)));
        assert_eq!(group.chunks(), &[ChunkIdx(1), ChunkIdx(5)]);

        // Replacing with a member collapses the pair
        assert!(group.replace_chunk(ChunkIdx(5), ChunkIdx(1)));
        assert_eq!(group.chunks(), &[ChunkIdx(1)]);
        assert!(!group.replace_chunk(ChunkIdx(7), ChunkIdx(1)));
    }

    #[test]
    fn test_entrypoint_runtime_chunk() {
        let mut entry = ChunkGroup::new(
            Some("main".into()),
            ChunkGroupKind::Entrypoint { runtime_chunk: None },
            0,
        );
        assert!(entry.is_initial());
        assert_eq!(entry.runtime_chunk(), None);

        entry.push_chunk(ChunkIdx(3));
        entry.push_chunk(ChunkIdx(4));
        assert_eq!(entry.runtime_chunk(), Some(ChunkIdx(3)));

        entry.set_runtime_chunk(ChunkIdx(4));
        assert_eq!(entry.runtime_chunk(), Some(ChunkIdx(4)));

        let mut normal = ChunkGroup::new(None, ChunkGroupKind::Normal, 1);
        normal.push_chunk(ChunkIdx(0));
        normal.set_runtime_chunk(ChunkIdx(0));
        assert!(!normal.is_initial());
        assert_eq!(normal.runtime_chunk(), None);
    }

    #[test]
    fn test_remove_chunk_group_relinks_parents_to_children() {
        let (mut compilation, entry_chunk) = test_utils::entry(&[("a", 1)]);
        let middle = test_utils::async_child(&mut compilation, entry_chunk, &[("b", 1)]);
        let leaf = test_utils::async_child(&mut compilation, middle, &[("c", 1)]);

        let entry_group = compilation.chunk(entry_chunk).groups().next().unwrap();
        let middle_group = compilation.chunk(middle).groups().next().unwrap();
        let leaf_group = compilation.chunk(leaf).groups().next().unwrap();

        compilation.remove_chunk_group(middle_group);

        assert!(compilation.chunk_group(middle_group).is_removed());
        assert!(!compilation.chunk_groups().contains(&middle_group));
        assert!(compilation.chunk_group(entry_group).has_child(leaf_group));
        assert!(!compilation.chunk_group(entry_group).has_child(middle_group));
        assert!(compilation.chunk_group(leaf_group).has_parent(entry_group));
        assert_eq!(compilation.chunk(middle).number_of_groups(), 0);
        assert!(compilation.chunk_group(middle_group).chunks().is_empty());
    }
}
