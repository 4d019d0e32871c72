//! Connection helpers
//!
//! The only place where links between chunk groups, chunks and modules are
//! created or dropped. Both sides of a link are always updated together.

use super::{ChunkGroupIdx, ChunkIdx, Compilation, ModuleIdx};

fn assert_live_chunk(compilation: &Compilation, chunk: ChunkIdx) {
    assert!(
        !compilation.chunk(chunk).is_removed(),
        "chunk {} was removed from the compilation",
        compilation.chunk(chunk).debug_id
    );
}

fn assert_live_group(compilation: &Compilation, group: ChunkGroupIdx) {
    assert!(
        !compilation.chunk_group(group).is_removed(),
        "chunk group {} was removed from the compilation",
        compilation.chunk_group(group).debug_id
    );
}

/// Append `chunk` to the group's load order
pub fn connect_chunk_group_and_chunk(
    compilation: &mut Compilation,
    group: ChunkGroupIdx,
    chunk: ChunkIdx,
) -> bool {
    assert_live_group(compilation, group);
    assert_live_chunk(compilation, chunk);
    if compilation.chunk_group_mut(group).push_chunk(chunk) {
        compilation.chunk_mut(chunk).add_group(group);
        return true;
    }
    false
}

/// Place `chunk` right after `after` in the group's load order
pub fn insert_chunk_into_group(
    compilation: &mut Compilation,
    group: ChunkGroupIdx,
    chunk: ChunkIdx,
    after: ChunkIdx,
) -> bool {
    assert_live_group(compilation, group);
    assert_live_chunk(compilation, chunk);
    let changed = compilation.chunk_group_mut(group).insert_chunk(chunk, after);
    compilation.chunk_mut(chunk).add_group(group);
    changed
}

pub fn disconnect_chunk_group_and_chunk(
    compilation: &mut Compilation,
    group: ChunkGroupIdx,
    chunk: ChunkIdx,
) -> bool {
    let from_group = compilation.chunk_group_mut(group).remove_chunk(chunk);
    let from_chunk = compilation.chunk_mut(chunk).remove_group(group);
    from_group || from_chunk
}

/// Make `child` load on demand from `parent`
pub fn connect_chunk_groups(
    compilation: &mut Compilation,
    parent: ChunkGroupIdx,
    child: ChunkGroupIdx,
) -> bool {
    assert_live_group(compilation, parent);
    assert_live_group(compilation, child);
    assert_ne!(parent, child, "a chunk group cannot be its own parent");
    let added = compilation.chunk_group_mut(parent).add_child(child);
    compilation.chunk_group_mut(child).add_parent(parent);
    added
}

pub fn disconnect_chunk_groups(
    compilation: &mut Compilation,
    parent: ChunkGroupIdx,
    child: ChunkGroupIdx,
) -> bool {
    let removed = compilation.chunk_group_mut(parent).remove_child(child);
    compilation.chunk_group_mut(child).remove_parent(parent);
    removed
}

pub fn connect_chunk_and_module(
    compilation: &mut Compilation,
    chunk: ChunkIdx,
    module: ModuleIdx,
) -> bool {
    assert_live_chunk(compilation, chunk);
    if compilation.chunk_mut(chunk).add_module(module) {
        compilation.module_graph_mut().module_mut(module).add_chunk(chunk);
        return true;
    }
    false
}

pub fn disconnect_chunk_and_module(
    compilation: &mut Compilation,
    chunk: ChunkIdx,
    module: ModuleIdx,
) -> bool {
    let from_chunk = compilation.chunk_mut(chunk).remove_module(module);
    let from_module = compilation.module_graph_mut().module_mut(module).remove_chunk(chunk);
    from_chunk || from_module
}
