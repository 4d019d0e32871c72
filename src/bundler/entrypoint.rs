//! Entrypoint manifest queries over the reachable chunk-group DAG

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;

use super::{ChunkGroupIdx, ChunkIdx, Compilation, Module};

/// `{chunk id → hash}` and `{chunk id → name}` for a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkMaps {
    pub hash: BTreeMap<String, String>,
    pub name: BTreeMap<String, String>,
}

/// `{chunk id → module ids}` and `{module id → module hash}` for a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkModuleMaps {
    pub id: BTreeMap<String, Vec<usize>>,
    pub hash: BTreeMap<String, String>,
}

impl Compilation {
    /// Chunks of every group reachable from `entrypoint`, in discovery order.
    ///
    /// Each group is queued at most once, so diamonds and shared children
    /// terminate. With `include_initial == false` the chunks of entrypoint
    /// groups are skipped unless a non-initial group also holds them.
    pub fn get_all_chunks_in_graph(
        &self,
        entrypoint: ChunkGroupIdx,
        include_initial: bool,
    ) -> Vec<ChunkIdx> {
        let mut seen = BTreeSet::new();
        let mut chunks = Vec::new();

        for group in self.reachable_chunk_groups(entrypoint) {
            let group = self.chunk_group(group);
            if !include_initial && group.is_initial() {
                continue;
            }
            for &chunk in group.chunks() {
                if seen.insert(chunk) {
                    chunks.push(chunk);
                }
            }
        }

        chunks
    }

    fn reachable_chunk_groups(&self, entrypoint: ChunkGroupIdx) -> Vec<ChunkGroupIdx> {
        let mut queued = BTreeSet::from([entrypoint]);
        let mut queue = VecDeque::from([entrypoint]);
        let mut order = Vec::new();

        while let Some(group) = queue.pop_front() {
            order.push(group);
            for child in self.chunk_group(group).children() {
                if queued.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        order
    }

    /// Hash and name maps of the reachable chunks; `real_hash` picks the full
    /// hash over the rendered one
    pub fn get_chunk_maps(
        &self,
        entrypoint: ChunkGroupIdx,
        include_initial: bool,
        real_hash: bool,
    ) -> ChunkMaps {
        let mut maps = ChunkMaps::default();

        for chunk_idx in self.get_all_chunks_in_graph(entrypoint, include_initial) {
            let chunk = self.chunk(chunk_idx);
            let Some(id) = &chunk.id else { continue };
            let hash = if real_hash { &chunk.hash } else { &chunk.rendered_hash };
            if let Some(hash) = hash {
                maps.hash.insert(id.to_string(), hash.clone());
            }
            if let Some(name) = &chunk.name {
                maps.name.insert(id.to_string(), name.clone());
            }
        }

        maps
    }

    /// Module ids per chunk for modules accepted by `filter`
    pub fn get_chunk_module_maps<F>(
        &self,
        entrypoint: ChunkGroupIdx,
        include_initial: bool,
        filter: F,
    ) -> ChunkModuleMaps
    where
        F: Fn(&Module) -> bool,
    {
        let graph = self.module_graph();
        let mut maps = ChunkModuleMaps::default();

        for chunk_idx in self.get_all_chunks_in_graph(entrypoint, include_initial) {
            let chunk = self.chunk(chunk_idx);
            let Some(chunk_id) = &chunk.id else { continue };

            let mut ids = Vec::new();
            for &module_idx in chunk.modules(graph) {
                let module = graph.module(module_idx);
                if !filter(module) {
                    continue;
                }
                if let Some(module_id) = module.id {
                    ids.push(module_id);
                    maps.hash.insert(module_id.to_string(), module.hash.clone());
                }
            }

            if !ids.is_empty() {
                ids.sort_unstable();
                maps.id.insert(chunk_id.to_string(), ids);
            }
        }

        maps
    }

    /// Whether any module accepted by `filter` lives in a reachable chunk accepted by `chunk_filter`
    pub fn has_module_in_graph<F, C>(
        &self,
        entrypoint: ChunkGroupIdx,
        filter: F,
        chunk_filter: Option<C>,
    ) -> bool
    where
        F: Fn(&Module) -> bool,
        C: Fn(&Compilation, ChunkIdx) -> bool,
    {
        let graph = self.module_graph();
        let mut queued = BTreeSet::from([entrypoint]);
        let mut queue = VecDeque::from([entrypoint]);
        let mut visited_chunks = BTreeSet::new();

        while let Some(group) = queue.pop_front() {
            for &chunk_idx in self.chunk_group(group).chunks() {
                if !visited_chunks.insert(chunk_idx) {
                    continue;
                }
                if let Some(chunk_filter) = &chunk_filter {
                    if !chunk_filter(self, chunk_idx) {
                        continue;
                    }
                }
                let chunk = self.chunk(chunk_idx);
                if chunk.modules(graph).iter().any(|&m| filter(graph.module(m))) {
                    return true;
                }
            }
            for child in self.chunk_group(group).children() {
                if queued.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::{helpers, test_utils};
    use pretty_assertions::assert_eq;

    /// main → {left, right} → shared
    fn diamond() -> (Compilation, ChunkGroupIdx, [ChunkIdx; 4]) {
        let (mut compilation, main) = test_utils::entry(&[("index", 1)]);
        let left = test_utils::async_child(&mut compilation, main, &[("left", 1)]);
        let right = test_utils::async_child(&mut compilation, main, &[("right", 1)]);
        let shared = test_utils::async_child(&mut compilation, left, &[("shared", 1)]);
        let right_group = compilation.chunk(right).groups().next().unwrap();
        let shared_group = compilation.chunk(shared).groups().next().unwrap();
        helpers::connect_chunk_groups(&mut compilation, right_group, shared_group);

        compilation.chunk_mut(right).name = Some("right".into());
        compilation.assign_ids();
        compilation.create_hash();

        let entrypoint = compilation.entrypoint("main").unwrap();
        (compilation, entrypoint, [main, left, right, shared])
    }

    #[test]
    fn test_traversal_visits_diamond_once() {
        let (compilation, entrypoint, [main, left, right, shared]) = diamond();

        assert_eq!(
            compilation.get_all_chunks_in_graph(entrypoint, true),
            vec![main, left, right, shared]
        );
        assert_eq!(
            compilation.get_all_chunks_in_graph(entrypoint, false),
            vec![left, right, shared]
        );
    }

    #[test]
    fn test_initial_chunk_reachable_through_async_group_is_kept() {
        let (mut compilation, entrypoint, [main, left, right, shared]) = diamond();
        let left_group = compilation.chunk(left).groups().next().unwrap();
        helpers::connect_chunk_group_and_chunk(&mut compilation, left_group, main);

        assert_eq!(
            compilation.get_all_chunks_in_graph(entrypoint, false),
            vec![left, main, right, shared]
        );
    }

    #[test]
    fn test_chunk_maps() {
        let (compilation, entrypoint, [_, left, right, shared]) = diamond();
        let maps = compilation.get_chunk_maps(entrypoint, false, false);

        let ids: Vec<String> = [left, right, shared]
            .iter()
            .map(|c| compilation.chunk(*c).id.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(maps.hash.keys().cloned().collect::<BTreeSet<_>>(), ids.iter().cloned().collect());
        assert_eq!(maps.hash[&ids[0]].len(), 20);
        assert_eq!(maps.name.len(), 1);
        assert_eq!(maps.name[&ids[1]], "right");
    }

    #[test]
    fn test_chunk_maps_with_initial_chunks_and_real_hash() {
        let (compilation, entrypoint, [main, ..]) = diamond();
        let main_id = compilation.chunk(main).id.as_ref().unwrap().to_string();

        let rendered = compilation.get_chunk_maps(entrypoint, true, false);
        assert_eq!(rendered.hash.len(), 4);
        assert_eq!(rendered.hash[&main_id], compilation.chunk(main).rendered_hash.clone().unwrap());
        assert_eq!(rendered.name[&main_id], "main");

        let real = compilation.get_chunk_maps(entrypoint, true, true);
        assert_eq!(real.hash[&main_id], compilation.chunk(main).hash.clone().unwrap());
        assert_eq!(real.hash[&main_id].len(), 64);
        assert!(real.hash[&main_id].starts_with(&rendered.hash[&main_id]));
        assert_eq!(real.name, rendered.name);
    }

    #[test]
    fn test_chunk_module_maps_apply_filter() {
        let (compilation, entrypoint, [_, left, _, shared]) = diamond();
        let maps = compilation.get_chunk_module_maps(entrypoint, false, |m| m.identifier != "left");

        let shared_id = compilation.chunk(shared).id.as_ref().unwrap().to_string();
        let left_id = compilation.chunk(left).id.as_ref().unwrap().to_string();
        let shared_module = compilation.module_graph().get_module_idx("shared").unwrap();
        let shared_module_id = compilation.module_graph().module(shared_module).id.unwrap();

        assert_eq!(maps.id[&shared_id], vec![shared_module_id]);
        assert!(!maps.id.contains_key(&left_id));
        assert_eq!(maps.hash.len(), 2);
    }

    #[test]
    fn test_chunk_module_maps_with_initial_chunks() {
        let (compilation, entrypoint, [main, ..]) = diamond();
        let main_id = compilation.chunk(main).id.as_ref().unwrap().to_string();
        let index = compilation.module_graph().get_module_idx("index").unwrap();
        let index_id = compilation.module_graph().module(index).id.unwrap();

        let without = compilation.get_chunk_module_maps(entrypoint, false, |_| true);
        assert!(!without.id.contains_key(&main_id));
        assert_eq!(without.hash.len(), 3);

        let with = compilation.get_chunk_module_maps(entrypoint, true, |_| true);
        assert_eq!(with.id[&main_id], vec![index_id]);
        assert_eq!(with.hash.len(), 4);
    }

    #[test]
    fn test_has_module_in_graph() {
        let (compilation, entrypoint, [_, _, _, shared]) = diamond();
        let no_filter: Option<fn(&Compilation, ChunkIdx) -> bool> = None;

        assert!(compilation.has_module_in_graph(entrypoint, |m| m.identifier == "shared", no_filter));
        assert!(!compilation.has_module_in_graph(entrypoint, |m| m.identifier == "missing", no_filter));

        let async_only = |c: &Compilation, chunk: ChunkIdx| !c.chunk_is_initial(chunk);
        assert!(!compilation.has_module_in_graph(entrypoint, |m| m.identifier == "index", Some(async_only)));

        let not_shared = move |_: &Compilation, chunk: ChunkIdx| chunk != shared;
        assert!(!compilation.has_module_in_graph(entrypoint, |m| m.identifier == "shared", Some(not_shared)));
    }
}
