//! Read elimination on top of the escape analysis state
//!
//! Loads from objects that are not virtual are looked up in a per-path
//! cache keyed by object, location, index and kind. A hit replaces the
//! load; a store of the value the cache already holds is dropped. Memory
//! checkpoints kill the locations they may write.

use super::effects::EffectList;
use super::escape::{PartialEscapeClosure, PhiPurpose};
use super::merge::MergeProcessor;
use super::state::{BlockState, ReadCacheKey};
use crate::ir::schedule::{ControlFlowGraph, LoopInfo};
use crate::ir::{BlockId, Graph, LocationIdentity, Node, NodeId, NodeKind, ValueKind};
use fxhash::FxHashMap;
use tracing::trace;

/// Locations written by the memory checkpoints of one loop
#[derive(Debug, Clone, Default)]
pub(crate) struct LoopKills {
    kills_any: bool,
    locations: Vec<LocationIdentity>,
}

impl LoopKills {
    fn add(&mut self, location: LocationIdentity) {
        if location.is_any() {
            self.kills_any = true;
        } else if !self.locations.contains(&location) {
            self.locations.push(location);
        }
    }
}

/// Per sweep facts the read elimination needs up front
#[derive(Debug, Clone, Default)]
pub(crate) struct ReadEliminationInfo {
    loop_kills: FxHashMap<BlockId, LoopKills>,
}

impl ReadEliminationInfo {
    pub(crate) fn compute(graph: &Graph, cfg: &ControlFlowGraph) -> Self {
        let mut loop_kills = FxHashMap::default();
        for info in cfg.loops() {
            let mut kills = LoopKills::default();
            for &block in &info.blocks {
                for &node in cfg.nodes(block) {
                    let node = graph.node(node);
                    // Stores are tracked precisely by the loop iteration itself
                    let checkpoint = matches!(
                        node.kind,
                        NodeKind::MemoryKill { .. }
                            | NodeKind::Invoke { .. }
                            | NodeKind::MonitorEnter { .. }
                            | NodeKind::MonitorExit { .. }
                    );
                    if let (true, Some(location)) = (checkpoint, node.killed_location()) {
                        kills.add(location);
                    }
                }
            }
            loop_kills.insert(info.header, kills);
        }
        Self { loop_kills }
    }

    /// Drop cache entries a loop's checkpoints may invalidate
    pub(crate) fn strip_killed_locations(&self, header: BlockId, state: &mut BlockState) {
        let Some(kills) = self.loop_kills.get(&header) else {
            return;
        };
        if kills.kills_any {
            state.kill_all_read_cache();
            return;
        }
        for &location in &kills.locations {
            state.kill_read_cache(location);
        }
    }
}

impl PartialEscapeClosure<'_> {
    pub(crate) fn process_read_elimination(
        &mut self,
        id: NodeId,
        node: &Node,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) {
        match &node.kind {
            NodeKind::LoadField { field } => {
                if let Some(object) = self.cacheable_object(state, node.inputs[0]) {
                    let key = ReadCacheKey::new(
                        object,
                        LocationIdentity::Field(*field),
                        -1,
                        node.value_kind,
                    );
                    self.process_load(key, id, state, effects);
                }
            }
            NodeKind::StoreField { field } => {
                if let Some(object) = self.cacheable_object(state, node.inputs[0]) {
                    let kind = self.graph.layout(field.layout).entry_kinds[field.index as usize];
                    let key = ReadCacheKey::new(object, LocationIdentity::Field(*field), -1, kind);
                    let value = self.alias_and_resolve(state, node.inputs[1]);
                    self.process_store(key, value, id, state, effects);
                }
            }
            NodeKind::LoadIndexed { kind } => {
                let object = self.cacheable_object(state, node.inputs[0]);
                let index = self.constant_index(state, node.inputs[1]);
                if let (Some(object), Some(index)) = (object, index) {
                    let key =
                        ReadCacheKey::new(object, LocationIdentity::ArrayElement(*kind), index, *kind);
                    self.process_load(key, id, state, effects);
                }
            }
            NodeKind::StoreIndexed { kind } => {
                let object = self.cacheable_object(state, node.inputs[0]);
                let index = self.constant_index(state, node.inputs[1]);
                match (object, index) {
                    (Some(object), Some(index)) => {
                        let key = ReadCacheKey::new(
                            object,
                            LocationIdentity::ArrayElement(*kind),
                            index,
                            *kind,
                        );
                        let value = self.alias_and_resolve(state, node.inputs[2]);
                        self.process_store(key, value, id, state, effects);
                    }
                    _ => state.kill_read_cache(LocationIdentity::ArrayElement(*kind)),
                }
            }
            NodeKind::ArrayLength => {
                if let Some(object) = self.cacheable_object(state, node.inputs[0]) {
                    let key =
                        ReadCacheKey::new(object, LocationIdentity::ArrayLength, -1, ValueKind::Int);
                    self.process_load(key, id, state, effects);
                }
            }
            NodeKind::MemoryKill { .. }
            | NodeKind::Invoke { .. }
            | NodeKind::MonitorEnter { .. }
            | NodeKind::MonitorExit { .. } => {
                if let Some(location) = node.killed_location() {
                    state.kill_read_cache(location);
                }
            }
            _ => {}
        }
    }

    /// The object a memory access goes to, unless it is still virtual
    fn cacheable_object(&self, state: &BlockState, object: NodeId) -> Option<NodeId> {
        let object = self.alias_and_resolve(state, object);
        match self.virtual_node(object) {
            Some(_) => None,
            None => Some(object),
        }
    }

    fn constant_index(&self, state: &BlockState, index: NodeId) -> Option<i32> {
        let index = self.alias_and_resolve(state, index);
        self.constant_value(index)?.as_int()
    }

    fn process_load(
        &mut self,
        key: ReadCacheKey,
        load: NodeId,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) {
        match state.read_cache_get(&key) {
            Some(cached) => {
                trace!("{} reads the cached {}", load, cached);
                effects.replace_at_usages(load, cached);
                effects.delete_node(load);
                state.add_scalar_alias(load, cached);
            }
            None => state.read_cache_put(key, load),
        }
    }

    fn process_store(
        &mut self,
        key: ReadCacheKey,
        value: NodeId,
        store: NodeId,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) {
        if state.read_cache_get(&key) == Some(value) {
            trace!("{} stores the value already in memory", store);
            effects.delete_node(store);
            return;
        }
        state.kill_read_cache(key.identity);
        state.read_cache_put(key, value);
    }

    /// Keep entries all predecessors agree on; entries that differ get a
    /// phi. Phis of objects inherit the entries of their inputs.
    pub(crate) fn merge_read_caches(&mut self, mp: &mut MergeProcessor, states: &[BlockState]) {
        let first: Vec<(ReadCacheKey, NodeId)> =
            states[0].read_cache().map(|(k, v)| (*k, v)).collect();
        for (key, value) in first {
            let Some(values) = collect_values(states, |_, s| s.read_cache_get(&key)) else {
                continue;
            };
            let merged = self.merge_values(mp, PhiPurpose::ReadCache(key), value, &values);
            mp.new_state.read_cache_put(key, merged);
        }

        let graph = self.graph;
        for &phi in &graph.block(mp.block).phis {
            let node = graph.node(phi);
            if node.value_kind != ValueKind::Object || self.virtual_of(phi).is_some() {
                continue;
            }
            let objects: Vec<NodeId> = states
                .iter()
                .zip(node.inputs.iter())
                .map(|(s, input)| self.alias_and_resolve(s, *input))
                .collect();
            let keys: Vec<(ReadCacheKey, NodeId)> = states[0]
                .read_cache()
                .filter(|(k, _)| k.object == objects[0])
                .map(|(k, v)| (*k, v))
                .collect();
            for (key, value) in keys {
                let Some(values) =
                    collect_values(states, |i, s| s.read_cache_get(&key.with_object(objects[i])))
                else {
                    continue;
                };
                let phi_key = key.with_object(phi);
                let merged = self.merge_values(mp, PhiPurpose::ReadCache(phi_key), value, &values);
                mp.new_state.read_cache_put(phi_key, merged);
            }
        }
    }

    fn merge_values(
        &mut self,
        mp: &mut MergeProcessor,
        purpose: PhiPurpose,
        first: NodeId,
        values: &[NodeId],
    ) -> NodeId {
        if values.iter().all(|v| *v == first) {
            return first;
        }
        let kind = self.value_kind(first);
        let graph = self.graph;
        let existing = graph.block(mp.block).phis.iter().copied().find(|&phi| {
            let node = graph.node(phi);
            node.value_kind == kind && node.inputs.as_slice() == values
        });
        if let Some(phi) = existing {
            return phi;
        }
        let phi = self.merge_phi(mp, purpose, kind);
        for (i, value) in values.iter().enumerate() {
            mp.after_merge_effects.initialize_phi_input(phi, i, *value);
        }
        phi
    }

    /// Entries of a header phi's forward input also hold for the phi on
    /// the first round
    pub(crate) fn seed_loop_phi_reads(&mut self, info: &LoopInfo, state: &mut BlockState) {
        if state.read_cache_len() == 0 {
            return;
        }
        let graph = self.graph;
        for &phi in &graph.block(info.header).phis {
            let node = graph.node(phi);
            if node.value_kind != ValueKind::Object || self.virtual_of(phi).is_some() {
                continue;
            }
            let Some(&forward) = node.inputs.first() else {
                continue;
            };
            let object = self.alias_and_resolve(state, forward);
            let seeded: Vec<(ReadCacheKey, NodeId)> = state
                .read_cache()
                .filter(|(k, _)| k.object == object)
                .map(|(k, v)| (k.with_object(phi), v))
                .collect();
            for (key, value) in seeded {
                state.read_cache_put(key, value);
            }
        }
    }

    /// Cached values that changed inside the loop leave it through a proxy
    pub(crate) fn proxy_loop_exit_reads(
        &mut self,
        exit: BlockId,
        entry_state: &BlockState,
        exit_state: &mut BlockState,
        effects: &mut EffectList,
    ) {
        let changed: Vec<(ReadCacheKey, NodeId)> = exit_state
            .read_cache()
            .filter(|(k, v)| entry_state.read_cache_get(k) != Some(*v))
            .map(|(k, v)| (*k, v))
            .collect();
        for (key, value) in changed {
            if self.constant_value(value).is_some() {
                continue;
            }
            let proxy = self.proxy_for(exit, value, effects);
            exit_state.read_cache_put(key, proxy);
        }
    }
}

/// The value every state holds, or None if some state has no entry
fn collect_values(
    states: &[BlockState],
    get: impl Fn(usize, &BlockState) -> Option<NodeId>,
) -> Option<Vec<NodeId>> {
    states.iter().enumerate().map(|(i, s)| get(i, s)).collect()
}
