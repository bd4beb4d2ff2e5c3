//! Partial escape analysis closure
//!
//! Tracks, per control flow path, which allocations are still virtual and
//! what their fields hold. Nodes that only touch virtual objects are
//! rewritten through the rules in [`super::virtualize`]; any other use of a
//! virtual object forces it to be materialized right before that use. The
//! read elimination flavor (see [`super::read_elimination`]) runs on the same
//! state once the escape analysis part has looked at a node.
//!
//! Merge handling lives in [`super::merge`].

use super::config::PeaConfig;
use super::effects::{Effect, EffectList, InsertPoint};
use super::iteration::{BlockEffects, EffectsClosure, MergeOutcome};
use super::merge::MergeProcessor;
use super::read_elimination::ReadEliminationInfo;
use super::state::{BlockState, ReadCacheKey, VirtualId, VirtualObjectDescriptor};
use super::stats::MaterializeReason;
use super::virtualize::{is_virtualizable, virtualize_node, VirtualizerToolImpl};
use crate::ir::schedule::{ControlFlowGraph, LoopInfo};
use crate::ir::{
    BlockId, Constant, FieldRef, Graph, LayoutId, Node, NodeId, NodeKind, ValueKind,
    VirtualMapping,
};
use fxhash::{FxHashMap, FxHashSet};
use tracing::trace;

/// What a phi created while merging stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PhiPurpose {
    /// Materialized value of an object
    Materialized(VirtualId),
    /// One entry of a virtual object
    Entry(VirtualId, usize),
    /// A read cache value
    ReadCache(ReadCacheKey),
}

/// Store emitted after a group of cyclic objects has been allocated
struct DeferredStore {
    object: NodeId,
    layout: LayoutId,
    is_array: bool,
    index: usize,
    kind: ValueKind,
    value: NodeId,
}

pub struct PartialEscapeClosure<'g> {
    pub(crate) graph: &'g Graph,
    pub(crate) cfg: &'g ControlFlowGraph,
    pub(crate) config: &'g PeaConfig,
    usages: FxHashMap<NodeId, Vec<NodeId>>,

    /// Next id handed out for nodes created by this sweep
    next_id: u32,
    created: FxHashMap<NodeId, Node>,

    virtual_objects: Vec<VirtualObjectDescriptor>,
    virtual_by_node: FxHashMap<NodeId, VirtualId>,
    /// Allocations keep their virtual object across loop rounds
    allocation_virtuals: FxHashMap<NodeId, VirtualId>,
    /// Value objects created for phis of identity-free objects
    phi_virtuals: FxHashMap<NodeId, VirtualId>,
    /// Graph nodes that stand for a virtual object. Not path sensitive: the
    /// block state decides whether the object is still virtual.
    aliases: FxHashMap<NodeId, VirtualId>,
    has_virtual_inputs: FxHashSet<NodeId>,

    constants: FxHashMap<Constant, NodeId>,
    phis: FxHashMap<(BlockId, PhiPurpose, ValueKind), NodeId>,
    proxies: FxHashMap<(BlockId, NodeId), NodeId>,
    /// Constants and virtual object nodes, applied before any block
    preamble: EffectList,

    pub(crate) read_elimination: Option<ReadEliminationInfo>,
}

impl<'g> PartialEscapeClosure<'g> {
    pub fn new(graph: &'g Graph, cfg: &'g ControlFlowGraph, config: &'g PeaConfig) -> Self {
        let mut constants = FxHashMap::default();
        for (id, node) in graph.live_nodes() {
            if let Some(value) = node.as_constant() {
                constants.entry(value).or_insert(id);
            }
        }
        let read_elimination = config
            .read_elimination
            .then(|| ReadEliminationInfo::compute(graph, cfg));

        Self {
            graph,
            cfg,
            config,
            usages: graph.usages(),
            next_id: graph.next_id().0,
            created: FxHashMap::default(),
            virtual_objects: Vec::new(),
            virtual_by_node: FxHashMap::default(),
            allocation_virtuals: FxHashMap::default(),
            phi_virtuals: FxHashMap::default(),
            aliases: FxHashMap::default(),
            has_virtual_inputs: FxHashSet::default(),
            constants,
            phis: FxHashMap::default(),
            proxies: FxHashMap::default(),
            preamble: EffectList::new(),
            read_elimination,
        }
    }

    /// Hand back the effects that create shared constants and virtual
    /// object nodes
    pub fn into_preamble(self) -> EffectList {
        self.preamble
    }

    pub fn virtual_object_count(&self) -> usize {
        self.virtual_objects.len()
    }

    // === Nodes ===

    /// A graph node or a node created by this sweep
    pub(crate) fn node(&self, id: NodeId) -> &Node {
        if let Some(node) = self.graph.get(id) {
            return node;
        }
        match self.created.get(&id) {
            Some(node) => node,
            None => panic!("{} is unknown to the escape analysis", id),
        }
    }

    pub(crate) fn value_kind(&self, id: NodeId) -> ValueKind {
        self.node(id).value_kind
    }

    pub(crate) fn constant_value(&self, id: NodeId) -> Option<Constant> {
        self.node(id).as_constant()
    }

    pub(crate) fn is_phi_at(&self, id: NodeId, block: BlockId) -> bool {
        let node = self.node(id);
        matches!(node.kind, NodeKind::Phi) && node.block == Some(block)
    }

    fn reserve_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Reserve an id for `node` and remember it so later queries can see it
    pub(crate) fn create_node(&mut self, node: Node) -> NodeId {
        let id = self.reserve_id();
        self.created.insert(id, node);
        id
    }

    pub(crate) fn created_node(&self, id: NodeId) -> Node {
        self.node(id).clone()
    }

    pub(crate) fn constant(&mut self, value: Constant) -> NodeId {
        if let Some(&id) = self.constants.get(&value) {
            return id;
        }
        let node = Node::constant(value);
        let id = self.create_node(node.clone());
        self.preamble.add_floating_node(id, node);
        self.constants.insert(value, id);
        id
    }

    /// Phi at `block` for `purpose`, created on first request. Inputs start
    /// out pointing at the phi itself and are filled in by
    /// `InitializePhiInput` effects.
    pub(crate) fn phi_for(
        &mut self,
        block: BlockId,
        purpose: PhiPurpose,
        kind: ValueKind,
        arity: usize,
    ) -> NodeId {
        let key = (block, purpose, kind);
        if let Some(&phi) = self.phis.get(&key) {
            return phi;
        }
        let phi = self.reserve_id();
        let node = Node::phi(block, kind, &vec![phi; arity]);
        self.created.insert(phi, node);
        self.phis.insert(key, phi);
        phi
    }

    /// Proxy of `value` at a loop exit, placed at the start of the exit block
    pub(crate) fn proxy_for(&mut self, exit: BlockId, value: NodeId, effects: &mut EffectList) -> NodeId {
        // An earlier sweep may have placed this proxy already
        let graph = self.graph;
        let existing = graph.block(exit).nodes.iter().copied().find(|&id| {
            let node = graph.node(id);
            matches!(node.kind, NodeKind::Proxy) && node.inputs.first() == Some(&value)
        });
        if let Some(proxy) = existing {
            return proxy;
        }
        let proxy = match self.proxies.get(&(exit, value)) {
            Some(&proxy) => proxy,
            None => {
                let node = Node::proxy(exit, self.value_kind(value), value);
                let proxy = self.create_node(node);
                self.proxies.insert((exit, value), proxy);
                proxy
            }
        };
        let recorded = effects
            .iter()
            .any(|e| matches!(e, Effect::AddFixedNode { id, .. } if *id == proxy));
        if !recorded {
            let node = self.created_node(proxy);
            effects.add_fixed_node(proxy, node, InsertPoint::BlockStart(exit), "loop exit proxy");
        }
        proxy
    }

    // === Virtual objects and aliases ===

    pub(crate) fn descriptor(&self, id: VirtualId) -> &VirtualObjectDescriptor {
        &self.virtual_objects[id.0 as usize]
    }

    fn register_virtual(
        &mut self,
        layout: LayoutId,
        entry_kinds: Vec<ValueKind>,
        is_array: bool,
        has_identity: bool,
    ) -> VirtualId {
        let id = VirtualId(self.virtual_objects.len() as u32);
        let node = Node::new(
            NodeKind::VirtualObject {
                layout,
                object_id: id.0,
            },
            &[],
            ValueKind::Object,
        );
        let node_id = self.create_node(node.clone());
        self.preamble.add_floating_node(node_id, node);
        self.virtual_by_node.insert(node_id, id);
        self.virtual_objects.push(VirtualObjectDescriptor {
            id,
            node: node_id,
            layout,
            entry_kinds,
            is_array,
            has_identity,
        });
        trace!("registered virtual object {} as {}", id, node_id);
        id
    }

    pub(crate) fn virtual_for_allocation(&mut self, allocation: NodeId, layout: LayoutId) -> VirtualId {
        if let Some(&id) = self.allocation_virtuals.get(&allocation) {
            return id;
        }
        let graph = self.graph;
        let shape = graph.layout(layout);
        let id = self.register_virtual(
            layout,
            shape.entry_kinds.clone(),
            shape.is_array(),
            shape.has_identity,
        );
        self.allocation_virtuals.insert(allocation, id);
        id
    }

    /// Value object standing for a phi whose inputs are compatible virtual
    /// objects
    pub(crate) fn virtual_for_phi(&mut self, phi: NodeId, template: VirtualId) -> VirtualId {
        if let Some(&id) = self.phi_virtuals.get(&phi) {
            return id;
        }
        let template = self.descriptor(template).clone();
        let id = self.register_virtual(
            template.layout,
            template.entry_kinds,
            template.is_array,
            template.has_identity,
        );
        self.phi_virtuals.insert(phi, id);
        id
    }

    /// Virtual object a node stands for, regardless of the path
    pub(crate) fn virtual_of(&self, value: NodeId) -> Option<VirtualId> {
        self.aliases
            .get(&value)
            .or_else(|| self.virtual_by_node.get(&value))
            .copied()
    }

    /// Virtual object named by an entry value
    pub(crate) fn virtual_node(&self, value: NodeId) -> Option<VirtualId> {
        self.virtual_by_node.get(&value).copied()
    }

    /// Virtual object behind `value` that the state tracks, virtual or not
    pub(crate) fn resolve_virtual(&self, state: &BlockState, value: NodeId) -> Option<VirtualId> {
        self.virtual_of(state.scalar_alias(value))
            .filter(|id| state.has_object(*id))
    }

    /// The `VirtualObject` node of a virtual object, the materialized value
    /// of an escaped one, or the scalar alias of anything else
    pub(crate) fn alias_and_resolve(&self, state: &BlockState, value: NodeId) -> NodeId {
        let value = state.scalar_alias(value);
        match self.virtual_of(value).and_then(|id| state.object_state_opt(id).map(|os| (id, os))) {
            Some((id, object)) => object
                .materialized_value()
                .unwrap_or(self.descriptor(id).node),
            None => value,
        }
    }

    pub(crate) fn add_virtual_alias(&mut self, id: VirtualId, node: NodeId) {
        self.aliases.insert(node, id);
        if let Some(users) = self.usages.get(&node) {
            for &user in users {
                self.has_virtual_inputs.insert(user);
                // The owner of a frame state has to describe the object
                let is_state = matches!(
                    self.graph.get(user).map(|n| &n.kind),
                    Some(NodeKind::FrameState { .. })
                );
                if is_state {
                    if let Some(owners) = self.usages.get(&user) {
                        self.has_virtual_inputs.extend(owners.iter().copied());
                    }
                }
            }
        }
    }

    pub(crate) fn remove_alias(&mut self, node: NodeId) {
        self.aliases.remove(&node);
    }

    pub(crate) fn has_virtual_inputs(&self, node: NodeId) -> bool {
        self.has_virtual_inputs.contains(&node)
    }

    /// Whether `allocation` feeds nothing but `phi` and is not stored in any
    /// other virtual object of `state`
    pub(crate) fn is_single_usage_allocation(
        &self,
        allocation: NodeId,
        state: &BlockState,
        candidates: &[Option<VirtualId>],
    ) -> bool {
        let is_allocation = self
            .graph
            .get(allocation)
            .map(|n| n.is_allocation())
            .unwrap_or(false);
        if !is_allocation {
            return false;
        }
        if self.usages.get(&allocation).map(|u| u.len()) != Some(1) {
            return false;
        }
        let Some(id) = self.allocation_virtuals.get(&allocation) else {
            return false;
        };
        let node = self.descriptor(*id).node;
        candidates.iter().flatten().all(|candidate| {
            match state.object_state_opt(*candidate) {
                Some(object) if object.is_virtual() => !object.entries().contains(&node),
                _ => true,
            }
        })
    }

    // === Materialization ===

    pub(crate) fn materialized_value(&self, state: &BlockState, id: VirtualId) -> NodeId {
        match state.object_state(id).materialized_value() {
            Some(value) => value,
            None => panic!("{} is still virtual", id),
        }
    }

    /// Materialize `id` at `at` unless it already escaped on this path.
    /// Returns true if an allocation was emitted.
    pub(crate) fn ensure_materialized(
        &mut self,
        state: &mut BlockState,
        id: VirtualId,
        at: InsertPoint,
        effects: &mut EffectList,
        reason: MaterializeReason,
    ) -> bool {
        if !state.object_state(id).is_virtual() {
            return false;
        }
        trace!("materializing {} at {:?} ({})", id, at, reason.as_str());
        let mut in_progress = FxHashSet::default();
        let mut deferred = Vec::new();
        self.materialize_object(state, id, at, effects, reason, &mut in_progress, &mut deferred);
        for store in deferred {
            let node = if store.is_array {
                let index = self.constant(Constant::Int(store.index as i32));
                Node::new(
                    NodeKind::StoreIndexed { kind: store.kind },
                    &[store.object, index, store.value],
                    ValueKind::Void,
                )
            } else {
                Node::new(
                    NodeKind::StoreField {
                        field: FieldRef::new(store.layout, store.index as u32),
                    },
                    &[store.object, store.value],
                    ValueKind::Void,
                )
            };
            let id = self.create_node(node.clone());
            effects.add_fixed_node(id, node, at, "deferred store");
        }
        true
    }

    /// Emit the allocation of `id` and of every virtual object it refers
    /// to. Cyclic references get the default value and a deferred store.
    #[allow(clippy::too_many_arguments)]
    fn materialize_object(
        &mut self,
        state: &mut BlockState,
        id: VirtualId,
        at: InsertPoint,
        effects: &mut EffectList,
        reason: MaterializeReason,
        in_progress: &mut FxHashSet<VirtualId>,
        deferred: &mut Vec<DeferredStore>,
    ) -> NodeId {
        let value = self.reserve_id();
        let object = state.object_state(id).clone();
        let descriptor = self.descriptor(id).clone();
        in_progress.insert(id);
        state.object_state_mut(id).escape(value);

        let mut inputs = Vec::with_capacity(object.entries().len());
        for (index, &entry) in object.entries().iter().enumerate() {
            let target = self.virtual_node(entry).filter(|t| state.has_object(*t));
            let resolved = match target {
                Some(target) if in_progress.contains(&target) => {
                    let kind = descriptor.entry_kind(index);
                    deferred.push(DeferredStore {
                        object: value,
                        layout: descriptor.layout,
                        is_array: descriptor.is_array,
                        index,
                        kind,
                        value: self.materialized_value(state, target),
                    });
                    self.constant(kind.default_constant())
                }
                Some(target) => match state.object_state(target).materialized_value() {
                    Some(materialized) => materialized,
                    None => self.materialize_object(
                        state,
                        target,
                        at,
                        effects,
                        reason,
                        in_progress,
                        deferred,
                    ),
                },
                None => entry,
            };
            inputs.push(resolved);
        }

        let node = Node::new(
            NodeKind::Materialize {
                layout: descriptor.layout,
                locks: object.locks().to_vec(),
            },
            &inputs,
            ValueKind::Object,
        );
        self.created.insert(value, node.clone());
        effects.add_fixed_node(value, node, at, reason.as_str());
        in_progress.remove(&id);
        self.update_states_for_materialized(state, id, value);
        value
    }

    /// Replace references to the object's virtual node in other virtual
    /// objects with its materialized value
    fn update_states_for_materialized(&self, state: &mut BlockState, id: VirtualId, value: NodeId) {
        let node = self.descriptor(id).node;
        let ids: Vec<VirtualId> = state.object_ids().collect();
        for other in ids {
            let positions: Vec<usize> = match state.object_state_opt(other) {
                Some(object) if object.is_virtual() => object
                    .entries()
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| **entry == node)
                    .map(|(index, _)| index)
                    .collect(),
                _ => continue,
            };
            for index in positions {
                state.set_entry(other, index, value);
            }
        }
    }

    // === Node processing ===

    fn process_node(&mut self, id: NodeId, state: &mut BlockState, effects: &mut EffectList) {
        let graph = self.graph;
        let node = graph.node(id);
        let marked = self.has_virtual_inputs.contains(&id);

        if node.is_allocation() || (marked && is_virtualizable(node)) {
            let mut tool = VirtualizerToolImpl::new(self, state, effects, id);
            virtualize_node(node, graph, &mut tool);
            if tool.is_deleted() {
                trace!("virtualized {} {:?}", id, node.kind);
                return;
            }
        }

        if marked {
            self.process_node_inputs(id, node, state, effects);
        }
        if let Some(frame_state) = node.state {
            let locked = state.objects().any(|(_, o)| o.is_virtual() && o.has_locks());
            if marked || locked {
                self.process_node_with_state(frame_state, state, effects);
            }
        }
        if self.read_elimination.is_some() {
            self.process_read_elimination(id, node, state, effects);
        }
    }

    /// Materialize virtual inputs of a node that cannot handle them
    fn process_node_inputs(
        &mut self,
        id: NodeId,
        node: &Node,
        state: &mut BlockState,
        effects: &mut EffectList,
    ) {
        for &input in node.inputs.iter() {
            let Some(object) = self.virtual_of(input).filter(|o| state.has_object(*o)) else {
                continue;
            };
            self.ensure_materialized(
                state,
                object,
                InsertPoint::Before(id),
                effects,
                MaterializeReason::Unhandled,
            );
            let value = self.materialized_value(state, object);
            effects.replace_first_input(id, input, value);
        }
    }

    /// Describe every virtual object the frame state can observe
    fn process_node_with_state(
        &mut self,
        frame_state: NodeId,
        state: &BlockState,
        effects: &mut EffectList,
    ) {
        let graph = self.graph;
        let fs = graph.node(frame_state);
        let mut objects: Vec<VirtualId> = Vec::new();

        for &value in fs.inputs.iter() {
            let Some(object) = self.virtual_of(value).filter(|o| state.has_object(*o)) else {
                continue;
            };
            let node = self.descriptor(object).node;
            if value != node {
                effects.replace_first_input(frame_state, value, node);
            }
            if !objects.contains(&object) {
                objects.push(object);
            }
        }
        for (object, os) in state.objects() {
            if os.is_virtual() && os.has_locks() && !objects.contains(&object) {
                objects.push(object);
            }
        }

        // Objects reachable through entries of virtual objects
        let mut next = 0;
        while next < objects.len() {
            let os = state.object_state(objects[next]);
            if os.is_virtual() {
                for &entry in os.entries() {
                    if let Some(target) = self.virtual_node(entry) {
                        if state.has_object(target) && !objects.contains(&target) {
                            objects.push(target);
                        }
                    }
                }
            }
            next += 1;
        }

        let existing: &[VirtualMapping] = match &fs.kind {
            NodeKind::FrameState { mappings, .. } => mappings,
            _ => &[],
        };
        for object in objects {
            let os = state.object_state(object);
            let node = self.descriptor(object).node;
            let mapping = match os.materialized_value() {
                Some(value) => VirtualMapping::Materialized {
                    object: node,
                    value,
                },
                None => VirtualMapping::Virtual {
                    object: node,
                    values: os.entries().to_vec(),
                },
            };
            if !existing.contains(&mapping) {
                effects.add_virtual_mapping(frame_state, mapping);
            }
        }
    }

    // === Loops ===

    /// Header phis whose forward input is virtual start out as aliases of
    /// that object
    fn alias_loop_phis(&mut self, info: &LoopInfo, state: &BlockState) {
        let graph = self.graph;
        for &phi in &graph.block(info.header).phis {
            let Some(&forward) = graph.node(phi).inputs.first() else {
                continue;
            };
            let alias = self.alias_and_resolve(state, forward);
            match self.virtual_node(alias) {
                Some(object) => self.add_virtual_alias(object, phi),
                None => self.remove_alias(phi),
            }
        }
    }

    /// Rename values of objects that leave the loop through `exit`
    fn proxy_loop_exit_objects(
        &mut self,
        info: &LoopInfo,
        exit: BlockId,
        entry_state: &BlockState,
        exit_state: &mut BlockState,
        effects: &mut EffectList,
    ) {
        let ids: Vec<VirtualId> = exit_state.object_ids().collect();
        for object in ids {
            let exit_object = exit_state.object_state(object).clone();
            let initial = entry_state.object_state_opt(object);
            if exit_object.is_virtual() {
                for (index, &value) in exit_object.entries().iter().enumerate() {
                    if self.virtual_node(value).is_some() || self.constant_value(value).is_some() {
                        continue;
                    }
                    let unchanged = match initial {
                        Some(initial) if initial.is_virtual() => initial.entry(index) == value,
                        _ => false,
                    };
                    if !unchanged || self.is_phi_at(value, info.header) {
                        let proxy = self.proxy_for(exit, value, effects);
                        exit_state.set_entry(object, index, proxy);
                    }
                }
            } else {
                let value = self.materialized_value(exit_state, object);
                let unchanged = match initial.and_then(|i| i.materialized_value()) {
                    Some(initial) => initial == value,
                    None => false,
                };
                if !unchanged {
                    let proxy = self.proxy_for(exit, value, effects);
                    exit_state
                        .object_state_mut(object)
                        .update_materialized_value(proxy);
                }
            }
        }
    }
}

impl<'g> EffectsClosure for PartialEscapeClosure<'g> {
    type State = BlockState;

    fn initial_state(&mut self) -> BlockState {
        BlockState::new()
    }

    fn process_block(&mut self, block: BlockId, state: &mut BlockState, effects: &mut EffectList) {
        let cfg = self.cfg;
        for &node in cfg.nodes(block) {
            self.process_node(node, state, effects);
        }
    }

    fn merge(
        &mut self,
        merge: BlockId,
        states: &mut [BlockState],
        block_effects: &mut BlockEffects,
    ) -> MergeOutcome<BlockState> {
        let predecessors = self.cfg.predecessors(merge).to_vec();
        let mut processor = MergeProcessor::new(merge, predecessors);
        self.merge_states(&mut processor, states, block_effects);
        processor.into_outcome()
    }

    fn strip_killed_loop_locations(&mut self, info: &LoopInfo, state: &mut BlockState) {
        if let Some(reads) = &self.read_elimination {
            reads.strip_killed_locations(info.header, state);
        }
    }

    fn process_initial_loop_state(&mut self, info: &LoopInfo, state: &mut BlockState) {
        self.alias_loop_phis(info, state);
        if self.read_elimination.is_some() {
            self.seed_loop_phi_reads(info, state);
        }
    }

    fn process_loop_exit(
        &mut self,
        info: &LoopInfo,
        exit: BlockId,
        entry_state: &BlockState,
        exit_state: &mut BlockState,
        effects: &mut EffectList,
    ) {
        self.proxy_loop_exit_objects(info, exit, entry_state, exit_state, effects);
        if self.read_elimination.is_some() {
            self.proxy_loop_exit_reads(exit, entry_state, exit_state, effects);
        }
    }

    fn equivalent(&self, a: &BlockState, b: &BlockState) -> bool {
        a.equivalent_to(b)
    }
}
