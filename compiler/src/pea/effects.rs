//! Deferred graph mutations
//!
//! The analysis never touches the graph while it walks it. Every proposed
//! change is recorded as an [`Effect`] in an [`EffectList`]; the lists of a
//! sweep are replayed in block order once traversal has finished. Nodes
//! created by the analysis get their ids reserved up front so later effects
//! can refer to them before they exist.

use crate::ir::{BlockId, Graph, Node, NodeId, NodeKind, VirtualMapping};
use fxhash::{FxHashMap, FxHashSet};
use tracing::trace;

/// Where a new scheduled node is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    /// Immediately before a scheduled node or terminator
    Before(NodeId),
    BlockStart(BlockId),
    BlockEnd(BlockId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    AddFloatingNode { id: NodeId, node: Node },
    /// `reason` names the transformation that created the node
    AddFixedNode { id: NodeId, node: Node, at: InsertPoint, reason: &'static str },
    /// The phi's block is taken from the node
    AddPhi { id: NodeId, node: Node },
    DeleteNode { node: NodeId },
    ReplaceAtUsages { node: NodeId, replacement: NodeId },
    ReplaceFirstInput { node: NodeId, old: NodeId, new: NodeId },
    InitializePhiInput { phi: NodeId, index: usize, value: NodeId },
    /// Attach or refresh the description of a virtual object on a frame state
    AddVirtualMapping { state: NodeId, mapping: VirtualMapping },
}

impl Effect {
    fn name(&self) -> &'static str {
        match self {
            Effect::AddFloatingNode { .. } => "add floating node",
            Effect::AddFixedNode { .. } => "add fixed node",
            Effect::AddPhi { .. } => "add phi",
            Effect::DeleteNode { .. } => "delete node",
            Effect::ReplaceAtUsages { .. } => "replace at usages",
            Effect::ReplaceFirstInput { .. } => "replace first input",
            Effect::InitializePhiInput { .. } => "initialize phi input",
            Effect::AddVirtualMapping { .. } => "add virtual mapping",
        }
    }
}

/// Position in an effect list that can be rolled back to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectList {
    effects: Vec<Effect>,
}

impl EffectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Effect> {
        self.effects.iter()
    }

    pub fn record(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.effects.len())
    }

    /// Drop every effect recorded after `checkpoint`
    pub fn truncate(&mut self, checkpoint: Checkpoint) {
        self.effects.truncate(checkpoint.0);
    }

    pub fn clear(&mut self) {
        self.effects.clear();
    }

    /// Move all of `other` to the end of this list
    pub fn append(&mut self, other: &mut EffectList) {
        self.effects.append(&mut other.effects);
    }

    /// Move all of `other` into this list starting at `index`
    pub fn insert_all(&mut self, index: usize, other: EffectList) {
        let tail = self.effects.split_off(index);
        self.effects.extend(other.effects);
        self.effects.extend(tail);
    }

    // === Recording helpers ===

    pub fn add_floating_node(&mut self, id: NodeId, node: Node) {
        self.record(Effect::AddFloatingNode { id, node });
    }

    pub fn add_fixed_node(&mut self, id: NodeId, node: Node, at: InsertPoint, reason: &'static str) {
        self.record(Effect::AddFixedNode { id, node, at, reason });
    }

    pub fn add_phi(&mut self, id: NodeId, node: Node) {
        self.record(Effect::AddPhi { id, node });
    }

    pub fn delete_node(&mut self, node: NodeId) {
        self.record(Effect::DeleteNode { node });
    }

    pub fn replace_at_usages(&mut self, node: NodeId, replacement: NodeId) {
        self.record(Effect::ReplaceAtUsages { node, replacement });
    }

    pub fn replace_first_input(&mut self, node: NodeId, old: NodeId, new: NodeId) {
        self.record(Effect::ReplaceFirstInput { node, old, new });
    }

    pub fn initialize_phi_input(&mut self, phi: NodeId, index: usize, value: NodeId) {
        self.record(Effect::InitializePhiInput { phi, index, value });
    }

    pub fn add_virtual_mapping(&mut self, state: NodeId, mapping: VirtualMapping) {
        self.record(Effect::AddVirtualMapping { state, mapping });
    }

    /// Replay the effects in order against `graph`
    pub fn apply(&self, graph: &mut Graph, ctx: &mut ApplyContext) {
        for effect in &self.effects {
            trace!("apply {}: {:?}", effect.name(), effect);
            ctx.apply_one(graph, effect);
        }
    }
}

/// Result of applying a sweep's effects
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Nodes deleted by the effects
    pub obsolete: Vec<NodeId>,
    /// Live nodes that were added or had inputs rewritten
    pub touched: FxHashSet<NodeId>,
}

/// Bookkeeping shared by all effect lists applied in one sweep
#[derive(Debug, Default)]
pub struct ApplyContext {
    forwarded: FxHashMap<NodeId, NodeId>,
    obsolete: Vec<NodeId>,
    touched: FxHashSet<NodeId>,
}

impl ApplyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow replacements recorded earlier in this sweep
    fn resolve(&self, mut id: NodeId) -> NodeId {
        while let Some(&next) = self.forwarded.get(&id) {
            if next == id {
                break;
            }
            id = next;
        }
        id
    }

    fn resolve_node(&self, mut node: Node) -> Node {
        for input in node.inputs.iter_mut() {
            *input = self.resolve(*input);
        }
        if let Some(state) = node.state {
            node.state = Some(self.resolve(state));
        }
        node
    }

    fn resolve_mapping(&self, mapping: &VirtualMapping) -> VirtualMapping {
        match mapping {
            VirtualMapping::Virtual { object, values } => VirtualMapping::Virtual {
                object: *object,
                values: values.iter().map(|v| self.resolve(*v)).collect(),
            },
            VirtualMapping::Materialized { object, value } => VirtualMapping::Materialized {
                object: *object,
                value: self.resolve(*value),
            },
        }
    }

    fn apply_one(&mut self, graph: &mut Graph, effect: &Effect) {
        match effect {
            Effect::AddFloatingNode { id, node } => {
                graph.insert_node(*id, self.resolve_node(node.clone()));
                self.touched.insert(*id);
            }
            Effect::AddFixedNode { id, node, at, .. } => {
                graph.insert_node(*id, self.resolve_node(node.clone()));
                match *at {
                    InsertPoint::Before(anchor) => graph.schedule_before(anchor, *id),
                    InsertPoint::BlockStart(block) => graph.schedule_at_start(block, *id),
                    InsertPoint::BlockEnd(block) => graph.schedule_at_end(block, *id),
                }
                self.touched.insert(*id);
            }
            Effect::AddPhi { id, node } => {
                let block = match node.block {
                    Some(block) => block,
                    None => panic!("phi {} recorded without a block", id),
                };
                graph.insert_node(*id, self.resolve_node(node.clone()));
                graph.add_phi_to_block(block, *id);
                self.touched.insert(*id);
            }
            Effect::DeleteNode { node } => {
                if !self.obsolete.contains(node) {
                    self.obsolete.push(*node);
                }
            }
            Effect::ReplaceAtUsages { node, replacement } => {
                let replacement = self.resolve(*replacement);
                self.touched.extend(graph.replace_at_usages(*node, replacement));
                self.forwarded.insert(*node, replacement);
            }
            Effect::ReplaceFirstInput { node, old, new } => {
                let new = self.resolve(*new);
                if graph.node_mut(*node).replace_first_input(*old, new) {
                    self.touched.insert(*node);
                } else {
                    trace!("{} no longer uses {}", node, old);
                }
            }
            Effect::InitializePhiInput { phi, index, value } => {
                let value = self.resolve(*value);
                graph.node_mut(*phi).inputs[*index] = value;
                self.touched.insert(*phi);
            }
            Effect::AddVirtualMapping { state, mapping } => {
                let mapping = self.resolve_mapping(mapping);
                if let NodeKind::FrameState { mappings, .. } = &mut graph.node_mut(*state).kind {
                    match mappings.iter_mut().find(|m| m.object() == mapping.object()) {
                        Some(existing) => *existing = mapping,
                        None => mappings.push(mapping),
                    }
                }
                self.touched.insert(*state);
            }
        }
    }

    /// Remove the obsolete nodes and report what changed.
    pub fn finish(mut self, graph: &mut Graph) -> ApplyOutcome {
        for &node in &self.obsolete {
            graph.remove(node);
            self.touched.remove(&node);
        }
        self.touched.retain(|id| graph.is_alive(*id));
        ApplyOutcome {
            obsolete: self.obsolete,
            touched: self.touched,
        }
    }
}
