//! Per-node virtualization rules
//!
//! Each node kind that can operate on a virtual object describes its effect
//! through a [`VirtualizerTool`]. A rule either rewrites the node (replacing
//! it with a value, with a virtual object, or deleting it) or leaves it
//! alone, in which case the caller materializes the node's virtual inputs.

use super::effects::EffectList;
use super::escape::PartialEscapeClosure;
use super::state::{BlockState, LockList, ObjectState, VirtualId, VirtualObjectDescriptor};
use crate::ir::{Constant, Graph, LayoutId, Node, NodeId, NodeKind, ValueKind};
use tracing::trace;

/// Operations a virtualization rule may perform on the current node
pub trait VirtualizerTool {
    /// Resolve a value: the `VirtualObject` node of a still virtual object,
    /// the materialized value of an escaped one, or the value itself
    fn alias(&self, value: NodeId) -> NodeId;

    /// Virtual object a value stands for, if it is still virtual here
    fn virtual_object(&self, value: NodeId) -> Option<VirtualId>;

    fn descriptor(&self, id: VirtualId) -> &VirtualObjectDescriptor;
    fn entry(&self, id: VirtualId, index: usize) -> NodeId;
    fn set_entry(&mut self, id: VirtualId, index: usize, value: NodeId);
    fn value_kind(&self, value: NodeId) -> ValueKind;
    fn constant_value(&self, value: NodeId) -> Option<Constant>;
    fn constant(&mut self, value: Constant) -> NodeId;

    fn add_lock(&mut self, id: VirtualId, lock: u32);
    fn remove_lock(&mut self, id: VirtualId) -> Option<u32>;

    /// Register a fresh virtual object for the current allocation, holding
    /// `locks` from the start
    fn create_virtual_object(
        &mut self,
        layout: LayoutId,
        entries: Vec<NodeId>,
        locks: LockList,
    ) -> VirtualId;
    fn replace_with_virtual(&mut self, id: VirtualId);
    fn replace_with_value(&mut self, value: NodeId);
    fn delete(&mut self);

    /// Rewrite the first use of `old` by the current node to `new`
    fn replace_input(&mut self, old: NodeId, new: NodeId);

    fn max_virtualization_length(&self) -> usize;
}

/// [`VirtualizerTool`] bound to one node visit
pub(crate) struct VirtualizerToolImpl<'a, 'g> {
    closure: &'a mut PartialEscapeClosure<'g>,
    state: &'a mut BlockState,
    effects: &'a mut EffectList,
    current: NodeId,
    deleted: bool,
}

impl<'a, 'g> VirtualizerToolImpl<'a, 'g> {
    pub(crate) fn new(
        closure: &'a mut PartialEscapeClosure<'g>,
        state: &'a mut BlockState,
        effects: &'a mut EffectList,
        current: NodeId,
    ) -> Self {
        Self {
            closure,
            state,
            effects,
            current,
            deleted: false,
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl VirtualizerTool for VirtualizerToolImpl<'_, '_> {
    fn alias(&self, value: NodeId) -> NodeId {
        self.closure.alias_and_resolve(self.state, value)
    }

    fn virtual_object(&self, value: NodeId) -> Option<VirtualId> {
        self.closure
            .resolve_virtual(self.state, value)
            .filter(|id| self.state.object_state(*id).is_virtual())
    }

    fn descriptor(&self, id: VirtualId) -> &VirtualObjectDescriptor {
        self.closure.descriptor(id)
    }

    fn entry(&self, id: VirtualId, index: usize) -> NodeId {
        self.state.object_state(id).entry(index)
    }

    fn set_entry(&mut self, id: VirtualId, index: usize, value: NodeId) {
        self.state.set_entry(id, index, value);
    }

    fn value_kind(&self, value: NodeId) -> ValueKind {
        self.closure.value_kind(value)
    }

    fn constant_value(&self, value: NodeId) -> Option<Constant> {
        self.closure.constant_value(value)
    }

    fn constant(&mut self, value: Constant) -> NodeId {
        self.closure.constant(value)
    }

    fn add_lock(&mut self, id: VirtualId, lock: u32) {
        self.state.object_state_mut(id).add_lock(lock);
    }

    fn remove_lock(&mut self, id: VirtualId) -> Option<u32> {
        self.state.object_state_mut(id).remove_lock()
    }

    fn create_virtual_object(
        &mut self,
        layout: LayoutId,
        entries: Vec<NodeId>,
        locks: LockList,
    ) -> VirtualId {
        let id = self.closure.virtual_for_allocation(self.current, layout);
        self.state.add_object(id, ObjectState::new_virtual(entries, locks));
        id
    }

    fn replace_with_virtual(&mut self, id: VirtualId) {
        self.closure.add_virtual_alias(id, self.current);
        self.delete();
    }

    fn replace_with_value(&mut self, value: NodeId) {
        if let Some(id) = self.closure.virtual_of(value) {
            self.replace_with_virtual(id);
            return;
        }
        self.effects.replace_at_usages(self.current, value);
        self.state.add_scalar_alias(self.current, value);
        self.delete();
    }

    fn delete(&mut self) {
        self.effects.delete_node(self.current);
        self.deleted = true;
    }

    fn replace_input(&mut self, old: NodeId, new: NodeId) {
        self.effects.replace_first_input(self.current, old, new);
    }

    fn max_virtualization_length(&self) -> usize {
        self.closure.config.max_virtualization_length
    }
}

/// Whether a node kind has a rule at all
pub(crate) fn is_virtualizable(node: &Node) -> bool {
    matches!(
        node.kind,
        NodeKind::NewInstance { .. }
            | NodeKind::NewArray { .. }
            | NodeKind::LoadField { .. }
            | NodeKind::StoreField { .. }
            | NodeKind::LoadIndexed { .. }
            | NodeKind::StoreIndexed { .. }
            | NodeKind::ArrayLength
            | NodeKind::MonitorEnter { .. }
            | NodeKind::MonitorExit { .. }
            | NodeKind::ObjectEquals
            | NodeKind::IsNull
            | NodeKind::Proxy
    )
}

/// Apply the rule for `node`. Nodes the rule cannot handle are left alone.
pub(crate) fn virtualize_node(node: &Node, graph: &Graph, tool: &mut dyn VirtualizerTool) {
    match &node.kind {
        NodeKind::NewInstance { layout } | NodeKind::NewArray { layout } => {
            let kinds = &graph.layout(*layout).entry_kinds;
            if kinds.len() > tool.max_virtualization_length() {
                trace!("allocation of {} entries is too large to virtualize", kinds.len());
                return;
            }
            let entries = kinds
                .iter()
                .map(|kind| tool.constant(kind.default_constant()))
                .collect();
            let id = tool.create_virtual_object(*layout, entries, LockList::new());
            tool.replace_with_virtual(id);
        }
        NodeKind::LoadField { field } => {
            if let Some(id) = tool.virtual_object(node.inputs[0]) {
                if tool.descriptor(id).is_array {
                    return;
                }
                let value = tool.entry(id, field.index as usize);
                tool.replace_with_value(value);
            }
        }
        NodeKind::StoreField { field } => {
            if let Some(id) = tool.virtual_object(node.inputs[0]) {
                if tool.descriptor(id).is_array {
                    return;
                }
                let value = tool.alias(node.inputs[1]);
                tool.set_entry(id, field.index as usize, value);
                tool.delete();
            }
        }
        NodeKind::LoadIndexed { kind } => {
            let Some(id) = tool.virtual_object(node.inputs[0]) else {
                return;
            };
            let Some(index) = constant_index(tool, id, node.inputs[1]) else {
                return;
            };
            if let Some(value) = read_indexed(tool, id, index, *kind) {
                tool.replace_with_value(value);
            }
        }
        NodeKind::StoreIndexed { kind } => {
            let Some(id) = tool.virtual_object(node.inputs[0]) else {
                return;
            };
            let Some(index) = constant_index(tool, id, node.inputs[1]) else {
                return;
            };
            let value = tool.alias(node.inputs[2]);
            if write_indexed(tool, id, index, *kind, value) {
                tool.delete();
            }
        }
        NodeKind::ArrayLength => {
            if let Some(id) = tool.virtual_object(node.inputs[0]) {
                if tool.descriptor(id).is_array {
                    let length = tool.descriptor(id).entry_count() as i32;
                    let value = tool.constant(Constant::Int(length));
                    tool.replace_with_value(value);
                }
            }
        }
        NodeKind::MonitorEnter { lock } => {
            if let Some(id) = tool.virtual_object(node.inputs[0]) {
                tool.add_lock(id, *lock);
                tool.delete();
            }
        }
        NodeKind::MonitorExit { lock } => {
            if let Some(id) = tool.virtual_object(node.inputs[0]) {
                match tool.remove_lock(id) {
                    Some(held) if held == *lock => {}
                    held => trace!("unbalanced unlock of {}: expected {}, held {:?}", id, lock, held),
                }
                tool.delete();
            }
        }
        NodeKind::ObjectEquals => {
            let x = tool.virtual_object(node.inputs[0]);
            let y = tool.virtual_object(node.inputs[1]);
            let result = match (x, y) {
                (Some(a), Some(b)) if a == b => Some(1),
                (Some(a), Some(b)) => {
                    // Two identity-free objects may still compare equal by value
                    if tool.descriptor(a).has_identity || tool.descriptor(b).has_identity {
                        Some(0)
                    } else {
                        None
                    }
                }
                (Some(a), None) | (None, Some(a)) => {
                    if tool.descriptor(a).has_identity {
                        Some(0)
                    } else {
                        None
                    }
                }
                (None, None) => None,
            };
            if let Some(result) = result {
                let value = tool.constant(Constant::Int(result));
                tool.replace_with_value(value);
            }
        }
        NodeKind::IsNull => {
            if tool.virtual_object(node.inputs[0]).is_some() {
                let value = tool.constant(Constant::Int(0));
                tool.replace_with_value(value);
            }
        }
        NodeKind::Proxy => {
            if let Some(id) = tool.virtual_object(node.inputs[0]) {
                tool.replace_with_virtual(id);
            }
        }
        _ => {}
    }
}

fn constant_index(tool: &dyn VirtualizerTool, id: VirtualId, index: NodeId) -> Option<usize> {
    let index = tool.constant_value(tool.alias(index))?.as_int()?;
    if index < 0 || index as usize >= tool.descriptor(id).entry_count() {
        return None;
    }
    Some(index as usize)
}

/// Read an element, splicing wide values out of int slot pairs
fn read_indexed(
    tool: &mut dyn VirtualizerTool,
    id: VirtualId,
    index: usize,
    kind: ValueKind,
) -> Option<NodeId> {
    let entry_kind = tool.descriptor(id).entry_kind(index);
    let value = tool.entry(id, index);
    let value_kind = tool.value_kind(value);
    if entry_kind == kind {
        // Either half of a wide value cannot be read as a narrow one
        let split = entry_kind == ValueKind::Int
            && (value_kind.needs_two_slots() || value_kind == ValueKind::Illegal);
        return (!split).then_some(value);
    }
    if kind.needs_two_slots() && entry_kind == ValueKind::Int {
        if index + 1 >= tool.descriptor(id).entry_count() {
            return None;
        }
        if value_kind == kind {
            return Some(value);
        }
        let next = tool.entry(id, index + 1);
        if is_int_zero(tool, value) && is_int_zero(tool, next) {
            return Some(tool.constant(kind.default_constant()));
        }
    }
    None
}

/// Write an element. Wide writes into int slots occupy two slots.
fn write_indexed(
    tool: &mut dyn VirtualizerTool,
    id: VirtualId,
    index: usize,
    kind: ValueKind,
    value: NodeId,
) -> bool {
    let entry_kind = tool.descriptor(id).entry_kind(index);
    if entry_kind != ValueKind::Int {
        if entry_kind != kind {
            return false;
        }
        tool.set_entry(id, index, value);
        return true;
    }
    // Partially overwriting a wide value stored in an int slot pair is not tracked
    let current = tool.value_kind(tool.entry(id, index));
    if index > 0 && tool.value_kind(tool.entry(id, index - 1)).needs_two_slots() {
        return false;
    }
    if kind == ValueKind::Int {
        if current.needs_two_slots() {
            return false;
        }
        tool.set_entry(id, index, value);
        return true;
    }
    if !kind.needs_two_slots() || index + 1 >= tool.descriptor(id).entry_count() {
        return false;
    }
    if current.needs_two_slots() && current != kind {
        return false;
    }
    if tool.value_kind(tool.entry(id, index + 1)).needs_two_slots() {
        return false;
    }
    let illegal = tool.constant(Constant::Illegal);
    tool.set_entry(id, index, value);
    tool.set_entry(id, index + 1, illegal);
    true
}

fn is_int_zero(tool: &dyn VirtualizerTool, value: NodeId) -> bool {
    tool.constant_value(value) == Some(Constant::Int(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::schedule::{BlockScheduler, Scheduler};
    use crate::ir::{FieldRef, GraphBuilder, ObjectLayout};
    use crate::pea::config::PeaConfig;
    use crate::pea::effects::Effect;
    use smallvec::smallvec;

    #[test]
    fn test_tool_creates_locked_object_and_rewrites_inputs() {
        let mut b = GraphBuilder::new("tool");
        let layout = b.layout(ObjectLayout::instance("Box", vec![ValueKind::Int]));
        let x = b.param(0, ValueKind::Int);
        let y = b.param(1, ValueKind::Int);
        let o = b.new_instance(layout);
        let store = b.store_field(o, FieldRef::new(layout, 0), x);
        b.ret(None);
        let graph = b.finish();
        let cfg = BlockScheduler::new().schedule(&graph).unwrap();
        let config = PeaConfig::default();
        let mut closure = PartialEscapeClosure::new(&graph, &cfg, &config);
        let mut state = BlockState::new();
        let mut effects = EffectList::new();

        let mut tool = VirtualizerToolImpl::new(&mut closure, &mut state, &mut effects, o);
        let zero = tool.constant(Constant::Int(0));
        let id = tool.create_virtual_object(layout, vec![zero], smallvec![7, 9]);
        assert_eq!(tool.entry(id, 0), zero);

        let mut tool = VirtualizerToolImpl::new(&mut closure, &mut state, &mut effects, store);
        tool.replace_input(x, y);
        assert!(!tool.is_deleted());

        let object = state.object_state(id);
        assert!(object.is_virtual());
        assert_eq!(object.locks(), &[7, 9]);
        let rewrites: Vec<&Effect> = effects
            .iter()
            .filter(|e| matches!(e, Effect::ReplaceFirstInput { .. }))
            .collect();
        assert_eq!(
            rewrites,
            vec![&Effect::ReplaceFirstInput {
                node: store,
                old: x,
                new: y
            }]
        );
    }
}
