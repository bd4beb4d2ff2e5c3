//! Graph builder
//!
//! Convenience interface for constructing scheduled graphs in tests, benches
//! and debug tools. The builder keeps a current block and appends nodes to
//! it in program order.

use super::{
    BinaryOp, BlockId, CompareOp, Constant, FieldRef, Graph, LayoutId, LocationIdentity, Node,
    NodeId, NodeKind, ObjectLayout, ValueKind,
};
use tracing::trace;

pub struct GraphBuilder {
    graph: Graph,
    current_block: BlockId,
    next_bci: u32,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let graph = Graph::new(name);
        let current_block = graph.entry();
        Self {
            graph,
            current_block,
            next_bci: 0,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn finish(self) -> Graph {
        self.graph
    }

    // === Layouts and blocks ===

    pub fn layout(&mut self, layout: ObjectLayout) -> LayoutId {
        self.graph.add_layout(layout)
    }

    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        self.graph.add_block(name)
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    fn append(&mut self, node: Node) -> NodeId {
        let id = self.graph.append(self.current_block, node);
        trace!("built {} in {}", id, self.current_block);
        id
    }

    // === Floating values ===

    pub fn param(&mut self, index: u32, kind: ValueKind) -> NodeId {
        self.graph
            .add_floating(Node::new(NodeKind::Parameter { index }, &[], kind))
    }

    pub fn constant(&mut self, value: Constant) -> NodeId {
        match self.graph.find_constant(value) {
            Some(existing) => existing,
            None => self.graph.add_floating(Node::constant(value)),
        }
    }

    pub fn int(&mut self, value: i32) -> NodeId {
        self.constant(Constant::Int(value))
    }

    pub fn long(&mut self, value: i64) -> NodeId {
        self.constant(Constant::Long(value))
    }

    pub fn null(&mut self) -> NodeId {
        self.constant(Constant::Null)
    }

    /// Frame state describing the given live values
    pub fn frame_state(&mut self, live: &[NodeId]) -> NodeId {
        let bci = self.next_bci;
        self.next_bci += 1;
        self.graph.add_floating(Node::new(
            NodeKind::FrameState {
                bci,
                mappings: Vec::new(),
            },
            live,
            ValueKind::Void,
        ))
    }

    /// Add a phi to `block`. Inputs may be patched later with
    /// [`GraphBuilder::set_phi_input`] once back edges exist.
    pub fn phi(&mut self, block: BlockId, kind: ValueKind, inputs: &[NodeId]) -> NodeId {
        self.graph.append(block, Node::phi(block, kind, inputs))
    }

    pub fn set_phi_input(&mut self, phi: NodeId, index: usize, value: NodeId) {
        let node = self.graph.node_mut(phi);
        if node.inputs.len() <= index {
            node.inputs.resize(index + 1, value);
        }
        node.inputs[index] = value;
    }

    // === Allocation and memory ===

    pub fn new_instance(&mut self, layout: LayoutId) -> NodeId {
        self.append(Node::new(NodeKind::NewInstance { layout }, &[], ValueKind::Object))
    }

    pub fn new_array(&mut self, layout: LayoutId) -> NodeId {
        self.append(Node::new(NodeKind::NewArray { layout }, &[], ValueKind::Object))
    }

    pub fn load_field(&mut self, object: NodeId, field: FieldRef) -> NodeId {
        let kind = self.graph.layout(field.layout).entry_kinds[field.index as usize];
        self.append(Node::new(NodeKind::LoadField { field }, &[object], kind))
    }

    pub fn store_field(&mut self, object: NodeId, field: FieldRef, value: NodeId) -> NodeId {
        self.append(Node::new(
            NodeKind::StoreField { field },
            &[object, value],
            ValueKind::Void,
        ))
    }

    pub fn load_indexed(&mut self, array: NodeId, index: NodeId, kind: ValueKind) -> NodeId {
        self.append(Node::new(NodeKind::LoadIndexed { kind }, &[array, index], kind))
    }

    pub fn store_indexed(
        &mut self,
        array: NodeId,
        index: NodeId,
        value: NodeId,
        kind: ValueKind,
    ) -> NodeId {
        self.append(Node::new(
            NodeKind::StoreIndexed { kind },
            &[array, index, value],
            ValueKind::Void,
        ))
    }

    pub fn array_length(&mut self, array: NodeId) -> NodeId {
        self.append(Node::new(NodeKind::ArrayLength, &[array], ValueKind::Int))
    }

    pub fn monitor_enter(&mut self, object: NodeId, lock: u32) -> NodeId {
        self.append(Node::new(NodeKind::MonitorEnter { lock }, &[object], ValueKind::Void))
    }

    pub fn monitor_exit(&mut self, object: NodeId, lock: u32) -> NodeId {
        self.append(Node::new(NodeKind::MonitorExit { lock }, &[object], ValueKind::Void))
    }

    pub fn memory_kill(&mut self, location: LocationIdentity) -> NodeId {
        self.append(Node::new(NodeKind::MemoryKill { location }, &[], ValueKind::Void))
    }

    // === Arithmetic ===

    pub fn binary(&mut self, op: BinaryOp, x: NodeId, y: NodeId) -> NodeId {
        let kind = self.graph.node(x).value_kind;
        self.append(Node::new(NodeKind::Binary(op), &[x, y], kind))
    }

    pub fn compare(&mut self, op: CompareOp, x: NodeId, y: NodeId) -> NodeId {
        self.append(Node::new(NodeKind::Compare(op), &[x, y], ValueKind::Int))
    }

    pub fn object_equals(&mut self, x: NodeId, y: NodeId) -> NodeId {
        self.append(Node::new(NodeKind::ObjectEquals, &[x, y], ValueKind::Int))
    }

    pub fn is_null(&mut self, x: NodeId) -> NodeId {
        self.append(Node::new(NodeKind::IsNull, &[x], ValueKind::Int))
    }

    // === Calls ===

    /// Call an external target; the frame state records the arguments.
    pub fn invoke(&mut self, target: &str, args: &[NodeId], kind: ValueKind) -> NodeId {
        self.invoke_with_state(target, args, kind, args)
    }

    pub fn invoke_with_state(
        &mut self,
        target: &str,
        args: &[NodeId],
        kind: ValueKind,
        live: &[NodeId],
    ) -> NodeId {
        let state = self.frame_state(live);
        self.append(
            Node::new(
                NodeKind::Invoke {
                    target: target.to_string(),
                },
                args,
                kind,
            )
            .with_state(state),
        )
    }

    // === Terminators ===

    pub fn goto(&mut self, target: BlockId) -> NodeId {
        self.graph.set_terminator(
            self.current_block,
            Node::new(NodeKind::Goto { target }, &[], ValueKind::Void),
        )
    }

    pub fn branch(&mut self, condition: NodeId, true_target: BlockId, false_target: BlockId) -> NodeId {
        self.graph.set_terminator(
            self.current_block,
            Node::new(
                NodeKind::If {
                    true_target,
                    false_target,
                },
                &[condition],
                ValueKind::Void,
            ),
        )
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        let inputs: Vec<NodeId> = value.into_iter().collect();
        self.graph.set_terminator(
            self.current_block,
            Node::new(NodeKind::Return, &inputs, ValueKind::Void),
        )
    }

    pub fn deoptimize(&mut self, live: &[NodeId]) -> NodeId {
        let state = self.frame_state(live);
        self.graph.set_terminator(
            self.current_block,
            Node::new(NodeKind::Deoptimize, &[], ValueKind::Void).with_state(state),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_diamond() {
        //      entry
        //       /\
        //     bb1 bb2
        //       \/
        //      bb3
        let mut b = GraphBuilder::new("diamond");
        let cond = b.param(0, ValueKind::Int);
        let bb1 = b.create_block("then");
        let bb2 = b.create_block("else");
        let bb3 = b.create_block("join");
        b.branch(cond, bb1, bb2);
        b.switch_to_block(bb1);
        let one = b.int(1);
        b.goto(bb3);
        b.switch_to_block(bb2);
        let two = b.int(2);
        b.goto(bb3);
        b.switch_to_block(bb3);
        let phi = b.phi(bb3, ValueKind::Int, &[one, two]);
        b.ret(Some(phi));

        let graph = b.finish();
        assert_eq!(graph.block(bb3).predecessors, vec![bb1, bb2]);
        assert_eq!(graph.block(bb3).phis, vec![phi]);
        assert_eq!(graph.node(phi).inputs.as_slice(), &[one, two]);
    }

    #[test]
    fn test_constants_are_shared() {
        let mut b = GraphBuilder::new("c");
        let a = b.int(5);
        let c = b.int(5);
        assert_eq!(a, c);
        assert_ne!(b.int(6), a);
    }

    #[test]
    fn test_invoke_carries_state() {
        let mut b = GraphBuilder::new("call");
        let x = b.param(0, ValueKind::Object);
        let call = b.invoke("sink", &[x], ValueKind::Void);
        let graph = b.graph();
        let state = graph.node(call).state.expect("invoke has a frame state");
        assert_eq!(graph.node(state).inputs.as_slice(), &[x]);
    }
}
