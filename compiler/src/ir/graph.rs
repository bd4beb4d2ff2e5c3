//! Graph arena and basic blocks

use super::{BlockId, Constant, LayoutId, Node, NodeId, NodeKind, ObjectLayout};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A basic block: phis, scheduled nodes in program order and a terminator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub phis: Vec<NodeId>,
    pub nodes: Vec<NodeId>,
    pub terminator: Option<NodeId>,
    /// For loop headers the forward predecessor comes first
    pub predecessors: Vec<BlockId>,
}

impl Block {
    fn new(id: BlockId, name: String) -> Self {
        Self {
            id,
            name,
            phis: Vec::new(),
            nodes: Vec::new(),
            terminator: None,
            predecessors: Vec::new(),
        }
    }

    pub fn predecessor_index(&self, pred: BlockId) -> Option<usize> {
        self.predecessors.iter().position(|&p| p == pred)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    nodes: Vec<Option<Node>>,
    blocks: Vec<Block>,
    layouts: Vec<ObjectLayout>,
}

impl Graph {
    /// Create a graph holding only an empty entry block
    pub fn new(name: impl Into<String>) -> Self {
        let mut graph = Self {
            name: name.into(),
            nodes: Vec::new(),
            blocks: Vec::new(),
            layouts: Vec::new(),
        };
        graph.add_block("entry");
        graph
    }

    pub fn entry(&self) -> BlockId {
        BlockId::entry()
    }

    // === Layouts ===

    pub fn add_layout(&mut self, layout: ObjectLayout) -> LayoutId {
        let id = LayoutId(self.layouts.len() as u32);
        self.layouts.push(layout);
        id
    }

    pub fn layout(&self, id: LayoutId) -> &ObjectLayout {
        &self.layouts[id.0 as usize]
    }

    pub fn layouts(&self) -> &[ObjectLayout] {
        &self.layouts
    }

    // === Blocks ===

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id, name.into()));
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn successors(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        self.block(block)
            .terminator
            .and_then(|t| self.get(t))
            .map(|t| t.successors())
            .unwrap_or_default()
    }

    // === Nodes ===

    /// Id the next added node will receive
    pub fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|slot| slot.as_ref())
    }

    pub fn node(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("{} is not a live node of graph {}", id, self.name),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.index()).and_then(|slot| slot.as_mut()) {
            Some(node) => node,
            None => panic!("{} is not a live node", id),
        }
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|node| (NodeId(i as u32), node)))
    }

    pub fn live_node_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    /// Add an unscheduled node
    pub fn add_floating(&mut self, node: Node) -> NodeId {
        let id = self.next_id();
        self.nodes.push(Some(node));
        id
    }

    /// Append a node to `block`; phis go to the block's phi list.
    pub fn append(&mut self, block: BlockId, mut node: Node) -> NodeId {
        node.block = Some(block);
        let is_phi = matches!(node.kind, NodeKind::Phi);
        let id = self.add_floating(node);
        let block = self.block_mut(block);
        if is_phi {
            block.phis.push(id);
        } else {
            block.nodes.push(id);
        }
        id
    }

    /// Install the terminator of `block` and register the block as a
    /// predecessor of each successor.
    pub fn set_terminator(&mut self, block: BlockId, mut node: Node) -> NodeId {
        node.block = Some(block);
        let successors = node.successors();
        let id = self.add_floating(node);
        self.block_mut(block).terminator = Some(id);
        for succ in successors {
            self.block_mut(succ).predecessors.push(block);
        }
        id
    }

    /// Place `node` in the arena slot `id`, which must be free. Used when
    /// applying effects that reserved ids during analysis.
    pub fn insert_node(&mut self, id: NodeId, node: Node) {
        if self.nodes.len() <= id.index() {
            self.nodes.resize(id.index() + 1, None);
        }
        let slot = &mut self.nodes[id.index()];
        assert!(slot.is_none(), "node slot {} is already occupied", id);
        *slot = Some(node);
    }

    /// Schedule the already inserted node `id` immediately before `anchor`.
    /// Anchoring on a terminator appends to the end of the node list.
    pub fn schedule_before(&mut self, anchor: NodeId, id: NodeId) {
        let block = match self.node(anchor).block {
            Some(block) => block,
            None => panic!("anchor {} is not scheduled", anchor),
        };
        self.node_mut(id).block = Some(block);
        let block = self.block_mut(block);
        if block.terminator == Some(anchor) {
            block.nodes.push(id);
        } else {
            let pos = block.nodes.iter().position(|&n| n == anchor).unwrap_or(block.nodes.len());
            block.nodes.insert(pos, id);
        }
    }

    pub fn schedule_at_start(&mut self, block: BlockId, id: NodeId) {
        self.node_mut(id).block = Some(block);
        self.block_mut(block).nodes.insert(0, id);
    }

    pub fn schedule_at_end(&mut self, block: BlockId, id: NodeId) {
        self.node_mut(id).block = Some(block);
        self.block_mut(block).nodes.push(id);
    }

    pub fn add_phi_to_block(&mut self, block: BlockId, id: NodeId) {
        self.node_mut(id).block = Some(block);
        self.block_mut(block).phis.push(id);
    }

    /// Remove a node from the arena and from its block.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        if let Some(block) = node.block {
            let block = self.block_mut(block);
            block.phis.retain(|&n| n != id);
            block.nodes.retain(|&n| n != id);
        }
        Some(node)
    }

    /// Map from each node to the nodes that reference it
    pub fn usages(&self) -> FxHashMap<NodeId, Vec<NodeId>> {
        let mut usages: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for (id, node) in self.live_nodes() {
            for used in node.references() {
                let users = usages.entry(used).or_default();
                if !users.contains(&id) {
                    users.push(id);
                }
            }
        }
        usages
    }

    /// Redirect every reference to `old` towards `new`. Returns the nodes
    /// that were modified.
    pub fn replace_at_usages(&mut self, old: NodeId, new: NodeId) -> Vec<NodeId> {
        let mut touched = Vec::new();
        for (i, slot) in self.nodes.iter_mut().enumerate() {
            if let Some(node) = slot {
                if node.replace_references(old, new) {
                    touched.push(NodeId(i as u32));
                }
            }
        }
        touched
    }

    /// Find an existing constant node
    pub fn find_constant(&self, value: Constant) -> Option<NodeId> {
        self.live_nodes()
            .find(|(_, node)| node.as_constant() == Some(value))
            .map(|(id, _)| id)
    }

    pub fn is_phi_at(&self, node: NodeId, block: BlockId) -> bool {
        self.get(node)
            .map(|n| matches!(n.kind, NodeKind::Phi) && n.block == Some(block))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ValueKind;

    #[test]
    fn test_terminator_registers_predecessors() {
        let mut graph = Graph::new("t");
        let a = graph.add_block("a");
        let b = graph.add_block("b");
        let cond = graph.add_floating(Node::constant(Constant::Int(1)));
        graph.set_terminator(
            graph.entry(),
            Node::new(NodeKind::If { true_target: a, false_target: b }, &[cond], ValueKind::Void),
        );
        assert_eq!(graph.block(a).predecessors, vec![BlockId::entry()]);
        assert_eq!(graph.block(b).predecessors, vec![BlockId::entry()]);
        assert_eq!(graph.successors(graph.entry()).as_slice(), &[a, b]);
    }

    #[test]
    fn test_replace_and_remove() {
        let mut graph = Graph::new("t");
        let entry = graph.entry();
        let one = graph.add_floating(Node::constant(Constant::Int(1)));
        let two = graph.add_floating(Node::constant(Constant::Int(2)));
        let add = graph.append(
            entry,
            Node::new(NodeKind::Binary(crate::ir::BinaryOp::Add), &[one, one], ValueKind::Int),
        );
        let ret = graph.set_terminator(entry, Node::new(NodeKind::Return, &[add], ValueKind::Void));

        let touched = graph.replace_at_usages(one, two);
        assert_eq!(touched, vec![add]);
        assert_eq!(graph.node(add).inputs.as_slice(), &[two, two]);

        graph.replace_at_usages(add, two);
        assert_eq!(graph.node(ret).inputs.as_slice(), &[two]);
        graph.remove(add);
        assert!(graph.block(entry).nodes.is_empty());
        assert!(!graph.is_alive(add));
        assert_eq!(graph.usages()[&two], vec![ret]);
    }

    #[test]
    fn test_insert_reserved_node_before_terminator() {
        let mut graph = Graph::new("t");
        let entry = graph.entry();
        let ret = graph.set_terminator(entry, Node::new(NodeKind::Return, &[], ValueKind::Void));
        let reserved = NodeId(10);
        graph.insert_node(reserved, Node::constant(Constant::Null));
        graph.schedule_before(ret, reserved);
        assert_eq!(graph.block(entry).nodes, vec![reserved]);
        assert_eq!(graph.next_id(), NodeId(11));
    }
}
