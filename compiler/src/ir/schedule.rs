//! Block schedule consumed by the escape analysis driver
//!
//! A [`Scheduler`] turns the graph into a [`ControlFlowGraph`]: reachable
//! blocks in reverse postorder, their node lists in program order and the
//! loop structure. The default [`BlockScheduler`] keeps the graph's own
//! block order and derives loops from the dominator tree.

use super::loop_analysis::{DominatorTree, LoopNestInfo};
use super::{BlockId, Graph, NodeId};
use crate::error::{PeaError, PeaResult};
use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;

/// Loop metadata needed by the iteration driver
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub header: BlockId,
    pub blocks: FxHashSet<BlockId>,
    /// Dedicated exit blocks, each with a single predecessor inside the loop
    pub exits: Vec<BlockId>,
    /// Back edge sources in header predecessor order (after the forward
    /// predecessor)
    pub back_edges: Vec<BlockId>,
    pub depth: usize,
    pub parent: Option<BlockId>,
}

impl LoopInfo {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledBlock {
    pub id: BlockId,
    pub predecessors: Vec<BlockId>,
    pub successors: SmallVec<[BlockId; 2]>,
    /// Scheduled nodes followed by the terminator
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    entry: BlockId,
    reverse_postorder: Vec<BlockId>,
    blocks: FxHashMap<BlockId, ScheduledBlock>,
    loops: FxHashMap<BlockId, LoopInfo>,
}

impl ControlFlowGraph {
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.reverse_postorder
    }

    pub fn block(&self, id: BlockId) -> &ScheduledBlock {
        match self.blocks.get(&id) {
            Some(block) => block,
            None => panic!("{} is not part of the schedule", id),
        }
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        &self.block(id).predecessors
    }

    pub fn successors(&self, id: BlockId) -> &[BlockId] {
        &self.block(id).successors
    }

    pub fn nodes(&self, id: BlockId) -> &[NodeId] {
        &self.block(id).nodes
    }

    pub fn loop_at(&self, header: BlockId) -> Option<&LoopInfo> {
        self.loops.get(&header)
    }

    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loops.contains_key(&block)
    }

    pub fn loops(&self) -> impl Iterator<Item = &LoopInfo> {
        self.loops.values()
    }
}

/// Source of block schedules
pub trait Scheduler {
    fn schedule(&mut self, graph: &Graph) -> PeaResult<ControlFlowGraph>;
}

/// Scheduler that uses the graph's existing block assignment
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockScheduler;

impl BlockScheduler {
    pub fn new() -> Self {
        Self
    }

    fn check_loop(graph: &Graph, info: &LoopInfo) -> PeaResult<()> {
        let preds = &graph.block(info.header).predecessors;
        let forward = preds.iter().filter(|p| !info.contains(**p)).count();
        if forward != 1 || info.contains(preds[0]) {
            return Err(PeaError::InvalidSchedule(format!(
                "loop header {} needs exactly one forward predecessor listed first",
                info.header
            )));
        }
        for &exit in &info.exits {
            if graph.block(exit).predecessors.len() != 1 {
                return Err(PeaError::InvalidSchedule(format!(
                    "loop exit {} of {} has more than one predecessor",
                    exit, info.header
                )));
            }
        }
        Ok(())
    }
}

impl Scheduler for BlockScheduler {
    fn schedule(&mut self, graph: &Graph) -> PeaResult<ControlFlowGraph> {
        let domtree = DominatorTree::compute(graph);
        let nest = LoopNestInfo::analyze(graph, &domtree);
        let rpo = domtree.reverse_postorder().to_vec();
        let rpo_index: FxHashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut blocks = FxHashMap::default();
        for &id in &rpo {
            let block = graph.block(id);
            for pred in &block.predecessors {
                if !domtree.is_reachable(*pred) {
                    return Err(PeaError::InvalidSchedule(format!(
                        "{} has unreachable predecessor {}",
                        id, pred
                    )));
                }
            }
            let successors = graph.successors(id);
            for &succ in &successors {
                // A retreating edge that is not a back edge means the loop is irreducible
                if rpo_index[&succ] <= rpo_index[&id] && !domtree.dominates(succ, id) {
                    return Err(PeaError::InvalidSchedule(format!(
                        "irreducible control flow at {} -> {}",
                        id, succ
                    )));
                }
            }
            let mut nodes = block.nodes.clone();
            match block.terminator {
                Some(terminator) => nodes.push(terminator),
                None => {
                    return Err(PeaError::InvalidSchedule(format!("{} has no terminator", id)));
                }
            }
            blocks.insert(
                id,
                ScheduledBlock {
                    id,
                    predecessors: block.predecessors.clone(),
                    successors,
                    nodes,
                },
            );
        }

        let mut loops = FxHashMap::default();
        for (header, natural) in &nest.loops {
            let info = LoopInfo {
                header: *header,
                blocks: natural.blocks.iter().copied().collect(),
                exits: natural.exit_blocks.clone(),
                back_edges: natural.back_edge_sources.clone(),
                depth: natural.nesting_depth,
                parent: natural.parent,
            };
            Self::check_loop(graph, &info)?;
            loops.insert(*header, info);
        }

        debug!(
            "scheduled {}: {} blocks, {} loops",
            graph.name,
            rpo.len(),
            loops.len()
        );

        Ok(ControlFlowGraph {
            entry: graph.entry(),
            reverse_postorder: rpo,
            blocks,
            loops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, ValueKind};

    #[test]
    fn test_schedule_simple_loop() {
        //     entry
        //       |
        //     header <--+
        //      |   \    |
        //     exit  body+
        let mut b = GraphBuilder::new("loop");
        let cond = b.param(0, ValueKind::Int);
        let header = b.create_block("header");
        let body = b.create_block("body");
        let exit = b.create_block("exit");
        b.goto(header);
        b.switch_to_block(header);
        b.branch(cond, body, exit);
        b.switch_to_block(body);
        b.goto(header);
        b.switch_to_block(exit);
        let ret = b.ret(None);
        let graph = b.finish();

        let cfg = BlockScheduler::new().schedule(&graph).expect("schedule");
        assert!(cfg.is_loop_header(header));
        let info = cfg.loop_at(header).expect("loop");
        assert_eq!(info.exits, vec![exit]);
        assert_eq!(info.back_edges, vec![body]);
        assert_eq!(cfg.nodes(exit), &[ret]);
        assert_eq!(cfg.reverse_postorder()[0], BlockId::entry());
    }

    #[test]
    fn test_shared_loop_exit_is_rejected() {
        //   entry -> header <-> body, both header and entry jump to exit
        let mut b = GraphBuilder::new("bad");
        let cond = b.param(0, ValueKind::Int);
        let header = b.create_block("header");
        let body = b.create_block("body");
        let exit = b.create_block("exit");
        b.branch(cond, header, exit);
        b.switch_to_block(header);
        b.branch(cond, body, exit);
        b.switch_to_block(body);
        b.goto(header);
        b.switch_to_block(exit);
        b.ret(None);
        let graph = b.finish();

        match BlockScheduler::new().schedule(&graph) {
            Err(PeaError::InvalidSchedule(msg)) => assert!(msg.contains("more than one predecessor")),
            other => panic!("expected schedule error, got {:?}", other.map(|_| ())),
        }
    }
}
