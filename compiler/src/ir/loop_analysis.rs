//! Loop Analysis
//!
//! This module provides the loop structure the block scheduler hands to the
//! escape analysis driver:
//! - Dominator tree computation (iterative dataflow algorithm)
//! - Natural loop detection via back-edge identification
//! - Loop nesting info

use super::{BlockId, Graph};
use fxhash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Dominator tree for a graph's block structure.
///
/// A block D dominates block B if every path from the entry to B goes through D.
/// The immediate dominator (idom) of B is the closest strict dominator.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Immediate dominator for each block (entry block has no idom)
    idom: FxHashMap<BlockId, BlockId>,

    /// Children in the dominator tree
    children: FxHashMap<BlockId, Vec<BlockId>>,

    /// Dominator tree depth for each block (entry = 0)
    depth: FxHashMap<BlockId, usize>,

    /// Reachable blocks in reverse postorder
    reverse_postorder: Vec<BlockId>,

    entry: BlockId,
}

impl DominatorTree {
    /// Compute the dominator tree using Cooper, Harvey, and Kennedy's
    /// iterative algorithm.
    pub fn compute(graph: &Graph) -> Self {
        let entry = graph.entry();

        let rpo = Self::compute_reverse_postorder(graph, entry);
        let rpo_index: FxHashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut idom: FxHashMap<BlockId, Option<BlockId>> = FxHashMap::default();
        for &block in &rpo {
            idom.insert(block, None);
        }
        idom.insert(entry, Some(entry));

        let mut changed = true;
        while changed {
            changed = false;

            for &block in &rpo {
                if block == entry {
                    continue;
                }

                let mut new_idom: Option<BlockId> = None;
                for &pred in &graph.block(block).predecessors {
                    if idom.get(&pred).and_then(|x| *x).is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => Self::intersect(current, pred, &idom, &rpo_index),
                    });
                }

                if new_idom != idom[&block] {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }

        let mut final_idom: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        for (&block, &dom) in &idom {
            if let Some(d) = dom {
                if block != entry {
                    final_idom.insert(block, d);
                }
            }
        }

        let mut children: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &block in &rpo {
            if let Some(&dom) = final_idom.get(&block) {
                children.entry(dom).or_default().push(block);
            }
        }

        let mut depth: FxHashMap<BlockId, usize> = FxHashMap::default();
        depth.insert(entry, 0);
        let mut queue: VecDeque<BlockId> = VecDeque::new();
        queue.push_back(entry);
        while let Some(block) = queue.pop_front() {
            let d = depth[&block];
            for &child in children.get(&block).map(|v| v.as_slice()).unwrap_or(&[]) {
                depth.insert(child, d + 1);
                queue.push_back(child);
            }
        }

        Self {
            idom: final_idom,
            children,
            depth,
            reverse_postorder: rpo,
            entry,
        }
    }

    /// Reverse postorder of the blocks reachable from `entry`. Successors
    /// are visited in reverse so that the first successor of a branch comes
    /// first in the resulting order.
    fn compute_reverse_postorder(graph: &Graph, entry: BlockId) -> Vec<BlockId> {
        let mut visited = FxHashSet::default();
        let mut postorder = Vec::new();
        // (block, next successor index)
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        visited.insert(entry);

        while let Some((block, next)) = stack.pop() {
            let succs = graph.successors(block);
            let remaining = succs.len() - next;
            if remaining == 0 {
                postorder.push(block);
                continue;
            }
            stack.push((block, next + 1));
            let succ = succs[succs.len() - 1 - next];
            if visited.insert(succ) {
                stack.push((succ, 0));
            }
        }

        postorder.reverse();
        postorder
    }

    fn intersect(
        mut b1: BlockId,
        mut b2: BlockId,
        idom: &FxHashMap<BlockId, Option<BlockId>>,
        rpo_index: &FxHashMap<BlockId, usize>,
    ) -> BlockId {
        while b1 != b2 {
            let mut idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
            let mut idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);

            while idx1 > idx2 {
                match idom.get(&b1) {
                    Some(Some(dom)) => {
                        b1 = *dom;
                        idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b1,
                }
            }

            while idx2 > idx1 {
                match idom.get(&b2) {
                    Some(Some(dom)) => {
                        b2 = *dom;
                        idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b2,
                }
            }
        }
        b1
    }

    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.reverse_postorder
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        block == self.entry || self.idom.contains_key(&block)
    }

    /// Get the immediate dominator of a block.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied()
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn depth(&self, block: BlockId) -> usize {
        self.depth.get(&block).copied().unwrap_or(0)
    }

    /// Check if block A dominates block B.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }

        let mut current = b;
        while let Some(dom) = self.idom.get(&current) {
            if *dom == a {
                return true;
            }
            current = *dom;
        }

        a == self.entry
    }
}

/// A natural loop in the control flow graph.
///
/// A natural loop is defined by back edges (edges from B to H where H
/// dominates B). All back edges into the same header form one loop.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    /// Loop header block (entry point of the loop)
    pub header: BlockId,

    /// Sources of the back edges, in header predecessor order
    pub back_edge_sources: Vec<BlockId>,

    /// All blocks in the loop body (including header)
    pub blocks: FxHashSet<BlockId>,

    /// Blocks outside the loop that are targets of edges leaving it
    pub exit_blocks: Vec<BlockId>,

    /// Nesting depth (0 = outermost)
    pub nesting_depth: usize,

    /// Parent loop header if this is a nested loop
    pub parent: Option<BlockId>,

    /// Child loop headers (directly nested loops)
    pub children: Vec<BlockId>,
}

impl NaturalLoop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

/// Loop nest information for a graph.
#[derive(Debug, Clone, Default)]
pub struct LoopNestInfo {
    /// All natural loops indexed by header block
    pub loops: FxHashMap<BlockId, NaturalLoop>,

    /// Top-level loops (not nested in any other loop)
    pub top_level_loops: Vec<BlockId>,

    /// Map from block to its innermost containing loop header
    pub block_to_loop: FxHashMap<BlockId, BlockId>,

    /// Maximum nesting depth
    pub max_depth: usize,
}

impl LoopNestInfo {
    pub fn analyze(graph: &Graph, domtree: &DominatorTree) -> Self {
        let mut loops: FxHashMap<BlockId, NaturalLoop> = FxHashMap::default();

        for &block in domtree.reverse_postorder() {
            for succ in graph.successors(block) {
                if !domtree.dominates(succ, block) {
                    continue;
                }
                // Back edge: block -> succ
                let body = Self::find_loop_blocks(graph, succ, block);
                let natural_loop = loops.entry(succ).or_insert_with(|| NaturalLoop {
                    header: succ,
                    back_edge_sources: Vec::new(),
                    blocks: FxHashSet::default(),
                    exit_blocks: Vec::new(),
                    nesting_depth: 0,
                    parent: None,
                    children: Vec::new(),
                });
                natural_loop.back_edge_sources.push(block);
                natural_loop.blocks.extend(body);
            }
        }

        for natural_loop in loops.values_mut() {
            let header_preds = &graph.block(natural_loop.header).predecessors;
            natural_loop
                .back_edge_sources
                .sort_by_key(|b| header_preds.iter().position(|p| p == b));
            natural_loop.exit_blocks = Self::find_exit_blocks(graph, domtree, &natural_loop.blocks);
        }

        // The innermost enclosing loop is the smallest one containing the header
        let headers: Vec<BlockId> = domtree
            .reverse_postorder()
            .iter()
            .copied()
            .filter(|b| loops.contains_key(b))
            .collect();
        for &header in &headers {
            let parent = headers
                .iter()
                .copied()
                .filter(|&other| other != header && loops[&other].blocks.contains(&header))
                .min_by_key(|other| loops[other].blocks.len());
            if let Some(natural_loop) = loops.get_mut(&header) {
                natural_loop.parent = parent;
            }
        }

        for &header in &headers {
            if let Some(parent) = loops[&header].parent {
                if let Some(parent_loop) = loops.get_mut(&parent) {
                    parent_loop.children.push(header);
                }
            }
        }

        let top_level_loops: Vec<BlockId> = headers
            .iter()
            .copied()
            .filter(|h| loops[h].parent.is_none())
            .collect();

        fn set_depth(loops: &mut FxHashMap<BlockId, NaturalLoop>, header: BlockId, depth: usize) {
            let children = match loops.get_mut(&header) {
                Some(natural_loop) => {
                    natural_loop.nesting_depth = depth;
                    natural_loop.children.clone()
                }
                None => return,
            };
            for child in children {
                set_depth(loops, child, depth + 1);
            }
        }

        for &top_level in &top_level_loops {
            set_depth(&mut loops, top_level, 0);
        }

        let max_depth = loops.values().map(|l| l.nesting_depth).max().unwrap_or(0);

        let mut block_to_loop: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        for (&header, loop_info) in &loops {
            for &block in &loop_info.blocks {
                match block_to_loop.get(&block) {
                    Some(existing) if loops[existing].nesting_depth >= loop_info.nesting_depth => {}
                    _ => {
                        block_to_loop.insert(block, header);
                    }
                }
            }
        }

        Self {
            loops,
            top_level_loops,
            block_to_loop,
            max_depth,
        }
    }

    /// Find all blocks in a natural loop given header and back edge source.
    fn find_loop_blocks(graph: &Graph, header: BlockId, back_edge_source: BlockId) -> FxHashSet<BlockId> {
        let mut loop_blocks = FxHashSet::default();
        loop_blocks.insert(header);

        if header == back_edge_source {
            return loop_blocks;
        }

        let mut worklist = vec![back_edge_source];
        loop_blocks.insert(back_edge_source);

        while let Some(block) = worklist.pop() {
            for &pred in &graph.block(block).predecessors {
                if loop_blocks.insert(pred) {
                    worklist.push(pred);
                }
            }
        }

        loop_blocks
    }

    /// Targets of edges leaving the loop, in reverse postorder.
    fn find_exit_blocks(graph: &Graph, domtree: &DominatorTree, loop_blocks: &FxHashSet<BlockId>) -> Vec<BlockId> {
        let mut exits = Vec::new();
        for &block in domtree.reverse_postorder() {
            if !loop_blocks.contains(&block) {
                continue;
            }
            for succ in graph.successors(block) {
                if !loop_blocks.contains(&succ) && !exits.contains(&succ) {
                    exits.push(succ);
                }
            }
        }
        exits
    }

    /// Get the innermost loop containing a block, if any.
    pub fn get_loop(&self, block: BlockId) -> Option<&NaturalLoop> {
        self.block_to_loop.get(&block).and_then(|h| self.loops.get(h))
    }

    /// Get loop depth for a block (0 if not in any loop).
    pub fn loop_depth(&self, block: BlockId) -> usize {
        self.get_loop(block).map(|l| l.nesting_depth + 1).unwrap_or(0)
    }

    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loops.contains_key(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, ValueKind};

    #[test]
    fn test_dominator_tree_simple() {
        //      entry
        //       /\
        //      /  \
        //    bb1  bb2
        //      \  /
        //       \/
        //      bb3
        let mut b = GraphBuilder::new("diamond");
        let cond = b.param(0, ValueKind::Int);
        let bb1 = b.create_block("bb1");
        let bb2 = b.create_block("bb2");
        let bb3 = b.create_block("bb3");
        b.branch(cond, bb1, bb2);
        b.switch_to_block(bb1);
        b.goto(bb3);
        b.switch_to_block(bb2);
        b.goto(bb3);
        b.switch_to_block(bb3);
        b.ret(None);
        let graph = b.finish();

        let domtree = DominatorTree::compute(&graph);
        let entry = BlockId::entry();

        assert!(domtree.dominates(entry, bb1));
        assert!(domtree.dominates(entry, bb3));
        assert!(!domtree.dominates(bb1, bb2));
        assert!(!domtree.dominates(bb2, bb1));
        assert_eq!(domtree.idom(bb3), Some(entry));
        assert_eq!(domtree.reverse_postorder(), &[entry, bb1, bb2, bb3]);
    }

    #[test]
    fn test_nested_loop_detection() {
        //     entry
        //       |
        //     outer <--------+
        //       |  \         |
        //       |   exit     |
        //     inner <--+     |
        //       |  \   |     |
        //       |  body+     |
        //     latch ---------+
        let mut b = GraphBuilder::new("nest");
        let cond = b.param(0, ValueKind::Int);
        let outer = b.create_block("outer");
        let exit = b.create_block("exit");
        let inner = b.create_block("inner");
        let body = b.create_block("body");
        let latch = b.create_block("latch");
        b.goto(outer);
        b.switch_to_block(outer);
        b.branch(cond, inner, exit);
        b.switch_to_block(inner);
        b.branch(cond, body, latch);
        b.switch_to_block(body);
        b.goto(inner);
        b.switch_to_block(latch);
        b.goto(outer);
        b.switch_to_block(exit);
        b.ret(None);
        let graph = b.finish();

        let domtree = DominatorTree::compute(&graph);
        let info = LoopNestInfo::analyze(&graph, &domtree);

        assert_eq!(info.loops.len(), 2);
        assert_eq!(info.top_level_loops, vec![outer]);
        let inner_loop = &info.loops[&inner];
        assert_eq!(inner_loop.parent, Some(outer));
        assert_eq!(inner_loop.nesting_depth, 1);
        assert_eq!(inner_loop.back_edge_sources, vec![body]);
        assert_eq!(inner_loop.exit_blocks, vec![latch]);
        assert_eq!(info.loops[&outer].exit_blocks, vec![exit]);
        assert_eq!(info.loop_depth(body), 2);
        assert_eq!(info.get_loop(latch).map(|l| l.header), Some(outer));
    }
}
