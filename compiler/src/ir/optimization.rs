//! Graph Optimization Passes
//!
//! Passes run over a single [`Graph`] and report what they changed through
//! an [`OptimizationResult`]. The escape analysis phase relies on the dead
//! code elimination and canonicalization passes defined here to clean up
//! after each sweep.

use super::{BinaryOp, CompareOp, Constant, Graph, Node, NodeId, NodeKind};
use crate::pea::{PartialEscapePhase, PeaConfig};
use fxhash::FxHashSet;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Optimization pass trait
pub trait OptimizationPass {
    /// Get the name of this pass
    fn name(&self) -> &'static str;

    /// Run the pass on a graph
    fn run_on_graph(&mut self, graph: &mut Graph) -> OptimizationResult;
}

/// Result of an optimization pass
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Whether the IR was modified
    pub modified: bool,

    /// Number of nodes eliminated
    pub instructions_eliminated: usize,

    /// Number of blocks eliminated
    pub blocks_eliminated: usize,

    /// Other statistics
    pub stats: HashMap<String, usize>,
}

impl OptimizationResult {
    /// Create a result indicating no changes
    pub fn unchanged() -> Self {
        Self {
            modified: false,
            instructions_eliminated: 0,
            blocks_eliminated: 0,
            stats: HashMap::new(),
        }
    }

    /// Create a result indicating changes
    pub fn changed() -> Self {
        Self {
            modified: true,
            ..Self::unchanged()
        }
    }

    /// Combine results
    pub fn combine(mut self, other: OptimizationResult) -> Self {
        self.modified |= other.modified;
        self.instructions_eliminated += other.instructions_eliminated;
        self.blocks_eliminated += other.blocks_eliminated;

        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }

        self
    }
}

/// Optimization level for tiered compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    /// No optimization
    O0,
    /// Cleanup only
    O1,
    /// Escape analysis without read elimination
    O2,
    /// Escape analysis with read elimination
    O3,
}

/// Optimization pass manager
pub struct PassManager {
    passes: Vec<Box<dyn OptimizationPass>>,
    /// Upper bound on rounds over the whole pipeline
    max_rounds: usize,
}

impl PassManager {
    /// Create a new pass manager
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            max_rounds: 4,
        }
    }

    /// Add a pass to the manager
    pub fn add_pass<P: OptimizationPass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Build a default optimization pipeline
    pub fn default_pipeline() -> Self {
        Self::for_level(OptimizationLevel::O3)
    }

    /// Create optimization pipeline for a specific level.
    pub fn for_level(level: OptimizationLevel) -> Self {
        let mut manager = Self::new();

        match level {
            OptimizationLevel::O0 => {}
            OptimizationLevel::O1 => {
                manager.add_pass(CanonicalizerPass::new());
                manager.add_pass(DeadCodeEliminationPass::new());
            }
            OptimizationLevel::O2 => {
                manager.add_pass(CanonicalizerPass::new());
                manager.add_pass(PartialEscapePhase::new(PeaConfig::escape_analysis_only()));
                manager.add_pass(DeadCodeEliminationPass::new());
            }
            OptimizationLevel::O3 => {
                manager.add_pass(CanonicalizerPass::new());
                manager.add_pass(PartialEscapePhase::new(PeaConfig::default()));
                manager.add_pass(DeadCodeEliminationPass::new());
            }
        }

        manager
    }

    /// Run all passes until none of them changes the graph
    pub fn run(&mut self, graph: &mut Graph) -> OptimizationResult {
        let mut total_result = OptimizationResult::unchanged();

        for round in 0..self.max_rounds {
            let mut changed = false;

            for pass in &mut self.passes {
                let result = pass.run_on_graph(graph);
                if result.modified {
                    debug!("{} changed {} in round {}", pass.name(), graph.name, round);
                    changed = true;
                }
                total_result = total_result.combine(result);
            }

            if !changed {
                break;
            }
        }

        total_result
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Dead code elimination pass
///
/// Removes nodes without side effects that nothing references. A phi that
/// only feeds itself counts as unused.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    pub fn new() -> Self {
        Self
    }

    fn is_removable(node: &Node) -> bool {
        !node.has_side_effects() && !matches!(node.kind, NodeKind::Parameter { .. })
    }

    /// Remove dead nodes until none are left. Returns the number removed.
    pub fn eliminate(&self, graph: &mut Graph) -> usize {
        let mut eliminated = 0;

        loop {
            let usages = graph.usages();
            let dead: Vec<NodeId> = graph
                .live_nodes()
                .filter(|(id, node)| {
                    Self::is_removable(node)
                        && usages
                            .get(id)
                            .map_or(true, |users| users.iter().all(|user| user == id))
                })
                .map(|(id, _)| id)
                .collect();

            if dead.is_empty() {
                break;
            }
            for id in dead {
                trace!("dce removes {}", id);
                graph.remove(id);
                eliminated += 1;
            }
        }

        eliminated
    }
}

impl OptimizationPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> OptimizationResult {
        let eliminated = self.eliminate(graph);
        let mut result = OptimizationResult::unchanged();
        if eliminated > 0 {
            result.modified = true;
            result.instructions_eliminated = eliminated;
        }
        result
    }
}

/// Local simplifications: constant folding, trivial phis and proxies, and
/// object comparisons whose outcome is known from the allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalizerPass;

impl CanonicalizerPass {
    pub fn new() -> Self {
        Self
    }

    fn fold_binary_op(op: BinaryOp, left: Constant, right: Constant) -> Option<Constant> {
        use Constant::*;

        match (op, left, right) {
            (BinaryOp::Add, Int(a), Int(b)) => Some(Int(a.wrapping_add(b))),
            (BinaryOp::Sub, Int(a), Int(b)) => Some(Int(a.wrapping_sub(b))),
            (BinaryOp::Mul, Int(a), Int(b)) => Some(Int(a.wrapping_mul(b))),
            (BinaryOp::Add, Long(a), Long(b)) => Some(Long(a.wrapping_add(b))),
            (BinaryOp::Sub, Long(a), Long(b)) => Some(Long(a.wrapping_sub(b))),
            (BinaryOp::Mul, Long(a), Long(b)) => Some(Long(a.wrapping_mul(b))),
            _ => None,
        }
    }

    fn fold_comparison(op: CompareOp, left: Constant, right: Constant) -> Option<Constant> {
        let ordering = match (left, right) {
            (Constant::Int(a), Constant::Int(b)) => a.cmp(&b),
            (Constant::Long(a), Constant::Long(b)) => a.cmp(&b),
            _ => return None,
        };
        let result = match op {
            CompareOp::Eq => ordering.is_eq(),
            CompareOp::Ne => ordering.is_ne(),
            CompareOp::Lt => ordering.is_lt(),
            CompareOp::Le => ordering.is_le(),
        };
        Some(Constant::Int(result as i32))
    }

    fn is_fresh_object(graph: &Graph, id: NodeId) -> bool {
        matches!(
            graph.node(id).kind,
            NodeKind::NewInstance { .. } | NodeKind::NewArray { .. } | NodeKind::Materialize { .. }
        )
    }

    fn constant_input(graph: &Graph, node: &Node, index: usize) -> Option<Constant> {
        node.inputs.get(index).and_then(|&id| graph.get(id)).and_then(Node::as_constant)
    }

    fn constant_node(graph: &mut Graph, value: Constant) -> NodeId {
        match graph.find_constant(value) {
            Some(existing) => existing,
            None => graph.add_floating(Node::constant(value)),
        }
    }

    /// The node `id` can be replaced by, if any
    fn simplify(graph: &mut Graph, id: NodeId) -> Option<NodeId> {
        let node = graph.get(id)?.clone();
        let folded = match &node.kind {
            NodeKind::Binary(op) => Self::fold_binary_op(
                *op,
                Self::constant_input(graph, &node, 0)?,
                Self::constant_input(graph, &node, 1)?,
            ),
            NodeKind::Compare(op) => Self::fold_comparison(
                *op,
                Self::constant_input(graph, &node, 0)?,
                Self::constant_input(graph, &node, 1)?,
            ),
            NodeKind::ObjectEquals => {
                let (x, y) = (node.inputs[0], node.inputs[1]);
                if x == y {
                    Some(Constant::Int(1))
                } else if Self::is_fresh_object(graph, x) && Self::is_fresh_object(graph, y) {
                    Some(Constant::Int(0))
                } else {
                    None
                }
            }
            NodeKind::IsNull => {
                let x = node.inputs[0];
                match graph.node(x).as_constant() {
                    Some(Constant::Null) => Some(Constant::Int(1)),
                    _ if Self::is_fresh_object(graph, x) => Some(Constant::Int(0)),
                    _ => None,
                }
            }
            NodeKind::Phi => {
                let mut distinct = node.inputs.iter().copied().filter(|&input| input != id);
                let first = distinct.next()?;
                if distinct.all(|input| input == first) {
                    return Some(first);
                }
                None
            }
            NodeKind::Proxy => {
                let value = node.inputs[0];
                return graph.node(value).as_constant().map(|_| value);
            }
            _ => None,
        };
        folded.map(|value| Self::constant_node(graph, value))
    }

    /// Simplify `seeds` and, transitively, the users of every replaced node.
    /// Returns the number of nodes replaced.
    pub fn run_incremental(&self, graph: &mut Graph, seeds: &FxHashSet<NodeId>) -> usize {
        let mut worklist: Vec<NodeId> = seeds.iter().copied().collect();
        worklist.sort_unstable_by(|a, b| b.cmp(a));
        let mut replaced = 0;

        while let Some(id) = worklist.pop() {
            if !graph.is_alive(id) {
                continue;
            }
            let Some(replacement) = Self::simplify(graph, id) else {
                continue;
            };
            if replacement == id {
                continue;
            }
            trace!("canonicalize {} -> {}", id, replacement);
            for user in graph.replace_at_usages(id, replacement) {
                if !worklist.contains(&user) {
                    worklist.push(user);
                }
            }
            graph.remove(id);
            replaced += 1;
        }

        replaced
    }
}

impl OptimizationPass for CanonicalizerPass {
    fn name(&self) -> &'static str {
        "canonicalizer"
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> OptimizationResult {
        let all: FxHashSet<NodeId> = graph.live_nodes().map(|(id, _)| id).collect();
        let replaced = self.run_incremental(graph, &all);
        let mut result = OptimizationResult::unchanged();
        if replaced > 0 {
            result.modified = true;
            result.instructions_eliminated = replaced;
        }
        result
    }
}
