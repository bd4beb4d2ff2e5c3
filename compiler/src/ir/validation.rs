//! Graph Validation
//!
//! Structural checks run by tests and the debug tool after a pass has
//! rewritten a graph: every reference points at a live node, phis have one
//! input per predecessor, and block lists agree with each node's block.

use super::{BlockId, Graph, NodeId, NodeKind};
use std::fmt;

/// A single structural problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    DeadReference { node: NodeId, target: NodeId },
    PhiArity { phi: NodeId, block: BlockId, inputs: usize, predecessors: usize },
    WrongBlock { node: NodeId, listed_in: BlockId, claims: Option<BlockId> },
    MissingTerminator { block: BlockId },
    Unscheduled { node: NodeId },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::DeadReference { node, target } => {
                write!(f, "{} refers to dead node {}", node, target)
            }
            ValidationError::PhiArity { phi, block, inputs, predecessors } => write!(
                f,
                "phi {} in {} has {} inputs for {} predecessors",
                phi, block, inputs, predecessors
            ),
            ValidationError::WrongBlock { node, listed_in, claims } => {
                write!(f, "{} is listed in {} but belongs to {:?}", node, listed_in, claims)
            }
            ValidationError::MissingTerminator { block } => write!(f, "{} has no terminator", block),
            ValidationError::Unscheduled { node } => {
                write!(f, "fixed node {} is not in any block", node)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Check `graph`, returning every problem found
pub fn validate_graph(graph: &Graph) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (id, node) in graph.live_nodes() {
        for target in node.references() {
            if !graph.is_alive(target) {
                errors.push(ValidationError::DeadReference { node: id, target });
            }
        }
        if !node.is_floating() && node.block.is_none() {
            errors.push(ValidationError::Unscheduled { node: id });
        }
    }

    for block in graph.blocks() {
        let is_reachable = block.id == graph.entry() || !block.predecessors.is_empty();
        if is_reachable && block.terminator.is_none() {
            errors.push(ValidationError::MissingTerminator { block: block.id });
        }

        for &phi in &block.phis {
            let Some(node) = graph.get(phi) else {
                continue;
            };
            if !matches!(node.kind, NodeKind::Phi) || node.block != Some(block.id) {
                errors.push(ValidationError::WrongBlock {
                    node: phi,
                    listed_in: block.id,
                    claims: node.block,
                });
            }
            if node.inputs.len() != block.predecessors.len() {
                errors.push(ValidationError::PhiArity {
                    phi,
                    block: block.id,
                    inputs: node.inputs.len(),
                    predecessors: block.predecessors.len(),
                });
            }
        }

        for &id in block.nodes.iter().chain(&block.terminator) {
            match graph.get(id) {
                Some(node) if node.block == Some(block.id) => {}
                Some(node) => errors.push(ValidationError::WrongBlock {
                    node: id,
                    listed_in: block.id,
                    claims: node.block,
                }),
                None => errors.push(ValidationError::DeadReference {
                    node: id,
                    target: id,
                }),
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, ValueKind};

    #[test]
    fn test_valid_diamond() {
        //     entry
        //     /   \
        //   left right
        //     \   /
        //     merge
        let mut b = GraphBuilder::new("diamond");
        let cond = b.param(0, ValueKind::Int);
        let one = b.int(1);
        let two = b.int(2);
        let left = b.create_block("left");
        let right = b.create_block("right");
        let merge = b.create_block("merge");
        b.branch(cond, left, right);
        b.switch_to_block(left);
        b.goto(merge);
        b.switch_to_block(right);
        b.goto(merge);
        b.switch_to_block(merge);
        let phi = b.phi(merge, ValueKind::Int, &[one, two]);
        b.ret(Some(phi));
        let graph = b.finish();

        assert_eq!(validate_graph(&graph), Ok(()));
    }

    #[test]
    fn test_reports_arity_and_dead_inputs() {
        let mut b = GraphBuilder::new("broken");
        let cond = b.param(0, ValueKind::Int);
        let one = b.int(1);
        let left = b.create_block("left");
        let right = b.create_block("right");
        let merge = b.create_block("merge");
        b.branch(cond, left, right);
        b.switch_to_block(left);
        b.goto(merge);
        b.switch_to_block(right);
        b.goto(merge);
        b.switch_to_block(merge);
        let phi = b.phi(merge, ValueKind::Int, &[one]);
        b.ret(Some(phi));
        let mut graph = b.finish();
        graph.remove(one);

        let errors = validate_graph(&graph).unwrap_err();
        assert!(errors.contains(&ValidationError::DeadReference { node: phi, target: one }));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::PhiArity { inputs: 1, .. })));
    }
}
