//! Graph Dump Utility
//!
//! Pretty-prints a graph block by block:
//!
//! ```text
//! graph @point
//!   n0 = param 0 : i32
//!   n3 = const 0 : i32
//!
//!   bb0: ; entry
//!     n4 = new_instance L0 : obj
//!     store_field L0.f0 n4, n0
//!     return n4
//! ```

use super::{Graph, Node, NodeId, NodeKind, VirtualMapping};
use std::fmt;

/// Dump a whole graph to a string.
pub fn dump_graph(graph: &Graph) -> String {
    GraphDump(graph).to_string()
}

/// Dump a single node to a string.
pub fn dump_node(graph: &Graph, id: NodeId) -> String {
    match graph.get(id) {
        Some(node) => format!("{}", NodeDump { id, node }),
        None => format!("{} = <dead>", id),
    }
}

/// Display adapter for a graph
pub struct GraphDump<'a>(pub &'a Graph);

impl fmt::Display for GraphDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.0;
        writeln!(f, "graph @{}", graph.name)?;

        for (index, layout) in graph.layouts().iter().enumerate() {
            let kinds: Vec<String> = layout.entry_kinds.iter().map(|k| k.to_string()).collect();
            let identity = if layout.has_identity { "" } else { " value" };
            writeln!(f, "  L{} = {}{} [{}]", index, layout.name, identity, kinds.join(", "))?;
        }

        // Floating nodes other than phis have no block
        for (id, node) in graph.live_nodes() {
            if node.is_floating() && !matches!(node.kind, NodeKind::Phi) {
                writeln!(f, "  {}", NodeDump { id, node })?;
            }
        }

        for block in graph.blocks() {
            writeln!(f)?;
            writeln!(f, "  {}: ; {}", block.id, block.name)?;
            if !block.predecessors.is_empty() {
                let preds: Vec<String> = block.predecessors.iter().map(|p| p.to_string()).collect();
                writeln!(f, "    ; preds: {}", preds.join(", "))?;
            }
            for &id in block.phis.iter().chain(&block.nodes).chain(&block.terminator) {
                match graph.get(id) {
                    Some(node) => writeln!(f, "    {}", NodeDump { id, node })?,
                    None => writeln!(f, "    {} = <dead>", id)?,
                }
            }
        }
        Ok(())
    }
}

struct NodeDump<'a> {
    id: NodeId,
    node: &'a Node,
}

fn join(ids: &[NodeId]) -> String {
    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for NodeDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node;
        let inputs = join(&node.inputs);
        let op = match &node.kind {
            NodeKind::Parameter { index } => format!("param {}", index),
            NodeKind::Constant(value) => format!("const {}", value),
            NodeKind::VirtualObject { layout, object_id } => {
                format!("virtual_object {} #{}", layout, object_id)
            }
            NodeKind::FrameState { bci, mappings } => {
                let mut text = format!("frame_state @{} [{}]", bci, inputs);
                for mapping in mappings {
                    match mapping {
                        VirtualMapping::Virtual { object, values } => {
                            text.push_str(&format!(" {{{} = ({})}}", object, join(values)))
                        }
                        VirtualMapping::Materialized { object, value } => {
                            text.push_str(&format!(" {{{} => {}}}", object, value))
                        }
                    }
                }
                text
            }
            NodeKind::Phi => format!("phi {}", inputs),
            NodeKind::Proxy => format!("proxy {}", inputs),
            NodeKind::Binary(op) => format!("{:?} {}", op, inputs).to_lowercase(),
            NodeKind::Compare(op) => format!("cmp.{:?} {}", op, inputs).to_lowercase(),
            NodeKind::ObjectEquals => format!("object_equals {}", inputs),
            NodeKind::IsNull => format!("is_null {}", inputs),
            NodeKind::NewInstance { layout } => format!("new_instance {}", layout),
            NodeKind::NewArray { layout } => format!("new_array {}", layout),
            NodeKind::LoadField { field } => format!("load_field {} {}", field, inputs),
            NodeKind::StoreField { field } => format!("store_field {} {}", field, inputs),
            NodeKind::LoadIndexed { kind } => format!("load_indexed {} {}", kind, inputs),
            NodeKind::StoreIndexed { kind } => format!("store_indexed {} {}", kind, inputs),
            NodeKind::ArrayLength => format!("array_length {}", inputs),
            NodeKind::MonitorEnter { lock } => format!("monitor_enter #{} {}", lock, inputs),
            NodeKind::MonitorExit { lock } => format!("monitor_exit #{} {}", lock, inputs),
            NodeKind::MemoryKill { location } => format!("kill {}", location),
            NodeKind::Invoke { target } => format!("invoke {}({})", target, inputs),
            NodeKind::Materialize { layout, locks } if locks.is_empty() => {
                format!("materialize {} ({})", layout, inputs)
            }
            NodeKind::Materialize { layout, locks } => {
                format!("materialize {} ({}) locks {:?}", layout, inputs, locks)
            }
            NodeKind::Goto { target } => format!("goto {}", target),
            NodeKind::If { true_target, false_target } => {
                format!("if {} then {} else {}", inputs, true_target, false_target)
            }
            NodeKind::Return => format!("return {}", inputs).trim_end().to_string(),
            NodeKind::Deoptimize => "deoptimize".to_string(),
        };

        let has_value = !matches!(
            node.value_kind,
            crate::ir::ValueKind::Void | crate::ir::ValueKind::Illegal
        );
        if has_value {
            write!(f, "{} = {} : {}", self.id, op, node.value_kind)?;
        } else {
            write!(f, "{}", op)?;
        }
        if let Some(state) = node.state {
            write!(f, " @state {}", state)?;
        }
        Ok(())
    }
}
