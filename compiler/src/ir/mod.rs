//! Sea-of-nodes IR with a block schedule
//!
//! The graph is an arena of nodes addressed by [`NodeId`]. Scheduled nodes
//! live in exactly one basic block in program order; floating nodes
//! (constants, parameters, virtual objects and frame states) are unscheduled
//! and only referenced through inputs.

pub mod builder;
pub mod dump;
pub mod graph;
pub mod loop_analysis;
pub mod nodes;
pub mod optimization;
pub mod schedule;
pub mod validation;

pub use builder::GraphBuilder;
pub use graph::{Block, Graph};
pub use nodes::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a node in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Handle of a basic block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The entry block of every graph
    pub fn entry() -> Self {
        Self(0)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Handle of an object layout registered with the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayoutId(pub u32);

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Machine-level kind of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Object,
    Void,
    /// Second half of a two-slot value
    Illegal,
}

impl ValueKind {
    /// Long and double values occupy two int-sized slots in arrays.
    pub fn needs_two_slots(self) -> bool {
        matches!(self, ValueKind::Long | ValueKind::Double)
    }

    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ValueKind::Int | ValueKind::Long | ValueKind::Float | ValueKind::Double
        )
    }

    /// The value a freshly allocated slot of this kind holds.
    pub fn default_constant(self) -> Constant {
        match self {
            ValueKind::Int => Constant::Int(0),
            ValueKind::Long => Constant::Long(0),
            ValueKind::Float => Constant::Float(0),
            ValueKind::Double => Constant::Double(0),
            ValueKind::Object => Constant::Null,
            ValueKind::Void | ValueKind::Illegal => Constant::Illegal,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "i32",
            ValueKind::Long => "i64",
            ValueKind::Float => "f32",
            ValueKind::Double => "f64",
            ValueKind::Object => "obj",
            ValueKind::Void => "void",
            ValueKind::Illegal => "illegal",
        };
        f.write_str(name)
    }
}

/// Constant value. Floating point constants are stored as raw bits so that
/// constants can be hashed and compared structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Null,
    Illegal,
}

impl Constant {
    pub fn float(value: f32) -> Self {
        Constant::Float(value.to_bits())
    }

    pub fn double(value: f64) -> Self {
        Constant::Double(value.to_bits())
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Constant::Int(_) => ValueKind::Int,
            Constant::Long(_) => ValueKind::Long,
            Constant::Float(_) => ValueKind::Float,
            Constant::Double(_) => ValueKind::Double,
            Constant::Null => ValueKind::Object,
            Constant::Illegal => ValueKind::Illegal,
        }
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            Constant::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_default_for_kind(self) -> bool {
        self == self.kind().default_constant()
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{}i", v),
            Constant::Long(v) => write!(f, "{}L", v),
            Constant::Float(bits) => write!(f, "{}f", f32::from_bits(*bits)),
            Constant::Double(bits) => write!(f, "{}d", f64::from_bits(*bits)),
            Constant::Null => f.write_str("null"),
            Constant::Illegal => f.write_str("illegal"),
        }
    }
}
