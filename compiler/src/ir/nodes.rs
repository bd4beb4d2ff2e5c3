//! IR node definitions
//!
//! Node kinds form a closed enumeration. Allocation-like nodes and the nodes
//! that know how to operate on virtual objects are dispatched by a single
//! match in the escape analysis virtualizer.

use super::{BlockId, Constant, LayoutId, NodeId, ValueKind};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt;

/// Node input list; most nodes have three inputs or fewer
pub type Inputs = SmallVec<[NodeId; 3]>;

/// A field of an instance layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldRef {
    pub layout: LayoutId,
    pub index: u32,
}

impl FieldRef {
    pub fn new(layout: LayoutId, index: u32) -> Self {
        Self { layout, index }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.f{}", self.layout, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectShape {
    Instance,
    Array { component: ValueKind },
}

/// Shape of an allocated object: one kind per field (or per array element)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLayout {
    pub name: String,
    pub shape: ObjectShape,
    pub entry_kinds: Vec<ValueKind>,
    /// Objects without identity may be merged with other instances of the
    /// same layout at control flow joins.
    pub has_identity: bool,
}

impl ObjectLayout {
    pub fn instance(name: impl Into<String>, fields: Vec<ValueKind>) -> Self {
        Self {
            name: name.into(),
            shape: ObjectShape::Instance,
            entry_kinds: fields,
            has_identity: true,
        }
    }

    pub fn array(name: impl Into<String>, component: ValueKind, length: usize) -> Self {
        Self {
            name: name.into(),
            shape: ObjectShape::Array { component },
            entry_kinds: vec![component; length],
            has_identity: true,
        }
    }

    /// Mark the layout as an identity-free value type
    pub fn without_identity(mut self) -> Self {
        self.has_identity = false;
        self
    }

    pub fn entry_count(&self) -> usize {
        self.entry_kinds.len()
    }

    pub fn is_array(&self) -> bool {
        matches!(self.shape, ObjectShape::Array { .. })
    }

    pub fn component_kind(&self) -> Option<ValueKind> {
        match self.shape {
            ObjectShape::Array { component } => Some(component),
            ObjectShape::Instance => None,
        }
    }
}

/// Token describing which memory a write may affect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocationIdentity {
    Any,
    Field(FieldRef),
    ArrayElement(ValueKind),
    ArrayLength,
}

impl LocationIdentity {
    pub fn is_any(self) -> bool {
        matches!(self, LocationIdentity::Any)
    }

    pub fn overlaps(self, other: LocationIdentity) -> bool {
        self.is_any() || other.is_any() || self == other
    }
}

impl fmt::Display for LocationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationIdentity::Any => f.write_str("any"),
            LocationIdentity::Field(field) => write!(f, "{}", field),
            LocationIdentity::ArrayElement(kind) => write!(f, "[{}]", kind),
            LocationIdentity::ArrayLength => f.write_str("[].length"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
}

/// Description of a virtual object attached to a frame state, so that a
/// deoptimized frame can rebuild the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualMapping {
    Virtual { object: NodeId, values: Vec<NodeId> },
    Materialized { object: NodeId, value: NodeId },
}

impl VirtualMapping {
    /// The `VirtualObject` node this mapping describes
    pub fn object(&self) -> NodeId {
        match self {
            VirtualMapping::Virtual { object, .. } | VirtualMapping::Materialized { object, .. } => {
                *object
            }
        }
    }

    pub fn references(&self) -> SmallVec<[NodeId; 4]> {
        match self {
            VirtualMapping::Virtual { object, values } => {
                let mut refs: SmallVec<[NodeId; 4]> = smallvec![*object];
                refs.extend(values.iter().copied());
                refs
            }
            VirtualMapping::Materialized { object, value } => smallvec![*object, *value],
        }
    }

    fn replace(&mut self, old: NodeId, new: NodeId) -> bool {
        let mut changed = false;
        let mut swap = |slot: &mut NodeId| {
            if *slot == old {
                *slot = new;
                changed = true;
            }
        };
        match self {
            VirtualMapping::Virtual { object, values } => {
                swap(object);
                values.iter_mut().for_each(&mut swap);
            }
            VirtualMapping::Materialized { object, value } => {
                swap(object);
                swap(value);
            }
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    // Floating nodes
    Parameter { index: u32 },
    Constant(Constant),
    /// Stand-in for a scalar-replaced allocation in frame states
    VirtualObject { layout: LayoutId, object_id: u32 },
    /// Deoptimization snapshot; inputs are the values visible at that point
    FrameState { bci: u32, mappings: Vec<VirtualMapping> },
    /// Inputs are ordered like the predecessors of the owning block
    Phi,

    // Scheduled nodes
    /// Loop exit rename of its single input
    Proxy,
    Binary(BinaryOp),
    Compare(CompareOp),
    ObjectEquals,
    IsNull,
    NewInstance { layout: LayoutId },
    NewArray { layout: LayoutId },
    LoadField { field: FieldRef },
    StoreField { field: FieldRef },
    /// Inputs: array, index
    LoadIndexed { kind: ValueKind },
    /// Inputs: array, index, value
    StoreIndexed { kind: ValueKind },
    ArrayLength,
    MonitorEnter { lock: u32 },
    MonitorExit { lock: u32 },
    /// Memory checkpoint that may write the given location
    MemoryKill { location: LocationIdentity },
    /// Call to code outside the compilation unit
    Invoke { target: String },
    /// Allocation committed by escape analysis; inputs are the entry values
    Materialize { layout: LayoutId, locks: Vec<u32> },

    // Terminators
    Goto { target: BlockId },
    If { true_target: BlockId, false_target: BlockId },
    Return,
    Deoptimize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub inputs: Inputs,
    /// Frame state for nodes observable from outside the compilation unit
    pub state: Option<NodeId>,
    /// Owning block for scheduled nodes and phis
    pub block: Option<BlockId>,
    pub value_kind: ValueKind,
}

impl Node {
    pub fn new(kind: NodeKind, inputs: &[NodeId], value_kind: ValueKind) -> Self {
        Self {
            kind,
            inputs: inputs.iter().copied().collect(),
            state: None,
            block: None,
            value_kind,
        }
    }

    pub fn constant(value: Constant) -> Self {
        Self::new(NodeKind::Constant(value), &[], value.kind())
    }

    pub fn phi(block: BlockId, kind: ValueKind, inputs: &[NodeId]) -> Self {
        let mut node = Self::new(NodeKind::Phi, inputs, kind);
        node.block = Some(block);
        node
    }

    pub fn proxy(block: BlockId, kind: ValueKind, value: NodeId) -> Self {
        let mut node = Self::new(NodeKind::Proxy, &[value], kind);
        node.block = Some(block);
        node
    }

    pub fn with_state(mut self, state: NodeId) -> Self {
        self.state = Some(state);
        self
    }

    /// Floating nodes are never part of a block's node list.
    pub fn is_floating(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Parameter { .. }
                | NodeKind::Constant(_)
                | NodeKind::VirtualObject { .. }
                | NodeKind::FrameState { .. }
                | NodeKind::Phi
        )
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Goto { .. } | NodeKind::If { .. } | NodeKind::Return | NodeKind::Deoptimize
        )
    }

    pub fn is_allocation(&self) -> bool {
        matches!(self.kind, NodeKind::NewInstance { .. } | NodeKind::NewArray { .. })
    }

    pub fn as_constant(&self) -> Option<Constant> {
        match self.kind {
            NodeKind::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self.kind {
            NodeKind::Goto { target } => smallvec![target],
            NodeKind::If { true_target, false_target } => smallvec![true_target, false_target],
            _ => SmallVec::new(),
        }
    }

    /// Whether removing an unused instance of this node changes behavior.
    pub fn has_side_effects(&self) -> bool {
        match self.kind {
            NodeKind::StoreField { .. }
            | NodeKind::StoreIndexed { .. }
            | NodeKind::MonitorEnter { .. }
            | NodeKind::MonitorExit { .. }
            | NodeKind::MemoryKill { .. }
            | NodeKind::Invoke { .. }
            | NodeKind::LoadField { .. }
            | NodeKind::LoadIndexed { .. }
            | NodeKind::ArrayLength => true,
            _ => self.is_terminator(),
        }
    }

    /// Memory written by this node, if any.
    pub fn killed_location(&self) -> Option<LocationIdentity> {
        match &self.kind {
            NodeKind::StoreField { field } => Some(LocationIdentity::Field(*field)),
            NodeKind::StoreIndexed { kind } => Some(LocationIdentity::ArrayElement(*kind)),
            NodeKind::MemoryKill { location } => Some(*location),
            NodeKind::Invoke { .. } | NodeKind::MonitorEnter { .. } | NodeKind::MonitorExit { .. } => {
                Some(LocationIdentity::Any)
            }
            _ => None,
        }
    }

    /// Every node this node refers to: inputs, frame state and the nodes
    /// named by virtual mappings.
    pub fn references(&self) -> SmallVec<[NodeId; 8]> {
        let mut refs: SmallVec<[NodeId; 8]> = self.inputs.iter().copied().collect();
        if let Some(state) = self.state {
            refs.push(state);
        }
        if let NodeKind::FrameState { mappings, .. } = &self.kind {
            for mapping in mappings {
                refs.extend(mapping.references());
            }
        }
        refs
    }

    /// Replace every reference to `old`. Returns true if anything changed.
    pub fn replace_references(&mut self, old: NodeId, new: NodeId) -> bool {
        let mut changed = false;
        for input in self.inputs.iter_mut() {
            if *input == old {
                *input = new;
                changed = true;
            }
        }
        if self.state == Some(old) {
            self.state = Some(new);
            changed = true;
        }
        if let NodeKind::FrameState { mappings, .. } = &mut self.kind {
            for mapping in mappings.iter_mut() {
                changed |= mapping.replace(old, new);
            }
        }
        changed
    }

    /// Replace the first input equal to `old`.
    pub fn replace_first_input(&mut self, old: NodeId, new: NodeId) -> bool {
        match self.inputs.iter_mut().find(|input| **input == old) {
            Some(slot) => {
                *slot = new;
                true
            }
            None => false,
        }
    }
}
