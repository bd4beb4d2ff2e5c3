//! Symbolic object and block state
//!
//! A [`BlockState`] is cloned at every control flow split. Its maps are
//! shared behind `Rc` and copied on the first write, so a clone costs a few
//! reference count bumps until one side diverges.

use crate::ir::{LayoutId, LocationIdentity, NodeId, ValueKind};
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Dense index of a virtual object descriptor within one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualId(pub u32);

impl fmt::Display for VirtualId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One candidate allocation site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualObjectDescriptor {
    pub id: VirtualId,
    /// The `VirtualObject` node standing for this object in entries and
    /// frame states
    pub node: NodeId,
    pub layout: LayoutId,
    pub entry_kinds: Vec<ValueKind>,
    pub is_array: bool,
    pub has_identity: bool,
}

impl VirtualObjectDescriptor {
    pub fn entry_count(&self) -> usize {
        self.entry_kinds.len()
    }

    pub fn entry_kind(&self, index: usize) -> ValueKind {
        self.entry_kinds[index]
    }
}

pub type LockList = SmallVec<[u32; 2]>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ObjectContents {
    Virtual { entries: Vec<NodeId> },
    Materialized { value: NodeId },
}

/// Symbolic state of one object on one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectState {
    contents: ObjectContents,
    locks: LockList,
}

impl ObjectState {
    pub fn new_virtual(entries: Vec<NodeId>, locks: LockList) -> Self {
        Self {
            contents: ObjectContents::Virtual { entries },
            locks,
        }
    }

    pub fn new_materialized(value: NodeId, locks: LockList) -> Self {
        Self {
            contents: ObjectContents::Materialized { value },
            locks,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.contents, ObjectContents::Virtual { .. })
    }

    pub fn entries(&self) -> &[NodeId] {
        match &self.contents {
            ObjectContents::Virtual { entries } => entries,
            ObjectContents::Materialized { .. } => &[],
        }
    }

    pub fn entry(&self, index: usize) -> NodeId {
        match &self.contents {
            ObjectContents::Virtual { entries } => entries[index],
            ObjectContents::Materialized { .. } => panic!("entry read on a materialized object"),
        }
    }

    pub fn set_entry(&mut self, index: usize, value: NodeId) {
        match &mut self.contents {
            ObjectContents::Virtual { entries } => entries[index] = value,
            ObjectContents::Materialized { .. } => panic!("entry write on a materialized object"),
        }
    }

    pub fn materialized_value(&self) -> Option<NodeId> {
        match self.contents {
            ObjectContents::Materialized { value } => Some(value),
            ObjectContents::Virtual { .. } => None,
        }
    }

    /// The one-way transition to a concrete allocation
    pub fn escape(&mut self, value: NodeId) {
        debug_assert!(self.is_virtual(), "object escaped twice");
        self.contents = ObjectContents::Materialized { value };
    }

    /// Replace the materialized value, e.g. with a loop exit proxy
    pub fn update_materialized_value(&mut self, value: NodeId) {
        match &mut self.contents {
            ObjectContents::Materialized { value: current } => *current = value,
            ObjectContents::Virtual { .. } => panic!("object is still virtual"),
        }
    }

    pub fn locks(&self) -> &[u32] {
        &self.locks
    }

    pub fn has_locks(&self) -> bool {
        !self.locks.is_empty()
    }

    pub fn add_lock(&mut self, lock: u32) {
        self.locks.push(lock);
    }

    pub fn remove_lock(&mut self) -> Option<u32> {
        self.locks.pop()
    }

    pub fn locks_equal(&self, other: &ObjectState) -> bool {
        self.locks == other.locks
    }
}

/// Key of a read cache entry. `index` is the constant array index, or -1
/// for fields and array lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadCacheKey {
    pub object: NodeId,
    pub identity: LocationIdentity,
    pub index: i32,
    pub kind: ValueKind,
}

impl ReadCacheKey {
    pub fn new(object: NodeId, identity: LocationIdentity, index: i32, kind: ValueKind) -> Self {
        Self {
            object,
            identity,
            index,
            kind,
        }
    }

    pub fn with_object(self, object: NodeId) -> Self {
        Self { object, ..self }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockState {
    objects: Rc<BTreeMap<VirtualId, Rc<ObjectState>>>,
    scalar_aliases: Rc<FxHashMap<NodeId, NodeId>>,
    read_cache: Rc<BTreeMap<ReadCacheKey, NodeId>>,
}

impl BlockState {
    pub fn new() -> Self {
        Self::default()
    }

    // === Objects ===

    pub fn has_object(&self, id: VirtualId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn object_state_opt(&self, id: VirtualId) -> Option<&ObjectState> {
        self.objects.get(&id).map(|state| state.as_ref())
    }

    pub fn object_state(&self, id: VirtualId) -> &ObjectState {
        match self.objects.get(&id) {
            Some(state) => state,
            None => panic!("no state for virtual object {}", id),
        }
    }

    pub fn object_state_mut(&mut self, id: VirtualId) -> &mut ObjectState {
        match Rc::make_mut(&mut self.objects).get_mut(&id) {
            Some(state) => Rc::make_mut(state),
            None => panic!("no state for virtual object {}", id),
        }
    }

    pub fn add_object(&mut self, id: VirtualId, state: ObjectState) {
        Rc::make_mut(&mut self.objects).insert(id, Rc::new(state));
    }

    /// Share one object's state with another block state
    pub fn add_shared_object(&mut self, id: VirtualId, from: &BlockState) {
        if let Some(state) = from.objects.get(&id) {
            Rc::make_mut(&mut self.objects).insert(id, Rc::clone(state));
        }
    }

    /// Adopt every object state of `other` without copying
    pub fn adopt_objects(&mut self, other: &BlockState) {
        self.objects = Rc::clone(&other.objects);
    }

    pub fn object_ids(&self) -> impl Iterator<Item = VirtualId> + '_ {
        self.objects.keys().copied()
    }

    pub fn objects(&self) -> impl Iterator<Item = (VirtualId, &ObjectState)> {
        self.objects.iter().map(|(id, state)| (*id, state.as_ref()))
    }

    pub fn set_entry(&mut self, id: VirtualId, index: usize, value: NodeId) {
        if self.object_state(id).entry(index) != value {
            self.object_state_mut(id).set_entry(index, value);
        }
    }

    /// True if every state holds the same object map, compared by pointer
    /// first and structurally otherwise.
    pub fn identical_object_states(states: &[BlockState]) -> bool {
        states.windows(2).all(|pair| {
            Rc::ptr_eq(&pair[0].objects, &pair[1].objects) || pair[0].objects == pair[1].objects
        })
    }

    pub fn identical_object_state(states: &[BlockState], id: VirtualId) -> bool {
        states.windows(2).all(|pair| {
            match (pair[0].objects.get(&id), pair[1].objects.get(&id)) {
                (Some(a), Some(b)) => Rc::ptr_eq(a, b) || a == b,
                _ => false,
            }
        })
    }

    // === Scalar aliases ===

    pub fn scalar_alias(&self, node: NodeId) -> NodeId {
        self.scalar_aliases.get(&node).copied().unwrap_or(node)
    }

    pub fn add_scalar_alias(&mut self, node: NodeId, alias: NodeId) {
        Rc::make_mut(&mut self.scalar_aliases).insert(node, alias);
    }

    pub fn scalar_aliases(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.scalar_aliases.iter().map(|(k, v)| (*k, *v))
    }

    // === Read cache ===

    pub fn read_cache_get(&self, key: &ReadCacheKey) -> Option<NodeId> {
        self.read_cache.get(key).copied()
    }

    pub fn read_cache_put(&mut self, key: ReadCacheKey, value: NodeId) {
        if self.read_cache.get(&key) != Some(&value) {
            Rc::make_mut(&mut self.read_cache).insert(key, value);
        }
    }

    /// Invalidate every entry whose identity the given location may write
    pub fn kill_read_cache(&mut self, identity: LocationIdentity) {
        if identity.is_any() {
            self.kill_all_read_cache();
            return;
        }
        if self.read_cache.keys().any(|key| key.identity.overlaps(identity)) {
            Rc::make_mut(&mut self.read_cache).retain(|key, _| !key.identity.overlaps(identity));
        }
    }

    pub fn kill_all_read_cache(&mut self) {
        if !self.read_cache.is_empty() {
            self.read_cache = Rc::default();
        }
    }

    pub fn read_cache(&self) -> impl Iterator<Item = (&ReadCacheKey, NodeId)> {
        self.read_cache.iter().map(|(k, v)| (k, *v))
    }

    pub fn read_cache_len(&self) -> usize {
        self.read_cache.len()
    }

    /// Deep equality used to detect loop fixed points
    pub fn equivalent_to(&self, other: &BlockState) -> bool {
        let objects_equal = Rc::ptr_eq(&self.objects, &other.objects) || self.objects == other.objects;
        let aliases_equal = Rc::ptr_eq(&self.scalar_aliases, &other.scalar_aliases)
            || self.scalar_aliases == other.scalar_aliases;
        let cache_equal =
            Rc::ptr_eq(&self.read_cache, &other.read_cache) || self.read_cache == other.read_cache;
        objects_equal && aliases_equal && cache_equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FieldRef;
    use smallvec::smallvec;

    fn field(index: u32) -> LocationIdentity {
        LocationIdentity::Field(FieldRef::new(LayoutId(0), index))
    }

    #[test]
    fn test_clone_is_copy_on_write() {
        let v = VirtualId(0);
        let mut a = BlockState::new();
        a.add_object(v, ObjectState::new_virtual(vec![NodeId(1), NodeId(2)], LockList::new()));
        let mut b = a.clone();
        assert!(a.equivalent_to(&b));

        b.set_entry(v, 1, NodeId(5));
        assert_eq!(a.object_state(v).entry(1), NodeId(2));
        assert_eq!(b.object_state(v).entry(1), NodeId(5));
        assert!(!a.equivalent_to(&b));
        assert!(!BlockState::identical_object_states(&[a.clone(), b.clone()]));
    }

    #[test]
    fn test_escape_keeps_locks() {
        let mut state = ObjectState::new_virtual(vec![NodeId(1)], smallvec![7]);
        assert!(state.is_virtual());
        state.escape(NodeId(9));
        assert!(!state.is_virtual());
        assert_eq!(state.materialized_value(), Some(NodeId(9)));
        assert_eq!(state.locks(), &[7]);
        assert!(state.entries().is_empty());
    }

    #[test]
    fn test_read_cache_kills_by_identity() {
        let mut state = BlockState::new();
        let k1 = ReadCacheKey::new(NodeId(1), field(0), -1, ValueKind::Int);
        let k2 = ReadCacheKey::new(NodeId(1), field(1), -1, ValueKind::Int);
        state.read_cache_put(k1, NodeId(10));
        state.read_cache_put(k2, NodeId(11));
        let snapshot = state.clone();

        state.kill_read_cache(field(0));
        assert_eq!(state.read_cache_get(&k1), None);
        assert_eq!(state.read_cache_get(&k2), Some(NodeId(11)));
        assert_eq!(snapshot.read_cache_len(), 2);

        state.kill_read_cache(LocationIdentity::Any);
        assert_eq!(state.read_cache_len(), 0);
    }

    #[test]
    fn test_scalar_alias_defaults_to_self() {
        let mut state = BlockState::new();
        assert_eq!(state.scalar_alias(NodeId(3)), NodeId(3));
        state.add_scalar_alias(NodeId(3), NodeId(4));
        assert_eq!(state.scalar_alias(NodeId(3)), NodeId(4));
    }
}
