//! Merging block states at control flow joins
//!
//! Only objects tracked on every incoming path survive a merge. Objects that
//! are virtual everywhere stay virtual, with phis for entries that differ;
//! otherwise the object is materialized in the predecessors that still hold
//! it virtually and its value becomes a phi. Any materialization can change
//! other objects' entries, so the merge then starts over.
//!
//!   pred 0      pred 1
//!   v: {x}      v: {y}
//!       \        /
//!        merge            v: {phi(x, y)}

use super::effects::{EffectList, InsertPoint};
use super::escape::{PartialEscapeClosure, PhiPurpose};
use super::iteration::{BlockEffects, MergeOutcome};
use super::state::{BlockState, LockList, ObjectState, VirtualId};
use super::stats::MaterializeReason;
use crate::ir::{BlockId, Constant, NodeId, ValueKind};
use tracing::trace;

/// Bookkeeping for one merge of predecessor states
pub(crate) struct MergeProcessor {
    pub(crate) block: BlockId,
    pub(crate) predecessors: Vec<BlockId>,
    pub(crate) new_state: BlockState,
    /// Phis and other nodes that have to exist at the merge
    pub(crate) merge_effects: EffectList,
    /// Phi inputs, applied once the predecessors are complete
    pub(crate) after_merge_effects: EffectList,
}

impl MergeProcessor {
    pub(crate) fn new(block: BlockId, predecessors: Vec<BlockId>) -> Self {
        Self {
            block,
            predecessors,
            new_state: BlockState::new(),
            merge_effects: EffectList::new(),
            after_merge_effects: EffectList::new(),
        }
    }

    fn reset(&mut self) {
        self.new_state = BlockState::new();
        self.merge_effects.clear();
        self.after_merge_effects.clear();
    }

    pub(crate) fn into_outcome(self) -> MergeOutcome<BlockState> {
        MergeOutcome {
            state: self.new_state,
            merge_effects: self.merge_effects,
            after_merge_effects: self.after_merge_effects,
        }
    }
}

impl PartialEscapeClosure<'_> {
    pub(crate) fn merge_states(
        &mut self,
        mp: &mut MergeProcessor,
        states: &mut [BlockState],
        block_effects: &mut BlockEffects,
    ) {
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut materialized = false;

            if BlockState::identical_object_states(states) {
                mp.new_state.adopt_objects(&states[0]);
            } else {
                let common: Vec<VirtualId> = states[0]
                    .object_ids()
                    .filter(|id| states[1..].iter().all(|s| s.has_object(*id)))
                    .collect();
                for object in common {
                    materialized |= self.merge_object(mp, object, states, block_effects);
                }
            }

            let graph = self.graph;
            for &phi in &graph.block(mp.block).phis {
                self.remove_alias(phi);
                if self.has_virtual_inputs(phi) {
                    materialized |= self.process_phi(mp, phi, states, block_effects);
                }
            }

            if !materialized {
                break;
            }
            trace!("merge at {} materialized objects, round {}", mp.block, rounds);
            mp.reset();
        }

        self.merge_scalar_aliases(mp, states);
        if self.read_elimination.is_some() {
            self.merge_read_caches(mp, states);
        }
    }

    fn merge_object(
        &mut self,
        mp: &mut MergeProcessor,
        object: VirtualId,
        states: &mut [BlockState],
        block_effects: &mut BlockEffects,
    ) -> bool {
        if BlockState::identical_object_state(states, object) {
            mp.new_state.add_shared_object(object, &states[0]);
            return false;
        }

        let first = states[0].object_state(object);
        let mut virtual_count = 0;
        let mut locks_match = true;
        let mut unique_materialized = first.materialized_value();
        for state in states.iter() {
            let os = state.object_state(object);
            if os.is_virtual() {
                virtual_count += 1;
                unique_materialized = None;
                locks_match &= os.locks_equal(first);
            } else if os.materialized_value() != unique_materialized {
                unique_materialized = None;
            }
        }

        if virtual_count == states.len() && locks_match {
            let sources = vec![object; states.len()];
            return self.merge_object_states(mp, object, &sources, states, block_effects);
        }
        if let Some(value) = unique_materialized {
            mp.new_state
                .add_object(object, ObjectState::new_materialized(value, LockList::new()));
            return false;
        }

        let phi = self.merge_phi(mp, PhiPurpose::Materialized(object), ValueKind::Object);
        let mut materialized = false;
        for i in 0..states.len() {
            materialized |= self.materialize_in_predecessor(
                mp,
                i,
                object,
                states,
                block_effects,
                MaterializeReason::Merge,
            );
            let value = self.materialized_value(&states[i], object);
            mp.after_merge_effects.initialize_phi_input(phi, i, value);
        }
        mp.new_state
            .add_object(object, ObjectState::new_materialized(phi, LockList::new()));
        materialized
    }

    /// Merge virtual objects `sources[i]` of every predecessor into
    /// `result`. Returns true if something had to be materialized.
    fn merge_object_states(
        &mut self,
        mp: &mut MergeProcessor,
        result: VirtualId,
        sources: &[VirtualId],
        states: &mut [BlockState],
        block_effects: &mut BlockEffects,
    ) -> bool {
        let descriptor = self.descriptor(result).clone();
        let count = descriptor.entry_count();
        let mut compatible = true;

        // Int slot pairs holding a wide value on some path
        let mut two_slot: Vec<Option<ValueKind>> = vec![None; count];
        'kinds: for (i, state) in states.iter().enumerate() {
            let os = state.object_state(sources[i]);
            let mut index = 0;
            while index < count {
                let kind = self.value_kind(os.entry(index));
                if descriptor.entry_kind(index) == ValueKind::Int && kind.needs_two_slots() {
                    if two_slot[index].is_some_and(|k| k != kind) || index + 1 >= count {
                        compatible = false;
                        break 'kinds;
                    }
                    two_slot[index] = Some(kind);
                    index += 1;
                }
                index += 1;
            }
        }

        if compatible {
            'rewrite: for index in 0..count {
                let Some(wide) = two_slot[index] else {
                    continue;
                };
                for i in 0..states.len() {
                    let os = states[i].object_state(sources[i]);
                    let value = os.entry(index);
                    if self.value_kind(value) == wide {
                        continue;
                    }
                    let next = os.entry(index + 1);
                    let zero = Some(Constant::Int(0));
                    if self.constant_value(value) == zero && self.constant_value(next) == zero {
                        trace!("widening int pair {} of {} to {}", index, result, wide);
                        let wide_zero = self.constant(wide.default_constant());
                        let illegal = self.constant(Constant::Illegal);
                        states[i].set_entry(sources[i], index, wide_zero);
                        states[i].set_entry(sources[i], index + 1, illegal);
                    } else {
                        compatible = false;
                        break 'rewrite;
                    }
                }
            }
        }

        if !compatible {
            let phi = self.merge_phi(mp, PhiPurpose::Materialized(result), ValueKind::Object);
            for (i, &source) in sources.iter().enumerate() {
                self.materialize_in_predecessor(
                    mp,
                    i,
                    source,
                    states,
                    block_effects,
                    MaterializeReason::Merge,
                );
                let value = self.materialized_value(&states[i], source);
                mp.after_merge_effects.initialize_phi_input(phi, i, value);
            }
            mp.new_state
                .add_object(result, ObjectState::new_materialized(phi, LockList::new()));
            return true;
        }

        let first = states[0].object_state(sources[0]);
        let mut values: Vec<NodeId> = first.entries().to_vec();
        let locks: LockList = first.locks().iter().copied().collect();
        let mut phis: Vec<Option<NodeId>> = vec![None; count];
        let mut index = 0;
        while index < count {
            let differs = (1..states.len())
                .any(|i| states[i].object_state(sources[i]).entry(index) != values[index]);
            if differs {
                let kind = self.value_kind(values[index]);
                phis[index] = Some(self.phi_for(
                    mp.block,
                    PhiPurpose::Entry(result, index),
                    kind,
                    mp.predecessors.len(),
                ));
            }
            if two_slot[index].is_some() {
                // The second half of a wide value has no phi of its own
                index += 1;
                phis[index] = None;
                values[index] = self.constant(Constant::Illegal);
            }
            index += 1;
        }

        let mut materialized = false;
        for (index, phi) in phis.iter().enumerate() {
            let Some(phi) = *phi else {
                continue;
            };
            let node = self.created_node(phi);
            mp.merge_effects.add_phi(phi, node);
            if descriptor.entry_kind(index) == ValueKind::Object {
                materialized |= self.merge_object_entry(mp, sources, states, phi, index, block_effects);
            } else {
                for (i, state) in states.iter().enumerate() {
                    let os = state.object_state(sources[i]);
                    if !os.is_virtual() {
                        break;
                    }
                    mp.after_merge_effects.initialize_phi_input(phi, i, os.entry(index));
                }
            }
            values[index] = phi;
        }

        mp.new_state
            .add_object(result, ObjectState::new_virtual(values, locks));
        materialized
    }

    /// Fill the phi of an object entry. Entries that are themselves virtual
    /// objects have to be materialized in their predecessor.
    fn merge_object_entry(
        &mut self,
        mp: &mut MergeProcessor,
        sources: &[VirtualId],
        states: &mut [BlockState],
        phi: NodeId,
        index: usize,
        block_effects: &mut BlockEffects,
    ) -> bool {
        let mut materialized = false;
        for i in 0..states.len() {
            let object = sources[i];
            if !states[i].object_state(object).is_virtual() {
                break;
            }
            let mut entry = states[i].object_state(object).entry(index);
            let target = self.virtual_node(entry).filter(|t| states[i].has_object(*t));
            if let Some(target) = target {
                materialized |= self.materialize_in_predecessor(
                    mp,
                    i,
                    target,
                    states,
                    block_effects,
                    MaterializeReason::Merge,
                );
                if states[i].object_state(object).is_virtual() {
                    entry = self.materialized_value(&states[i], target);
                    states[i].set_entry(object, index, entry);
                }
            }
            mp.after_merge_effects.initialize_phi_input(phi, i, entry);
        }
        materialized
    }

    /// Handle a phi of the merge block whose inputs may be virtual
    fn process_phi(
        &mut self,
        mp: &mut MergeProcessor,
        phi: NodeId,
        states: &mut [BlockState],
        block_effects: &mut BlockEffects,
    ) -> bool {
        let graph = self.graph;
        let inputs = graph.node(phi).inputs.clone();
        let n = states.len();
        let mut virtuals: Vec<Option<VirtualId>> = vec![None; n];
        let mut virtual_inputs = 0;
        let mut unique = true;
        let mut first_virtual: Option<VirtualId> = None;

        for i in 0..n {
            let input = inputs[i];
            if input == phi {
                // Loop carried self reference
                virtual_inputs += 1;
                continue;
            }
            let Some(object) = self.resolve_virtual(&states[i], input) else {
                continue;
            };
            virtuals[i] = Some(object);
            if !states[i].object_state(object).is_virtual() {
                continue;
            }
            match first_virtual {
                None => first_virtual = Some(object),
                Some(first) if first != object => unique = false,
                _ => {}
            }
            virtual_inputs += 1;
        }

        if virtual_inputs == n {
            if let (true, Some(object)) = (unique, first_virtual) {
                trace!("{} is an alias of {}", phi, object);
                self.add_virtual_alias(object, phi);
                mp.merge_effects.delete_node(phi);
                return false;
            }
            if let Some(template) = first_virtual {
                if self.phi_inputs_compatible(template, &inputs, &virtuals, states) {
                    let object = self.virtual_for_phi(phi, template);
                    let sources: Vec<VirtualId> =
                        virtuals.iter().map(|v| v.unwrap_or(object)).collect();
                    let all_virtual = sources.iter().enumerate().all(|(i, source)| {
                        states[i]
                            .object_state_opt(*source)
                            .is_some_and(|o| o.is_virtual())
                    });
                    if all_virtual {
                        trace!("{} merges compatible objects into {}", phi, object);
                        mp.merge_effects.delete_node(phi);
                        let materialized =
                            self.merge_object_states(mp, object, &sources, states, block_effects);
                        let node = self.descriptor(object).node;
                        self.add_virtual_alias(object, node);
                        self.add_virtual_alias(object, phi);
                        return materialized;
                    }
                }
            }
        }

        let mut materialized = false;
        for i in 0..n {
            if let Some(object) = virtuals[i] {
                materialized |= self.materialize_in_predecessor(
                    mp,
                    i,
                    object,
                    states,
                    block_effects,
                    MaterializeReason::Phi,
                );
            }
        }
        for i in 0..n {
            if let Some(object) = virtuals[i] {
                let value = self.alias_and_resolve(&states[i], self.descriptor(object).node);
                mp.after_merge_effects.initialize_phi_input(phi, i, value);
            }
        }
        materialized
    }

    /// Inputs share a shape and locks, and none of them can be observed by
    /// identity
    fn phi_inputs_compatible(
        &self,
        template: VirtualId,
        inputs: &[NodeId],
        virtuals: &[Option<VirtualId>],
        states: &[BlockState],
    ) -> bool {
        let shape = self.descriptor(template);
        let template_state = states
            .iter()
            .zip(virtuals)
            .find_map(|(s, v)| v.filter(|v| *v == template).map(|_| s.object_state(template)));
        let Some(template_state) = template_state else {
            return false;
        };
        for (i, candidate) in virtuals.iter().enumerate() {
            let Some(candidate) = *candidate else {
                // Self references are only fine for identity-free objects
                if shape.has_identity {
                    return false;
                }
                continue;
            };
            let other = self.descriptor(candidate);
            if other.layout != shape.layout || other.entry_count() != shape.entry_count() {
                return false;
            }
            if !states[i].object_state(candidate).locks_equal(template_state) {
                return false;
            }
            if other.has_identity && !self.is_single_usage_allocation(inputs[i], &states[i], virtuals) {
                return false;
            }
        }
        true
    }

    fn materialize_in_predecessor(
        &mut self,
        mp: &MergeProcessor,
        index: usize,
        object: VirtualId,
        states: &mut [BlockState],
        block_effects: &mut BlockEffects,
        reason: MaterializeReason,
    ) -> bool {
        let predecessor = mp.predecessors[index];
        let effects = block_effects.entry(predecessor).or_default();
        self.ensure_materialized(
            &mut states[index],
            object,
            InsertPoint::BlockEnd(predecessor),
            effects,
            reason,
        )
    }

    /// Phi for `purpose`, recorded in the merge effects
    pub(crate) fn merge_phi(
        &mut self,
        mp: &mut MergeProcessor,
        purpose: PhiPurpose,
        kind: ValueKind,
    ) -> NodeId {
        let phi = self.phi_for(mp.block, purpose, kind, mp.predecessors.len());
        let node = self.created_node(phi);
        mp.merge_effects.add_phi(phi, node);
        phi
    }

    fn merge_scalar_aliases(&self, mp: &mut MergeProcessor, states: &[BlockState]) {
        let (first, rest) = match states.split_first() {
            Some(split) => split,
            None => return,
        };
        for (node, alias) in first.scalar_aliases() {
            if rest.iter().all(|s| s.scalar_alias(node) == alias) {
                mp.new_state.add_scalar_alias(node, alias);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::schedule::{BlockScheduler, Scheduler};
    use crate::ir::{Graph, GraphBuilder, LayoutId, ObjectLayout};
    use crate::pea::config::PeaConfig;
    use crate::pea::effects::Effect;

    //        entry
    //        /   \
    //     left   right
    //        \   /
    //        merge
    fn diamond() -> (Graph, NodeId, BlockId, BlockId, BlockId) {
        let mut b = GraphBuilder::new("diamond");
        b.layout(ObjectLayout::instance(
            "Box",
            vec![ValueKind::Int, ValueKind::Int, ValueKind::Object],
        ));
        let cond = b.param(0, ValueKind::Int);
        let alloc = b.new_instance(LayoutId(0));
        let left = b.create_block("left");
        let right = b.create_block("right");
        let merge = b.create_block("merge");
        b.branch(cond, left, right);
        b.switch_to_block(left);
        b.goto(merge);
        b.switch_to_block(right);
        b.goto(merge);
        b.switch_to_block(merge);
        b.ret(None);
        (b.finish(), alloc, left, right, merge)
    }

    fn virtual_state(object: VirtualId, entries: Vec<NodeId>) -> BlockState {
        let mut state = BlockState::new();
        state.add_object(object, ObjectState::new_virtual(entries, LockList::new()));
        state
    }

    #[test]
    fn test_differing_entries_get_a_phi() {
        let (graph, alloc, left, right, merge) = diamond();
        let cfg = BlockScheduler::new().schedule(&graph).unwrap();
        let config = PeaConfig::escape_analysis_only();
        let mut closure = PartialEscapeClosure::new(&graph, &cfg, &config);
        let object = closure.virtual_for_allocation(alloc, LayoutId(0));
        let zero = closure.constant(Constant::Int(0));
        let one = closure.constant(Constant::Int(1));
        let two = closure.constant(Constant::Int(2));
        let null = closure.constant(Constant::Null);

        let mut states = vec![
            virtual_state(object, vec![one, zero, null]),
            virtual_state(object, vec![two, zero, null]),
        ];
        let mut mp = MergeProcessor::new(merge, vec![left, right]);
        let mut block_effects = BlockEffects::default();
        closure.merge_states(&mut mp, &mut states, &mut block_effects);

        let merged = mp.new_state.object_state(object);
        assert!(merged.is_virtual());
        let phi = merged.entry(0);
        assert!(closure.is_phi_at(phi, merge));
        assert_eq!(merged.entry(1), zero);
        assert_eq!(merged.entry(2), null);
        assert!(matches!(mp.merge_effects.iter().next(), Some(Effect::AddPhi { .. })));
        assert_eq!(mp.after_merge_effects.len(), 2);
        assert!(block_effects.values().all(|e| e.is_empty()));
    }

    #[test]
    fn test_virtual_and_materialized_paths_materialize() {
        let (graph, alloc, left, right, merge) = diamond();
        let cfg = BlockScheduler::new().schedule(&graph).unwrap();
        let config = PeaConfig::escape_analysis_only();
        let mut closure = PartialEscapeClosure::new(&graph, &cfg, &config);
        let object = closure.virtual_for_allocation(alloc, LayoutId(0));
        let zero = closure.constant(Constant::Int(0));
        let null = closure.constant(Constant::Null);

        let mut escaped = virtual_state(object, vec![zero, zero, null]);
        let mut effects = EffectList::new();
        closure.ensure_materialized(
            &mut escaped,
            object,
            InsertPoint::BlockEnd(left),
            &mut effects,
            MaterializeReason::Unhandled,
        );
        let mut states = vec![escaped, virtual_state(object, vec![zero, zero, null])];
        let mut mp = MergeProcessor::new(merge, vec![left, right]);
        let mut block_effects = BlockEffects::default();
        closure.merge_states(&mut mp, &mut states, &mut block_effects);

        let merged = mp.new_state.object_state(object);
        assert!(!merged.is_virtual());
        assert!(closure.is_phi_at(merged.materialized_value().unwrap(), merge));
        // Only the still virtual path gets a new allocation
        assert!(block_effects.get(&left).map_or(true, |e| e.is_empty()));
        assert_eq!(block_effects[&right].len(), 1);
        assert_eq!(mp.after_merge_effects.len(), 2);
    }

    #[test]
    fn test_int_pair_widens_to_long() {
        let (graph, alloc, left, right, merge) = diamond();
        let cfg = BlockScheduler::new().schedule(&graph).unwrap();
        let config = PeaConfig::escape_analysis_only();
        let mut closure = PartialEscapeClosure::new(&graph, &cfg, &config);
        let object = closure.virtual_for_allocation(alloc, LayoutId(0));
        let zero = closure.constant(Constant::Int(0));
        let null = closure.constant(Constant::Null);
        let wide = closure.constant(Constant::Long(7));
        let illegal = closure.constant(Constant::Illegal);

        let mut states = vec![
            virtual_state(object, vec![zero, zero, null]),
            virtual_state(object, vec![wide, illegal, null]),
        ];
        let mut mp = MergeProcessor::new(merge, vec![left, right]);
        let mut block_effects = BlockEffects::default();
        closure.merge_states(&mut mp, &mut states, &mut block_effects);

        let merged = mp.new_state.object_state(object);
        assert!(merged.is_virtual());
        assert_eq!(closure.value_kind(merged.entry(0)), ValueKind::Long);
        assert_eq!(merged.entry(1), illegal);
        let long_zero = closure.constant(Constant::Long(0));
        assert_eq!(states[0].object_state(object).entry(0), long_zero);
    }

    #[test]
    fn test_mismatched_wide_kinds_materialize() {
        let (graph, alloc, left, right, merge) = diamond();
        let cfg = BlockScheduler::new().schedule(&graph).unwrap();
        let config = PeaConfig::escape_analysis_only();
        let mut closure = PartialEscapeClosure::new(&graph, &cfg, &config);
        let object = closure.virtual_for_allocation(alloc, LayoutId(0));
        let one = closure.constant(Constant::Int(1));
        let null = closure.constant(Constant::Null);
        let wide = closure.constant(Constant::Long(7));
        let illegal = closure.constant(Constant::Illegal);

        // A non-zero int pair cannot be reinterpreted as a long
        let mut states = vec![
            virtual_state(object, vec![one, one, null]),
            virtual_state(object, vec![wide, illegal, null]),
        ];
        let mut mp = MergeProcessor::new(merge, vec![left, right]);
        let mut block_effects = BlockEffects::default();
        closure.merge_states(&mut mp, &mut states, &mut block_effects);

        assert!(!mp.new_state.object_state(object).is_virtual());
        assert_eq!(block_effects[&left].len(), 1);
        assert_eq!(block_effects[&right].len(), 1);
    }
}
