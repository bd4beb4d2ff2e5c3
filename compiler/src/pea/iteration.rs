//! Block iteration driver
//!
//! Walks the schedule in reverse postorder, handing each block the state of
//! its predecessor (or the merge of all predecessors) and collecting the
//! block's effects. Loops are processed as a unit: the body is analyzed
//! with a guessed header state until merging the back edges reproduces the
//! guess, rolling back the effects of every failed round.
//!
//! ```text
//!   entry state ----+
//!                   v
//!              [ header ] <--+   guess_{n+1} = merge(entry, back edges_n)
//!                   |        |
//!              [  body  ] ---+   stop once guess_{n+1} == guess_n
//! ```

use super::effects::{ApplyContext, ApplyOutcome, Checkpoint, Effect, EffectList};
use super::stats::{MaterializeReason, PeaStatistics};
use crate::error::{PeaError, PeaResult};
use crate::ir::schedule::{ControlFlowGraph, LoopInfo};
use crate::ir::{BlockId, Graph, NodeKind};
use fxhash::FxHashMap;
use tracing::{debug, trace};

/// Effects recorded per block
pub type BlockEffects = FxHashMap<BlockId, EffectList>;

/// Result of merging predecessor states at a join
pub struct MergeOutcome<S> {
    pub state: S,
    /// Nodes that must exist at the start of the merge block
    pub merge_effects: EffectList,
    /// Phi inputs, valid once every predecessor has been processed
    pub after_merge_effects: EffectList,
}

/// Analysis plugged into the [`BlockIterator`]
pub trait EffectsClosure {
    type State: Clone;

    fn initial_state(&mut self) -> Self::State;

    fn process_block(&mut self, block: BlockId, state: &mut Self::State, effects: &mut EffectList);

    /// Merge `states`, ordered like the predecessors of `merge`. The closure
    /// may change the predecessor states and record effects in their blocks.
    fn merge(
        &mut self,
        merge: BlockId,
        states: &mut [Self::State],
        block_effects: &mut BlockEffects,
    ) -> MergeOutcome<Self::State>;

    /// Forget facts the loop body may invalidate before the first round
    fn strip_killed_loop_locations(&mut self, _info: &LoopInfo, _state: &mut Self::State) {}

    /// Adjust the first guess of the header state
    fn process_initial_loop_state(&mut self, _info: &LoopInfo, _state: &mut Self::State) {}

    fn process_loop_exit(
        &mut self,
        info: &LoopInfo,
        exit: BlockId,
        entry_state: &Self::State,
        exit_state: &mut Self::State,
        effects: &mut EffectList,
    );

    fn equivalent(&self, a: &Self::State, b: &Self::State) -> bool;
}

/// Everything one traversal produced
#[derive(Debug, Default)]
pub struct IterationResult {
    pub block_effects: BlockEffects,
    /// Phi inputs of stable loop headers, in the order the loops settled
    pub loop_after_effects: Vec<EffectList>,
    pub loop_iterations: usize,
}

struct RegionResult<S> {
    /// States flowing back to the region's loop header, by source block
    end_states: Vec<(BlockId, S)>,
    /// States leaving the region, by exit block
    exit_states: Vec<(BlockId, S)>,
}

pub struct BlockIterator<'a, C: EffectsClosure> {
    closure: &'a mut C,
    cfg: &'a ControlFlowGraph,
    max_loop_iterations: usize,
    block_effects: BlockEffects,
    loop_after_effects: Vec<EffectList>,
    loop_iterations: usize,
}

impl<'a, C: EffectsClosure> BlockIterator<'a, C> {
    pub fn new(closure: &'a mut C, cfg: &'a ControlFlowGraph, max_loop_iterations: usize) -> Self {
        Self {
            closure,
            cfg,
            max_loop_iterations,
            block_effects: BlockEffects::default(),
            loop_after_effects: Vec::new(),
            loop_iterations: 0,
        }
    }

    pub fn run(mut self) -> PeaResult<IterationResult> {
        let initial = self.closure.initial_state();
        let result = self.process_region(None, self.cfg.entry(), initial)?;
        debug_assert!(result.end_states.is_empty() && result.exit_states.is_empty());
        Ok(IterationResult {
            block_effects: self.block_effects,
            loop_after_effects: self.loop_after_effects,
            loop_iterations: self.loop_iterations,
        })
    }

    fn in_region(region: Option<&LoopInfo>, block: BlockId) -> bool {
        region.map_or(true, |info| info.contains(block))
    }

    /// Process the blocks of `region` (a loop body, or the whole graph)
    /// starting at `start` with `start_state`
    fn process_region(
        &mut self,
        region: Option<&LoopInfo>,
        start: BlockId,
        start_state: C::State,
    ) -> PeaResult<RegionResult<C::State>> {
        let cfg = self.cfg;
        let mut result = RegionResult {
            end_states: Vec::new(),
            exit_states: Vec::new(),
        };
        let mut edge_states: FxHashMap<(BlockId, BlockId), C::State> = FxHashMap::default();
        let mut pending_start = Some(start_state);
        // Blocks of nested loops are handled by their own loop
        let mut nested: Vec<&LoopInfo> = Vec::new();

        for &block in cfg.reverse_postorder() {
            if !Self::in_region(region, block) || nested.iter().any(|l| l.contains(block)) {
                continue;
            }

            if block != start {
                if let Some(info) = cfg.loop_at(block) {
                    // Back edges are not processed yet; the loop only needs
                    // the state of its forward edge
                    let forward = cfg.predecessors(block)[0];
                    let Some(state) = edge_states.remove(&(forward, block)) else {
                        return Err(PeaError::InvalidSchedule(format!(
                            "loop {} reached before its entry {}",
                            block, forward
                        )));
                    };
                    nested.push(info);
                    for (exit, exit_state) in self.process_loop(info, state)? {
                        if Self::in_region(region, exit) {
                            let pred = cfg.predecessors(exit)[0];
                            edge_states.insert((pred, exit), exit_state);
                        } else {
                            result.exit_states.push((exit, exit_state));
                        }
                    }
                    continue;
                }
            }

            let mut state = if block == start {
                match pending_start.take() {
                    Some(state) => state,
                    None => continue,
                }
            } else {
                self.incoming_state(block, &mut edge_states)?
            };

            let effects = self.block_effects.entry(block).or_default();
            self.closure.process_block(block, &mut state, effects);
            trace!("processed {}", block);

            if let Some((&last, rest)) = cfg.successors(block).split_last() {
                for &succ in rest {
                    route_edge(region, block, succ, state.clone(), &mut edge_states, &mut result);
                }
                route_edge(region, block, last, state, &mut edge_states, &mut result);
            }
        }
        Ok(result)
    }

    /// State on entry to `block`: the single incoming edge, or the merge of
    /// all of them
    fn incoming_state(
        &mut self,
        block: BlockId,
        edge_states: &mut FxHashMap<(BlockId, BlockId), C::State>,
    ) -> PeaResult<C::State> {
        let predecessors = self.cfg.predecessors(block);
        let mut states = Vec::with_capacity(predecessors.len());
        for &pred in predecessors {
            match edge_states.remove(&(pred, block)) {
                Some(state) => states.push(state),
                None => {
                    return Err(PeaError::InvalidSchedule(format!(
                        "{} reached before its predecessor {}",
                        block, pred
                    )))
                }
            }
        }
        if states.len() == 1 {
            if let Some(state) = states.pop() {
                return Ok(state);
            }
        }
        let outcome = self.closure.merge(block, &mut states, &mut self.block_effects);
        let effects = self.block_effects.entry(block).or_default();
        let mut merge_effects = outcome.merge_effects;
        let mut after_merge_effects = outcome.after_merge_effects;
        effects.append(&mut merge_effects);
        effects.append(&mut after_merge_effects);
        Ok(outcome.state)
    }

    /// Run the body of the loop at `info.header` to a fixed point. Returns
    /// the states at the loop's exits.
    fn process_loop(
        &mut self,
        info: &LoopInfo,
        incoming: C::State,
    ) -> PeaResult<Vec<(BlockId, C::State)>> {
        let cfg = self.cfg;
        let mut entry_state = incoming;
        self.closure.strip_killed_loop_locations(info, &mut entry_state);
        let mut guess = entry_state.clone();
        self.closure.process_initial_loop_state(info, &mut guess);

        let loop_blocks: Vec<BlockId> = cfg
            .reverse_postorder()
            .iter()
            .copied()
            .filter(|b| info.contains(*b))
            .collect();

        for iteration in 1..=self.max_loop_iterations {
            self.loop_iterations += 1;
            let checkpoints: Vec<(BlockId, Checkpoint)> = loop_blocks
                .iter()
                .map(|&b| (b, self.block_effects.entry(b).or_default().checkpoint()))
                .collect();
            let after_checkpoint = self.loop_after_effects.len();

            let body = self.process_region(Some(info), info.header, guess.clone())?;

            let mut states = Vec::with_capacity(1 + info.back_edges.len());
            states.push(entry_state);
            let mut end_states = body.end_states;
            for source in &info.back_edges {
                match end_states.iter().position(|(b, _)| b == source) {
                    Some(pos) => states.push(end_states.swap_remove(pos).1),
                    None => {
                        return Err(PeaError::InvalidSchedule(format!(
                            "back edge {} -> {} was never reached",
                            source, info.header
                        )))
                    }
                }
            }

            let outcome = self
                .closure
                .merge(info.header, &mut states, &mut self.block_effects);
            entry_state = states.swap_remove(0);

            if self.closure.equivalent(&outcome.state, &guess) {
                debug!("loop {} stable after {} iterations", info.header, iteration);
                self.block_effects
                    .entry(info.header)
                    .or_default()
                    .insert_all(0, outcome.merge_effects);
                self.loop_after_effects.push(outcome.after_merge_effects);

                let mut exits = Vec::with_capacity(body.exit_states.len());
                for (exit, mut exit_state) in body.exit_states {
                    let effects = self.block_effects.entry(exit).or_default();
                    self.closure
                        .process_loop_exit(info, exit, &entry_state, &mut exit_state, effects);
                    exits.push((exit, exit_state));
                }
                return Ok(exits);
            }

            trace!("loop {} not stable after round {}", info.header, iteration);
            guess = outcome.state;
            for (block, checkpoint) in checkpoints {
                if let Some(effects) = self.block_effects.get_mut(&block) {
                    effects.truncate(checkpoint);
                }
            }
            self.loop_after_effects.truncate(after_checkpoint);
        }

        Err(PeaError::LoopDidNotConverge {
            header: info.header,
            iterations: self.max_loop_iterations,
        })
    }
}

fn route_edge<S>(
    region: Option<&LoopInfo>,
    from: BlockId,
    to: BlockId,
    state: S,
    edge_states: &mut FxHashMap<(BlockId, BlockId), S>,
    result: &mut RegionResult<S>,
) {
    match region {
        Some(info) if info.header == to => result.end_states.push((from, state)),
        Some(info) if !info.contains(to) => result.exit_states.push((to, state)),
        _ => {
            edge_states.insert((from, to), state);
        }
    }
}

/// All effects of one sweep, in the order they are applied
#[derive(Debug, Default)]
pub struct SweepEffects {
    /// Nodes shared by all blocks: constants and virtual object nodes
    pub preamble: EffectList,
    pub blocks: Vec<(BlockId, EffectList)>,
    pub loop_after_effects: Vec<EffectList>,
    pub loop_iterations: usize,
}

impl SweepEffects {
    /// Order per-block effects by the schedule
    pub fn new(preamble: EffectList, result: IterationResult, cfg: &ControlFlowGraph) -> Self {
        let mut block_effects = result.block_effects;
        let blocks = cfg
            .reverse_postorder()
            .iter()
            .filter_map(|b| block_effects.remove(b).map(|e| (*b, e)))
            .filter(|(_, e)| !e.is_empty())
            .collect();
        Self {
            preamble,
            blocks,
            loop_after_effects: result
                .loop_after_effects
                .into_iter()
                .filter(|e| !e.is_empty())
                .collect(),
            loop_iterations: result.loop_iterations,
        }
    }

    /// True if the sweep would not change the graph. The preamble alone
    /// only adds nodes nothing uses.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.loop_after_effects.is_empty()
    }

    pub fn effect_count(&self) -> usize {
        self.preamble.len()
            + self.blocks.iter().map(|(_, e)| e.len()).sum::<usize>()
            + self.loop_after_effects.iter().map(|e| e.len()).sum::<usize>()
    }

    fn lists(&self) -> impl Iterator<Item = &EffectList> {
        std::iter::once(&self.preamble)
            .chain(self.blocks.iter().map(|(_, e)| e))
            .chain(self.loop_after_effects.iter())
    }

    pub fn apply(&self, graph: &mut Graph) -> ApplyOutcome {
        let mut ctx = ApplyContext::new();
        for list in self.lists() {
            list.apply(graph, &mut ctx);
        }
        ctx.finish(graph)
    }

    /// Counters for this sweep. Must run before the effects are applied.
    pub fn statistics(&self, graph: &Graph) -> PeaStatistics {
        let mut stats = PeaStatistics {
            loop_iterations: self.loop_iterations,
            ..PeaStatistics::default()
        };
        for effect in self.lists().flat_map(|l| l.iter()) {
            match effect {
                Effect::DeleteNode { node } => match graph.get(*node).map(|n| &n.kind) {
                    Some(NodeKind::NewInstance { .. } | NodeKind::NewArray { .. }) => {
                        stats.allocations_virtualized += 1
                    }
                    Some(
                        NodeKind::LoadField { .. } | NodeKind::LoadIndexed { .. } | NodeKind::ArrayLength,
                    ) => stats.loads_eliminated += 1,
                    Some(NodeKind::StoreField { .. } | NodeKind::StoreIndexed { .. }) => {
                        stats.stores_eliminated += 1
                    }
                    _ => stats.nodes_virtualized += 1,
                },
                Effect::AddFixedNode { reason, node, .. } => {
                    if let Some(reason) = MaterializeReason::from_tag(reason) {
                        stats.record_materialization(reason);
                    } else if matches!(node.kind, NodeKind::Proxy) {
                        stats.proxies_created += 1;
                    }
                }
                Effect::AddPhi { .. } => stats.phis_created += 1,
                Effect::AddVirtualMapping { .. } => stats.frame_state_mappings += 1,
                _ => {}
            }
        }
        stats
    }
}
