//! Partial escape analysis phase
//!
//! Runs up to `max_sweeps` rounds of schedule, analyze, apply and cleanup.
//! All sweeps work on a copy of the graph which replaces the caller's graph
//! only once every sweep succeeded.

use super::config::PeaConfig;
use super::escape::PartialEscapeClosure;
use super::iteration::{BlockIterator, SweepEffects};
use super::stats::PeaStatistics;
use crate::error::PeaResult;
use crate::ir::optimization::{
    CanonicalizerPass, DeadCodeEliminationPass, OptimizationPass, OptimizationResult,
};
use crate::ir::schedule::{BlockScheduler, Scheduler};
use crate::ir::Graph;
use tracing::{debug, info, warn};

pub struct PartialEscapePhase {
    config: PeaConfig,
    scheduler: Box<dyn Scheduler>,
    dce: DeadCodeEliminationPass,
    canonicalizer: CanonicalizerPass,
}

impl PartialEscapePhase {
    pub fn new(config: PeaConfig) -> Self {
        Self::with_scheduler(config, Box::new(BlockScheduler::new()))
    }

    pub fn with_scheduler(config: PeaConfig, scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            config,
            scheduler,
            dce: DeadCodeEliminationPass::new(),
            canonicalizer: CanonicalizerPass::new(),
        }
    }

    pub fn config(&self) -> &PeaConfig {
        &self.config
    }

    /// Optimize `graph`. On error the graph is left exactly as it was.
    pub fn run(&mut self, graph: &mut Graph) -> PeaResult<PeaStatistics> {
        self.config.validate()?;
        let mut working = graph.clone();
        let stats = self.run_sweeps(&mut working)?;
        if stats.sweeps > 0 {
            *graph = working;
        }
        info!(
            "escape analysis of {}: {} sweeps, {} allocations virtualized, {} materialized",
            graph.name,
            stats.sweeps,
            stats.allocations_virtualized,
            stats.materializations()
        );
        Ok(stats)
    }

    /// Analyze `graph` without changing it
    pub fn analyze(&mut self, graph: &Graph) -> PeaResult<SweepEffects> {
        let cfg = self.scheduler.schedule(graph)?;
        let mut closure = PartialEscapeClosure::new(graph, &cfg, &self.config);
        let result = BlockIterator::new(&mut closure, &cfg, self.config.max_loop_iterations).run()?;
        debug!(
            "{} virtual objects, {} loop iterations",
            closure.virtual_object_count(),
            result.loop_iterations
        );
        Ok(SweepEffects::new(closure.into_preamble(), result, &cfg))
    }

    fn run_sweeps(&mut self, graph: &mut Graph) -> PeaResult<PeaStatistics> {
        let mut total = PeaStatistics::default();

        for sweep in 1..=self.config.max_sweeps {
            let effects = self.analyze(graph)?;
            if effects.is_empty() {
                debug!("sweep {} of {} found nothing to do", sweep, graph.name);
                break;
            }

            let mut stats = effects.statistics(graph);
            stats.sweeps = 1;
            let outcome = effects.apply(graph);
            stats.nodes_removed = outcome.obsolete.len() + self.dce.eliminate(graph);

            if self.config.canonicalize {
                stats.nodes_canonicalized = self.canonicalizer.run_incremental(graph, &outcome.touched);
                if stats.nodes_canonicalized > 0 {
                    stats.nodes_removed += self.dce.eliminate(graph);
                }
            }

            debug!(
                "sweep {} applied {} effects, removed {} nodes",
                sweep,
                effects.effect_count(),
                stats.nodes_removed
            );
            total += &stats;
        }

        Ok(total)
    }
}

impl Default for PartialEscapePhase {
    fn default() -> Self {
        Self::new(PeaConfig::default())
    }
}

impl OptimizationPass for PartialEscapePhase {
    fn name(&self) -> &'static str {
        "partial-escape-analysis"
    }

    fn run_on_graph(&mut self, graph: &mut Graph) -> OptimizationResult {
        match self.run(graph) {
            Ok(stats) => stats.to_optimization_result(stats.sweeps > 0),
            Err(e) => {
                warn!("escape analysis skipped for {}: {}", graph.name, e);
                OptimizationResult::unchanged()
            }
        }
    }
}
