//! Counters reported by the escape analysis phase

use crate::ir::optimization::OptimizationResult;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Why an object had to be materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeReason {
    /// Predecessor states disagreed at a merge
    Merge,
    /// A phi could not keep its virtual inputs
    Phi,
    /// A node that cannot handle virtual inputs used the object
    Unhandled,
}

impl MaterializeReason {
    /// Tag recorded on the effects that commit the allocation
    pub fn as_str(self) -> &'static str {
        match self {
            MaterializeReason::Merge => "materialize at merge",
            MaterializeReason::Phi => "materialize for phi",
            MaterializeReason::Unhandled => "materialize before use",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        [Self::Merge, Self::Phi, Self::Unhandled]
            .into_iter()
            .find(|reason| reason.as_str() == tag)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeaStatistics {
    pub sweeps: usize,
    pub allocations_virtualized: usize,
    pub materialized_at_merge: usize,
    pub materialized_at_phi: usize,
    pub materialized_unhandled: usize,
    pub nodes_virtualized: usize,
    pub loads_eliminated: usize,
    pub stores_eliminated: usize,
    pub phis_created: usize,
    pub proxies_created: usize,
    pub frame_state_mappings: usize,
    pub loop_iterations: usize,
    pub nodes_removed: usize,
    pub nodes_canonicalized: usize,
}

impl PeaStatistics {
    pub fn record_materialization(&mut self, reason: MaterializeReason) {
        match reason {
            MaterializeReason::Merge => self.materialized_at_merge += 1,
            MaterializeReason::Phi => self.materialized_at_phi += 1,
            MaterializeReason::Unhandled => self.materialized_unhandled += 1,
        }
    }

    pub fn materializations(&self) -> usize {
        self.materialized_at_merge + self.materialized_at_phi + self.materialized_unhandled
    }

    /// Counters in report order
    pub fn counters(&self) -> IndexMap<&'static str, usize> {
        IndexMap::from([
            ("sweeps", self.sweeps),
            ("allocations_virtualized", self.allocations_virtualized),
            ("materialized_at_merge", self.materialized_at_merge),
            ("materialized_at_phi", self.materialized_at_phi),
            ("materialized_unhandled", self.materialized_unhandled),
            ("nodes_virtualized", self.nodes_virtualized),
            ("loads_eliminated", self.loads_eliminated),
            ("stores_eliminated", self.stores_eliminated),
            ("phis_created", self.phis_created),
            ("proxies_created", self.proxies_created),
            ("frame_state_mappings", self.frame_state_mappings),
            ("loop_iterations", self.loop_iterations),
            ("nodes_removed", self.nodes_removed),
            ("nodes_canonicalized", self.nodes_canonicalized),
        ])
    }

    pub fn to_optimization_result(&self, modified: bool) -> OptimizationResult {
        let mut result = if modified {
            OptimizationResult::changed()
        } else {
            OptimizationResult::unchanged()
        };
        result.instructions_eliminated = self.nodes_removed;
        for (name, value) in self.counters() {
            if value > 0 && name != "nodes_removed" {
                result.stats.insert(name.to_string(), value);
            }
        }
        result
    }
}

impl AddAssign<&PeaStatistics> for PeaStatistics {
    fn add_assign(&mut self, other: &PeaStatistics) {
        self.sweeps += other.sweeps;
        self.allocations_virtualized += other.allocations_virtualized;
        self.materialized_at_merge += other.materialized_at_merge;
        self.materialized_at_phi += other.materialized_at_phi;
        self.materialized_unhandled += other.materialized_unhandled;
        self.nodes_virtualized += other.nodes_virtualized;
        self.loads_eliminated += other.loads_eliminated;
        self.stores_eliminated += other.stores_eliminated;
        self.phis_created += other.phis_created;
        self.proxies_created += other.proxies_created;
        self.frame_state_mappings += other.frame_state_mappings;
        self.loop_iterations += other.loop_iterations;
        self.nodes_removed += other.nodes_removed;
        self.nodes_canonicalized += other.nodes_canonicalized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_and_report() {
        let mut total = PeaStatistics::default();
        let mut sweep = PeaStatistics::default();
        sweep.record_materialization(MaterializeReason::Merge);
        sweep.record_materialization(MaterializeReason::Unhandled);
        sweep.loads_eliminated = 2;
        total += &sweep;
        total += &sweep;
        assert_eq!(total.materializations(), 4);

        let result = total.to_optimization_result(true);
        assert!(result.modified);
        assert_eq!(result.stats["loads_eliminated"], 4);
        assert!(!result.stats.contains_key("stores_eliminated"));
    }

    #[test]
    fn test_json_has_every_counter() {
        let stats = PeaStatistics {
            sweeps: 1,
            phis_created: 3,
            ..PeaStatistics::default()
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["phis_created"], 3);

        let keys: Vec<&str> = stats.counters().keys().copied().collect();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), keys.len());
        assert!(keys.iter().all(|k| object.contains_key(*k)));
    }
}
