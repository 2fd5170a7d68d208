//! Classifier construction and tuning parameters

use serde::{Deserialize, Serialize};

/// Parameters controlling forest construction and lookup heuristics.
///
/// The first five knobs shape the trees; the rest are empirically tuned
/// cutoffs that earlier revisions hard-coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Maximum split bits chosen per tree node.
    pub max_bits: usize,
    /// Maximum tree depth before a node is forced into a leaf.
    pub max_level: u32,
    /// Target leaf capacity; scaled per tree during construction.
    pub binth: usize,
    /// Upper bound on the number of trees (the overflow container sits
    /// outside this count).
    pub max_trees: usize,
    /// Minimum wildcard population before a node grows side-storage.
    pub wrs_threshold: usize,

    /// Overflow is probed before the trees when its best priority exceeds
    /// this.
    pub overflow_probe_priority: i32,
    /// A tree is skipped only when the running best exceeds its cached
    /// maximum by more than this slack.
    pub tree_prune_slack: i32,
    /// Deferred deletes are flushed once this many are queued.
    pub pending_delete_flush: usize,
    /// Priority window covered by one overflow layer.
    pub overflow_layer_width: i32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_bits: 4,
            max_level: 6,
            binth: 8,
            max_trees: 32,
            wrs_threshold: 20,
            overflow_probe_priority: 80_000,
            tree_prune_slack: 500,
            pending_delete_flush: 50,
            overflow_layer_width: 10_000,
        }
    }
}

impl ClassifierConfig {
    /// Side-storage threshold that works well for a given ruleset size and
    /// leaf capacity: small rulesets tolerate a much higher bar, and large
    /// leaves make side-storage comparatively cheaper.
    pub fn recommended_wrs_threshold(rule_count: usize, binth: usize) -> usize {
        let base = if rule_count <= 10_000 { 90 } else { 20 };
        if binth >= 32 {
            base * 2
        } else if binth >= 16 {
            base * 3 / 2
        } else {
            base
        }
    }

    /// Replace the WRS threshold with the recommended value for
    /// `rule_count`.
    pub fn with_recommended_wrs_threshold(mut self, rule_count: usize) -> Self {
        self.wrs_threshold = Self::recommended_wrs_threshold(rule_count, self.binth);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_threshold() {
        assert_eq!(ClassifierConfig::recommended_wrs_threshold(5_000, 8), 90);
        assert_eq!(ClassifierConfig::recommended_wrs_threshold(50_000, 8), 20);
        assert_eq!(ClassifierConfig::recommended_wrs_threshold(5_000, 16), 135);
        assert_eq!(ClassifierConfig::recommended_wrs_threshold(50_000, 32), 40);
    }
}
