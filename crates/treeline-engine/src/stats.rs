//! Aggregate structure reporting
//!
//! A serializable snapshot of how the forest came out: tree populations,
//! side-storage usage, leaf shape. Observational only.

use serde::Serialize;

use crate::forest::Classifier;

/// Snapshot of the classifier's structure.
#[derive(Debug, Clone, Serialize)]
pub struct StructureSummary {
    /// Decision trees in the forest.
    pub tree_count: usize,
    /// Rules stored per tree (leaves plus side-storage).
    pub tree_rule_counts: Vec<usize>,
    /// Total nodes across all trees.
    pub node_count: usize,
    /// Leaf nodes across all trees.
    pub leaf_count: usize,
    /// Interior nodes carrying wildcard side-storage.
    pub wrs_node_count: usize,
    /// Rules held in side-storage.
    pub wrs_rule_count: usize,
    /// Largest single side-storage population.
    pub max_wrs_rules_per_node: usize,
    /// Rules in the overflow container.
    pub overflow_rule_count: usize,
    /// Mean leaf depth.
    pub average_leaf_depth: f64,
    /// Mean interior-node balance (1.0 = perfectly even).
    pub average_node_balance: f64,
    /// Approximate heap footprint.
    pub mem_size_bytes: usize,
}

impl Classifier {
    /// Build a structure snapshot.
    pub fn structure_summary(&self) -> StructureSummary {
        let mut node_count = 0;
        let mut leaf_count = 0;
        let mut wrs_node_count = 0;
        let mut wrs_rule_count = 0;
        let mut max_wrs = 0;
        for tree in &self.trees {
            node_count += tree.node_count();
            for node in tree.iter_nodes() {
                if node.is_leaf {
                    leaf_count += 1;
                }
                let held = node.wrs_len();
                if node.wrs.is_some() {
                    wrs_node_count += 1;
                }
                wrs_rule_count += held;
                max_wrs = max_wrs.max(held);
            }
        }
        StructureSummary {
            tree_count: self.trees.len(),
            tree_rule_counts: self.trees.iter().map(|t| t.rule_count()).collect(),
            node_count,
            leaf_count,
            wrs_node_count,
            wrs_rule_count,
            max_wrs_rules_per_node: max_wrs,
            overflow_rule_count: self.overflow.len(),
            average_leaf_depth: self.average_leaf_depth(),
            average_node_balance: self.average_node_balance(),
            mem_size_bytes: self.mem_size_bytes(),
        }
    }
}
