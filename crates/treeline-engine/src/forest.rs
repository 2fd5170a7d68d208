//! Forest controller: construction, lookup, merging
//!
//! Owns the trees, the overflow container and the rule-location index.
//! Construction cascades kicked rules from tree to tree; lookup walks the
//! trees in descending max-priority order with cross-tree pruning and
//! probes the overflow container first only when its best priority is high
//! enough to matter.

use std::collections::{HashMap, HashSet};
use std::mem;

use serde::{Deserialize, Serialize};
use treeline_common::{Packet, Rule};

use crate::builder::{build_tree, partition_options};
use crate::config::ClassifierConfig;
use crate::node::{packet_location, Node, NodeId, Tree};
use crate::overflow::OverflowContainer;
use crate::update::UpdateBuffer;
use crate::wrs::WildcardStore;

/// Search path stack bound; deeper traversals are truncated.
const MAX_SEARCH_DEPTH: usize = 32;

/// Where a rule currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleLocation {
    /// Not stored (never inserted, or deleted).
    Absent,
    /// In the tree with this index.
    Tree(u16),
    /// In the overflow container.
    Overflow,
}

/// The packet classifier: a forest of decision trees plus a
/// priority-layered overflow container.
///
/// Single-threaded by design; one instance belongs to one caller, and
/// mutation requires exclusive access. Lookups take shared access but may
/// lazily re-sort dirty containers through interior mutability, so the
/// type is deliberately not `Sync`.
#[derive(Debug)]
pub struct Classifier {
    pub(crate) config: ClassifierConfig,
    pub(crate) options: Vec<Vec<i8>>,
    pub(crate) trees: Vec<Tree>,
    pub(crate) tree_max_priority: Vec<i32>,
    /// `(max_priority, tree_index)` pairs, descending.
    pub(crate) search_order: Vec<(i32, usize)>,
    pub(crate) overflow: OverflowContainer,
    pub(crate) overflow_max_priority: i32,
    /// Indexed by rule id; grows as inserts bring new ids.
    pub(crate) locations: Vec<RuleLocation>,
    pub(crate) update_buffer: UpdateBuffer,
    #[cfg(feature = "access-stats")]
    node_accesses: std::cell::Cell<u64>,
}

impl Classifier {
    /// Empty classifier with the given configuration.
    pub fn new(config: ClassifierConfig) -> Self {
        let options = partition_options(config.max_bits);
        let overflow = OverflowContainer::new(config.overflow_layer_width);
        Self {
            config,
            options,
            trees: Vec::new(),
            tree_max_priority: Vec::new(),
            search_order: Vec::new(),
            overflow,
            overflow_max_priority: -1,
            locations: Vec::new(),
            update_buffer: UpdateBuffer::default(),
            #[cfg(feature = "access-stats")]
            node_accesses: std::cell::Cell::new(0),
        }
    }

    /// Empty classifier with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ClassifierConfig::default())
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Build the forest from a ruleset. Any previous content is discarded.
    pub fn construct(&mut self, rules: Vec<Rule>) {
        self.trees.clear();
        self.tree_max_priority.clear();
        self.search_order.clear();
        self.overflow.clear();
        self.overflow_max_priority = -1;
        self.update_buffer = UpdateBuffer::default();

        let initial_count = rules.len();
        let max_id = rules.iter().map(|r| r.id).max().unwrap_or(0);
        self.locations = vec![RuleLocation::Absent; max_id as usize + 1];

        let mut current = rules;
        current.sort_by(|a, b| b.priority.cmp(&a.priority));

        while !current.is_empty() && self.trees.len() + 1 < self.config.max_trees {
            // Small residue midway through the cascade goes straight to
            // overflow instead of spawning micro-trees.
            if self.trees.len() >= self.config.max_trees / 2
                && current.len() <= self.config.binth * 3
            {
                break;
            }

            let tree_index = self.trees.len();
            let current_ids: Vec<u32> = current.iter().map(|r| r.id).collect();
            let mut kicked = Vec::new();
            let tree = build_tree(current, tree_index, &self.config, &self.options, &mut kicked);

            // A tree that refused everything (no discriminating bits left)
            // would repeat forever; the residue belongs to overflow.
            if tree.rule_count() == 0 {
                current = kicked;
                break;
            }

            let kicked_ids: HashSet<u32> = kicked.iter().map(|r| r.id).collect();
            for id in current_ids {
                if !kicked_ids.contains(&id) {
                    self.set_location(id, RuleLocation::Tree(tree_index as u16));
                }
            }

            tracing::debug!(
                tree = tree_index,
                placed = tree.rule_count(),
                kicked = kicked.len(),
                "built tree"
            );
            self.tree_max_priority.push(tree.max_priority());
            self.trees.push(tree);

            current = kicked;
            current.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        if !current.is_empty() {
            current.sort_by(|a, b| b.priority.cmp(&a.priority));
            for rule in current {
                self.set_location(rule.id, RuleLocation::Overflow);
                self.overflow.insert(rule);
            }
            self.overflow_max_priority = self.overflow.max_priority();
        }

        let stored = self.stored_rule_count();
        if stored != initial_count {
            tracing::warn!(
                expected = initial_count,
                actual = stored,
                "rule count mismatch after construction"
            );
        }
        debug_assert_eq!(stored, initial_count, "construction lost or duplicated rules");

        if self.trees.len() > 3 {
            self.merge_small_trees();
        }

        self.rebuild_search_order();

        if self.overflow.len() > 1_000 {
            self.overflow.optimize();
            self.overflow_max_priority = self.overflow.max_priority();
        }

        tracing::info!(
            rules = initial_count,
            trees = self.trees.len(),
            overflow = self.overflow.len(),
            "constructed classifier"
        );
    }

    /// Priority of the best rule matching `packet`, or `-1`.
    pub fn classify(&self, packet: &Packet) -> i32 {
        let mut best = -1;

        // Probe overflow first only when it can plausibly win outright;
        // otherwise it is the cheapest thing to prune and goes last.
        let mut searched_overflow = false;
        if !self.overflow.is_empty() && self.overflow_max_priority > self.config.overflow_probe_priority
        {
            best = self.overflow.search(packet, best);
            searched_overflow = true;
        }

        for &(max_priority, tree_index) in &self.search_order {
            if best >= max_priority && best - max_priority > self.config.tree_prune_slack {
                continue;
            }
            let result = self.search_tree(&self.trees[tree_index], packet, best);
            best = best.max(result);
        }

        if !searched_overflow && !self.overflow.is_empty() {
            best = best.max(self.overflow.search(packet, best));
        }

        best
    }

    /// Two-phase search of one tree: descend to a leaf recording which
    /// side-storage buckets might still win, scan the leaf, then revisit
    /// flagged buckets deepest-first.
    fn search_tree(&self, tree: &Tree, packet: &Packet, current_best: i32) -> i32 {
        let mut path: [(NodeId, bool, i32); MAX_SEARCH_DEPTH] =
            [(0, false, -1); MAX_SEARCH_DEPTH];
        let mut path_len = 0usize;

        let mut current = tree.root();
        loop {
            let node = tree.node(current);
            if node.is_leaf || path_len >= MAX_SEARCH_DEPTH - 1 {
                break;
            }
            let check_wrs = node.wrs_len() > 0 && node.max_wrs_priority > current_best;
            path[path_len] = (current, check_wrs, node.max_wrs_priority);
            path_len += 1;

            self.count_access();
            let loc = packet_location(packet, &node.splits);
            match node.children[loc] {
                Some(child) => current = child,
                None => break,
            }
        }

        let mut best = -1;
        let node = tree.node(current);
        if node.is_leaf {
            best = Self::search_leaf(node, packet, current_best);
        }

        for i in (0..path_len).rev() {
            let (id, check_wrs, wrs_priority) = path[i];
            if check_wrs && wrs_priority > best {
                self.count_access();
                if let Some(wrs) = tree.node(id).wrs.as_ref() {
                    best = best.max(wrs.highest_match(packet));
                }
            }
        }

        best
    }

    /// Scan a priority-sorted leaf: first match wins, and anything at or
    /// below `current_best` ends the scan.
    fn search_leaf(node: &Node, packet: &Packet, current_best: i32) -> i32 {
        if node.rules.is_empty() {
            return -1;
        }
        if node.max_leaf_priority >= 0 && node.max_leaf_priority <= current_best {
            return -1;
        }
        for rule in &node.rules {
            if rule.priority <= current_best {
                return -1;
            }
            if rule.matches(packet) {
                return rule.priority;
            }
        }
        -1
    }

    /// Dissolve the smallest trees into the overflow container, keeping
    /// the top three quarters (at least three). Cuts per-lookup tree count
    /// when construction fragmented the ruleset.
    fn merge_small_trees(&mut self) {
        let tree_count = self.trees.len();
        if tree_count <= 3 {
            return;
        }
        let keep = (tree_count * 3 / 4).max(3);

        let mut sizes: Vec<(usize, usize)> = self
            .trees
            .iter()
            .enumerate()
            .map(|(i, t)| (t.rule_count(), i))
            .collect();
        sizes.sort_by(|a, b| b.cmp(a));

        let mut old_trees: Vec<Option<Tree>> =
            mem::take(&mut self.trees).into_iter().map(Some).collect();
        let old_max = mem::take(&mut self.tree_max_priority);

        let mut remap: HashMap<u16, u16> = HashMap::new();
        let mut kept_trees = Vec::with_capacity(keep);
        let mut kept_max = Vec::with_capacity(keep);
        for &(_, old_index) in sizes.iter().take(keep) {
            remap.insert(old_index as u16, kept_trees.len() as u16);
            kept_trees.push(old_trees[old_index].take().expect("tree taken once"));
            kept_max.push(old_max[old_index]);
        }

        let mut merged_rules = 0usize;
        for &(_, old_index) in sizes.iter().skip(keep) {
            let tree = old_trees[old_index].take().expect("tree taken once");
            for rule in tree.extract_rules() {
                self.set_location(rule.id, RuleLocation::Overflow);
                self.overflow.insert(rule);
                merged_rules += 1;
            }
        }

        // Surviving rules keep pointing at the right tree under the new
        // numbering.
        for loc in &mut self.locations {
            if let RuleLocation::Tree(old) = *loc {
                if let Some(&new) = remap.get(&old) {
                    *loc = RuleLocation::Tree(new);
                }
            }
        }

        self.trees = kept_trees;
        self.tree_max_priority = kept_max;
        self.overflow_max_priority = self.overflow.max_priority();

        tracing::info!(
            kept = self.trees.len(),
            dissolved = tree_count - self.trees.len(),
            merged_rules,
            "merged small trees into overflow"
        );

        if self.overflow.len() > 500 {
            self.overflow.optimize();
            self.overflow_max_priority = self.overflow.max_priority();
        }
    }

    pub(crate) fn rebuild_search_order(&mut self) {
        self.search_order = self
            .tree_max_priority
            .iter()
            .copied()
            .enumerate()
            .map(|(i, p)| (p, i))
            .collect();
        self.search_order.sort_by(|a, b| b.cmp(a));
    }

    pub(crate) fn set_location(&mut self, id: u32, location: RuleLocation) {
        let idx = id as usize;
        if idx >= self.locations.len() {
            self.locations.resize(idx + 1, RuleLocation::Absent);
        }
        self.locations[idx] = location;
    }

    /// Where the rule with `id` currently lives.
    pub fn location_of(&self, id: u32) -> RuleLocation {
        self.locations
            .get(id as usize)
            .copied()
            .unwrap_or(RuleLocation::Absent)
    }

    /// Number of decision trees (the overflow container not included).
    pub fn normal_tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Trees plus the overflow container, when populated.
    pub fn num_tables(&self) -> usize {
        self.trees.len() + usize::from(!self.overflow.is_empty())
    }

    /// Rules currently held in the overflow container.
    pub fn overflow_rule_count(&self) -> usize {
        self.overflow.len()
    }

    /// Rules stored across the whole structure.
    pub fn stored_rule_count(&self) -> usize {
        self.trees.iter().map(Tree::rule_count).sum::<usize>() + self.overflow.len()
    }

    /// Approximate heap footprint of the whole structure.
    pub fn mem_size_bytes(&self) -> usize {
        let mut total = 0usize;
        for tree in &self.trees {
            total += tree.node_count() * mem::size_of::<Node>();
            for node in tree.iter_nodes() {
                total += node.rules.len() * mem::size_of::<Rule>();
                total += node.children.len() * mem::size_of::<Option<NodeId>>();
                if let Some(wrs) = &node.wrs {
                    total += mem::size_of::<WildcardStore>();
                    total += wrs.len() * mem::size_of::<Rule>();
                }
            }
        }
        total += self.locations.len() * mem::size_of::<RuleLocation>();
        total += self.overflow.mem_size_bytes();
        total
    }

    /// Mean depth over all leaves, 0.0 for an empty forest.
    pub fn average_leaf_depth(&self) -> f64 {
        let mut sum = 0u64;
        let mut leaves = 0u64;
        for tree in &self.trees {
            for node in tree.iter_nodes() {
                if node.is_leaf {
                    sum += node.depth as u64;
                    leaves += 1;
                }
            }
        }
        if leaves == 0 {
            0.0
        } else {
            sum as f64 / leaves as f64
        }
    }

    /// Mean balance over interior nodes with at least two children:
    /// `1 - (max - min) / total` of the child subtree populations, so 1.0
    /// is a perfectly even split.
    pub fn average_node_balance(&self) -> f64 {
        let mut sum = 0.0f64;
        let mut counted = 0u64;
        for tree in &self.trees {
            let mut stack = vec![tree.root()];
            while let Some(id) = stack.pop() {
                let node = tree.node(id);
                if node.is_leaf {
                    continue;
                }
                let sizes: Vec<usize> = node
                    .children
                    .iter()
                    .flatten()
                    .map(|&c| tree.rule_count_from(c))
                    .collect();
                if sizes.len() >= 2 {
                    let min = *sizes.iter().min().expect("len >= 2");
                    let max = *sizes.iter().max().expect("len >= 2");
                    let total: usize = sizes.iter().sum();
                    sum += 1.0 - (max - min) as f64 / total.max(1) as f64;
                    counted += 1;
                }
                stack.extend(node.children.iter().flatten());
            }
        }
        if counted == 0 {
            0.0
        } else {
            sum / counted as f64
        }
    }

    /// Lazy re-sorts the overflow container has performed during searches.
    pub fn overflow_lazy_sort_count(&self) -> u64 {
        self.overflow.lazy_sort_count()
    }

    #[cfg(feature = "access-stats")]
    #[inline(always)]
    fn count_access(&self) {
        self.node_accesses.set(self.node_accesses.get() + 1);
    }

    #[cfg(not(feature = "access-stats"))]
    #[inline(always)]
    fn count_access(&self) {}

    /// Node accesses performed by lookups since the last reset.
    #[cfg(feature = "access-stats")]
    pub fn node_access_count(&self) -> u64 {
        self.node_accesses.get()
    }

    /// Reset the node access counter.
    #[cfg(feature = "access-stats")]
    pub fn reset_node_access_count(&self) {
        self.node_accesses.set(0);
    }
}
