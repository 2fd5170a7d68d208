//! Incremental rule updates
//!
//! Specific rules take a fast-insert path into an existing tree; rules too
//! wildcard-heavy to ever sit in a tree go straight to the overflow
//! container. Deletes resolve through the rule-location index; a delete
//! for an id the classifier does not know is queued and discarded when the
//! pending set flushes, so it still reads as a no-op success.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use treeline_common::{Rule, DST_PORT, FIELD_COUNT, SRC_PORT};

use crate::forest::{Classifier, RuleLocation};
use crate::node::{rule_location, Node};

/// One requested rule operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOp {
    /// Add the rule.
    Insert,
    /// Remove the rule.
    Delete,
}

/// Outcome counts for a batch of updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStats {
    /// Inserts requested.
    pub insert_attempts: u32,
    /// Inserts that landed (tree or overflow).
    pub insert_successes: u32,
    /// Deletes requested.
    pub delete_attempts: u32,
    /// Deletes that resolved, unknown ids counted as no-ops.
    pub delete_successes: u32,
}

/// How churn-prone state is carried between updates.
#[derive(Debug, Default)]
pub(crate) struct UpdateBuffer {
    /// Most recent inserts, checked first on delete.
    pub recent_inserts: Vec<Rule>,
    /// Delete requests for ids the classifier does not know.
    pub pending_deletes: HashSet<u32>,
    /// Tree that accepted the last insert; tried first next time.
    pub last_successful_tree: usize,
}

impl UpdateBuffer {
    /// Keep the cache bounded after a batch: newest 100 survive once the
    /// list passes 1,000.
    fn trim(&mut self) {
        if self.recent_inserts.len() > 1_000 {
            let keep_from = self.recent_inserts.len() - 100;
            self.recent_inserts.drain(..keep_from);
        }
        self.pending_deletes.clear();
    }
}

/// Whether a rule is concrete enough to live in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Specific,
    Wildcard,
}

impl Classifier {
    /// Insert one rule. Always succeeds: rules no tree accepts fall back
    /// to the overflow container.
    pub fn insert(&mut self, rule: Rule) -> bool {
        match Self::rule_kind(&rule) {
            RuleKind::Wildcard => self.insert_overflow(rule),
            RuleKind::Specific => self.insert_to_shallow_tree(rule),
        }
    }

    /// Delete one rule. Unknown ids are queued as pending and reported as
    /// no-op successes; the queue flushes at the configured size.
    pub fn delete(&mut self, rule: &Rule) -> bool {
        if let Some(pos) = self
            .update_buffer
            .recent_inserts
            .iter()
            .position(|r| r.id == rule.id)
        {
            self.update_buffer.recent_inserts.remove(pos);
            if self.location_of(rule.id) != RuleLocation::Absent {
                return self.delete_from_known_location(rule);
            }
        }

        match self.location_of(rule.id) {
            RuleLocation::Overflow | RuleLocation::Tree(_) => self.delete_from_known_location(rule),
            RuleLocation::Absent => {
                self.update_buffer.pending_deletes.insert(rule.id);
                if self.update_buffer.pending_deletes.len() >= self.config.pending_delete_flush {
                    self.flush_pending_deletes();
                }
                true
            }
        }
    }

    /// Apply a batch of updates; `ops[i]` applies to `rules[i]`. Large
    /// batches switch to a grouped path that runs deletes first.
    pub fn apply_updates(&mut self, rules: &[Rule], ops: &[UpdateOp]) -> UpdateStats {
        if rules.len() > 1_000 {
            return self.apply_batch(rules, ops);
        }

        let mut stats = UpdateStats::default();
        for (i, (rule, op)) in rules.iter().zip(ops.iter()).enumerate() {
            match op {
                UpdateOp::Insert => {
                    stats.insert_attempts += 1;
                    if self.insert(*rule) {
                        stats.insert_successes += 1;
                    }
                }
                UpdateOp::Delete => {
                    stats.delete_attempts += 1;
                    if self.delete(rule) {
                        stats.delete_successes += 1;
                    }
                }
            }
            if i % 100 == 0 {
                self.flush_pending_deletes();
            }
            if i % 500 == 0 && self.overflow.len() > 1_000 {
                self.overflow.optimize();
                self.overflow_max_priority = self.overflow.max_priority();
            }
        }
        self.flush_pending_deletes();
        stats
    }

    /// Deferred deletes currently queued.
    pub fn pending_delete_count(&self) -> usize {
        self.update_buffer.pending_deletes.len()
    }

    fn apply_batch(&mut self, rules: &[Rule], ops: &[UpdateOp]) -> UpdateStats {
        let mut stats = UpdateStats::default();
        let mut specific_inserts = Vec::new();
        let mut wildcard_inserts = Vec::new();
        let mut deletes = Vec::new();

        for (rule, op) in rules.iter().zip(ops.iter()) {
            match op {
                UpdateOp::Insert => {
                    stats.insert_attempts += 1;
                    match Self::rule_kind(rule) {
                        RuleKind::Specific => specific_inserts.push(*rule),
                        RuleKind::Wildcard => wildcard_inserts.push(*rule),
                    }
                }
                UpdateOp::Delete => {
                    stats.delete_attempts += 1;
                    deletes.push(*rule);
                }
            }
        }

        stats.delete_successes = self.batch_delete(&deletes);

        for rule in specific_inserts {
            if self.insert_to_shallow_tree(rule) {
                stats.insert_successes += 1;
            }
        }
        for rule in wildcard_inserts {
            self.insert_overflow(rule);
            stats.insert_successes += 1;
        }

        if self.overflow.len() > 1_000 {
            self.overflow.optimize();
            self.overflow_max_priority = self.overflow.max_priority();
        }

        self.update_buffer.trim();
        stats
    }

    /// Grouped delete: per-tree batches amortize the max-priority recompute
    /// and the search-order rebuild.
    fn batch_delete(&mut self, deletes: &[Rule]) -> u32 {
        let mut by_tree: HashMap<usize, Vec<Rule>> = HashMap::new();
        let mut overflow_deletes = Vec::new();
        let mut successes = 0u32;

        for rule in deletes {
            match self.location_of(rule.id) {
                RuleLocation::Tree(t) => by_tree.entry(t as usize).or_default().push(*rule),
                RuleLocation::Overflow => overflow_deletes.push(*rule),
                // Unknown id: no-op success, keeps batch statistics monotonic.
                RuleLocation::Absent => successes += 1,
            }
        }

        let mut any_removed = false;
        for rule in overflow_deletes {
            if self.overflow.remove(rule.id) {
                self.set_location(rule.id, RuleLocation::Absent);
                successes += 1;
                any_removed = true;
            }
        }
        if any_removed {
            self.overflow_max_priority = self.overflow.max_priority();
        }

        let mut any_tree_removed = false;
        for (tree_index, batch) in by_tree {
            let mut removed_here = false;
            for rule in batch {
                if self.try_stable_delete(tree_index, &rule) {
                    self.set_location(rule.id, RuleLocation::Absent);
                    successes += 1;
                    removed_here = true;
                }
            }
            if removed_here {
                self.tree_max_priority[tree_index] = self.trees[tree_index].max_priority();
                any_tree_removed = true;
            }
        }
        if any_tree_removed {
            self.rebuild_search_order();
        }

        successes
    }

    /// Drop queued deletes for unknown ids. They targeted rules the
    /// classifier never held, so there is nothing to unlink.
    pub(crate) fn flush_pending_deletes(&mut self) {
        if self.update_buffer.pending_deletes.is_empty() {
            return;
        }
        tracing::debug!(
            discarded = self.update_buffer.pending_deletes.len(),
            "flushed pending deletes"
        );
        self.update_buffer.pending_deletes.clear();
    }

    /// Fields with no prefix plus ports spanning more than a thousand
    /// values; two or more make a rule wildcard-heavy.
    fn rule_kind(rule: &Rule) -> RuleKind {
        let mut wildcards = 0;
        for i in 0..FIELD_COUNT {
            if rule.prefix_len[i] == 0 {
                wildcards += 1;
            }
            if (i == SRC_PORT || i == DST_PORT) && rule.ranges[i].span() > 1_000 {
                wildcards += 1;
            }
        }
        if wildcards >= 2 {
            RuleKind::Wildcard
        } else {
            RuleKind::Specific
        }
    }

    fn insert_overflow(&mut self, rule: Rule) -> bool {
        self.set_location(rule.id, RuleLocation::Overflow);
        self.overflow.insert(rule);
        self.overflow_max_priority = self.overflow.max_priority();
        true
    }

    fn insert_to_shallow_tree(&mut self, rule: Rule) -> bool {
        let last = self.update_buffer.last_successful_tree;
        if last < self.trees.len() && self.try_fast_insert(last, rule) {
            self.note_tree_insert(last, rule);
            return true;
        }

        // Fall back to the shallowest other tree.
        let mut best: Option<(u32, usize)> = None;
        for (i, tree) in self.trees.iter().enumerate() {
            if i == last {
                continue;
            }
            let depth = tree.depth();
            if best.map_or(true, |(d, _)| depth < d) {
                best = Some((depth, i));
            }
        }
        if let Some((_, index)) = best {
            if self.try_fast_insert(index, rule) {
                self.update_buffer.last_successful_tree = index;
                self.note_tree_insert(index, rule);
                return true;
            }
        }

        self.insert_overflow(rule)
    }

    fn note_tree_insert(&mut self, tree_index: usize, rule: Rule) {
        self.set_location(rule.id, RuleLocation::Tree(tree_index as u16));
        self.update_buffer.recent_inserts.push(rule);
        self.tree_max_priority[tree_index] = self.trees[tree_index].max_priority();
        self.rebuild_search_order();
    }

    /// Walk at most three steps down a tree looking for a leaf with slack
    /// or a missing child to materialize. Any wildcard on a path's split
    /// bits fails the attempt.
    fn try_fast_insert(&mut self, tree_index: usize, rule: Rule) -> bool {
        let leaf_limit = self.config.binth * 3;
        let tree = &mut self.trees[tree_index];
        let mut current = tree.root();

        for _ in 0..3 {
            let node = tree.node(current);
            if node.is_leaf {
                if node.rules.len() < leaf_limit {
                    let node = tree.node_mut(current);
                    node.rules.push(rule);
                    node.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
                    node.update_max_leaf_priority();
                    return true;
                }
                return false;
            }

            let Some(loc) = rule_location(&rule, &node.splits) else {
                return false;
            };
            match node.children[loc] {
                Some(child) => current = child,
                None => {
                    let leaf = Node::new(vec![rule], node.depth + 1, true);
                    let leaf_id = tree.push(leaf);
                    tree.node_mut(current).children[loc] = Some(leaf_id);
                    return true;
                }
            }
        }

        false
    }

    /// Descend by the rule's own bits, trying side-storage removal at every
    /// interior node on the way, then erase from the leaf.
    fn try_stable_delete(&mut self, tree_index: usize, rule: &Rule) -> bool {
        let tree = &mut self.trees[tree_index];
        let mut current = tree.root();

        loop {
            if tree.node(current).is_leaf {
                break;
            }
            if tree.node(current).wrs.is_some() {
                let node = tree.node_mut(current);
                if let Some(wrs) = node.wrs.as_mut() {
                    if wrs.remove(rule.id) {
                        node.update_max_wrs_priority();
                        return true;
                    }
                }
            }
            let node = tree.node(current);
            let Some(loc) = rule_location(rule, &node.splits) else {
                return false;
            };
            match node.children[loc] {
                Some(child) => current = child,
                None => return false,
            }
        }

        let node = tree.node_mut(current);
        if let Some(pos) = node
            .rules
            .iter()
            .position(|r| r.priority == rule.priority && r.id == rule.id)
        {
            node.rules.remove(pos);
            node.update_max_leaf_priority();
            return true;
        }
        false
    }

    fn delete_from_known_location(&mut self, rule: &Rule) -> bool {
        match self.location_of(rule.id) {
            RuleLocation::Overflow => {
                if self.overflow.remove(rule.id) {
                    self.set_location(rule.id, RuleLocation::Absent);
                    self.overflow_max_priority = self.overflow.max_priority();
                    true
                } else {
                    false
                }
            }
            RuleLocation::Tree(t) => {
                let tree_index = t as usize;
                if tree_index >= self.trees.len() {
                    return false;
                }
                if self.try_stable_delete(tree_index, rule) {
                    self.set_location(rule.id, RuleLocation::Absent);
                    self.tree_max_priority[tree_index] = self.trees[tree_index].max_priority();
                    self.rebuild_search_order();
                    true
                } else {
                    false
                }
            }
            RuleLocation::Absent => false,
        }
    }
}
