//! Single-tree construction
//!
//! Builds one decision tree over a priority-sorted ruleset. Each node
//! scores every precomputed partition option (a non-decreasing tuple of
//! field indices), picks the one minimizing the worst child bucket plus
//! kicked rules, separates rules that are wildcard on the chosen bits into
//! side-storage, and recurses breadth-first. Rules the tree cannot place
//! cleanly accumulate in the caller's kicked list and cascade to the next
//! tree.

use std::collections::VecDeque;

use treeline_common::{Rule, FIELD_BITS, FIELD_COUNT};

use crate::config::ClassifierConfig;
use crate::node::{has_wildcard_in_splits, rule_location, Node, NodeId, Split, Tree};
use crate::wrs::WildcardStore;

/// All non-decreasing tuples of length `max_bits` over `{-1, 0..4}`;
/// `-1` marks an unused slot. The ordering constraint deduplicates
/// symmetric choices.
pub(crate) fn partition_options(max_bits: usize) -> Vec<Vec<i8>> {
    let mut options: Vec<Vec<i8>> = (-1..FIELD_COUNT as i8).map(|f| vec![f]).collect();
    while options[0].len() < max_bits {
        let mut grown = Vec::new();
        for opt in &options {
            let last = *opt.last().expect("options are never empty");
            for f in last..FIELD_COUNT as i8 {
                let mut next = opt.clone();
                next.push(f);
                grown.push(next);
            }
        }
        options = grown;
    }
    options
}

/// Leaf capacity for one tree, scaled by position in the cascade. Early
/// trees get aggressive capacity to absorb the bulk; later trees grow
/// gently so the tail spreads out.
pub(crate) fn leaf_capacity(binth: usize, remaining_rules: usize, tree_index: usize) -> usize {
    let mut capacity = if tree_index == 0 {
        if remaining_rules > 90_000 {
            binth * 3
        } else {
            binth * 2
        }
    } else {
        let multiplier = (1.3 + tree_index as f64 * 0.2).min(2.5);
        (binth as f64 * multiplier) as usize
    };
    if remaining_rules < capacity * 2 {
        capacity = remaining_rules.max(capacity);
    }
    capacity
}

/// Pick the concrete bit for each used slot of `opt`, scanning each field
/// from its `next_bit` pointer for the first position where both 0 and 1
/// occur among the non-wildcard rules. Returns the usable splits and the
/// advanced per-field pointers for children.
fn select_bits(
    rules: &[Rule],
    opt: &[i8],
    start: &[Option<u32>; FIELD_COUNT],
) -> (Vec<Split>, [Option<u32>; FIELD_COUNT]) {
    let mut next_bit = *start;
    let mut splits = Vec::with_capacity(opt.len());
    for &slot in opt {
        if slot < 0 {
            continue;
        }
        let field = slot as usize;
        let Some(mut idx) = next_bit[field] else {
            continue;
        };
        loop {
            if idx >= FIELD_BITS[field] {
                next_bit[field] = None;
                break;
            }
            let mut ones = false;
            let mut zeros = false;
            let mut all_wildcard = true;
            for rule in rules {
                match rule.bit(field, idx) {
                    None => {}
                    Some(1) => {
                        all_wildcard = false;
                        ones = true;
                    }
                    Some(_) => {
                        all_wildcard = false;
                        zeros = true;
                    }
                }
                if ones && zeros {
                    break;
                }
            }
            if ones && zeros {
                splits.push(Split { field, bit: idx });
                next_bit[field] = Some(idx + 1);
                break;
            }
            if all_wildcard {
                next_bit[field] = None;
                break;
            }
            idx += 1;
        }
    }
    (splits, next_bit)
}

/// Worst-case child population for a hypothetical split: every bucket is
/// charged the kicked count on top of its own size.
fn score_splits(rules: &[Rule], splits: &[Split]) -> (usize, usize) {
    let mut counts = vec![0usize; 1 << splits.len()];
    let mut kicked = 0usize;
    for rule in rules {
        match rule_location(rule, splits) {
            Some(loc) => counts[loc] += 1,
            None => kicked += 1,
        }
    }
    let max_bucket = counts.into_iter().max().unwrap_or(0);
    (max_bucket + kicked, kicked)
}

/// Build one tree over `rules`. Rules the tree refuses are appended to
/// `kicked`.
pub(crate) fn build_tree(
    rules: Vec<Rule>,
    tree_index: usize,
    config: &ClassifierConfig,
    options: &[Vec<i8>],
    kicked: &mut Vec<Rule>,
) -> Tree {
    let balanced_binth = leaf_capacity(config.binth, rules.len(), tree_index);
    let wrs_floor = (config.wrs_threshold / 2).max(2);

    let mut tree = Tree::with_root(Node::new(rules, 1, false));
    let mut queue = VecDeque::from([tree.root()]);

    while let Some(id) = queue.pop_front() {
        let depth = tree.node(id).depth;
        let nrules = tree.node(id).rules.len();

        if depth >= config.max_level || nrules <= balanced_binth {
            let slack = (config.max_level.saturating_sub(depth) as usize) * 3;
            finish_leaf(&mut tree, id, balanced_binth + slack, kicked);
            continue;
        }

        // Score every partition option against this node's rules.
        let node = tree.node(id);
        let mut min_score = nrules;
        let mut min_kicked = nrules;
        let (mut best_splits, mut best_next) = select_bits(&node.rules, &options[0], &node.next_bit);
        for opt in options {
            let (splits, next) = select_bits(&node.rules, opt, &node.next_bit);
            let (score, kicked_count) = score_splits(&node.rules, &splits);
            if score < min_score || (score == min_score && kicked_count <= min_kicked) {
                min_score = score;
                min_kicked = kicked_count;
                best_splits = splits;
                best_next = next;
            }
        }

        // No usable split. At the root the tree would be nothing but a
        // linear scan, so it declines the whole set; deeper down the node
        // terminates with a tighter capacity.
        if best_splits.is_empty() {
            if depth <= 1 {
                finish_leaf(&mut tree, id, 0, kicked);
            } else {
                finish_leaf(&mut tree, id, balanced_binth + depth as usize * 2, kicked);
            }
            continue;
        }

        let rules = std::mem::take(&mut tree.node_mut(id).rules);
        let (wildcards, normal): (Vec<Rule>, Vec<Rule>) = rules
            .into_iter()
            .partition(|r| has_wildcard_in_splits(r, &best_splits));

        place_wildcards(
            &mut tree,
            id,
            wildcards,
            kicked,
            wrs_floor,
            balanced_binth,
            config,
        );

        let mut child_rules: Vec<Vec<Rule>> = vec![Vec::new(); 1 << best_splits.len()];
        for rule in normal {
            match rule_location(&rule, &best_splits) {
                Some(loc) => child_rules[loc].push(rule),
                None => kicked.push(rule),
            }
        }

        {
            let node = tree.node_mut(id);
            node.splits = best_splits;
            node.children = vec![None; child_rules.len()];
        }
        for (loc, bucket) in child_rules.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let mut child = Node::new(bucket, depth + 1, false);
            child.next_bit = best_next;
            let child_id = tree.push(child);
            tree.node_mut(id).children[loc] = Some(child_id);
            queue.push_back(child_id);
        }
    }

    tree
}

/// Turn `id` into a leaf, spilling everything beyond `max_allowed` (lowest
/// priorities first) into the kicked list.
fn finish_leaf(tree: &mut Tree, id: NodeId, max_allowed: usize, kicked: &mut Vec<Rule>) {
    let node = tree.node_mut(id);
    node.is_leaf = true;
    node.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    while node.rules.len() > max_allowed {
        kicked.push(node.rules.pop().expect("len checked above"));
    }
    node.update_max_leaf_priority();
}

/// Route the rules that are wildcard on the chosen bits: into side-storage
/// when the node qualifies, otherwise into the kicked list.
fn place_wildcards(
    tree: &mut Tree,
    id: NodeId,
    wildcards: Vec<Rule>,
    kicked: &mut Vec<Rule>,
    wrs_floor: usize,
    balanced_binth: usize,
    config: &ClassifierConfig,
) {
    if wildcards.is_empty() {
        return;
    }

    // Very-high-priority wildcards lower the bar: losing them to a later
    // tree hurts lookup pruning the most.
    let high_priority = wildcards
        .iter()
        .filter(|r| r.priority > config.overflow_probe_priority)
        .count();
    let mut threshold = wrs_floor;
    if high_priority * 10 > wildcards.len() * 3 {
        threshold = (threshold / 2).max(1);
    }

    if wildcards.len() >= threshold {
        let capacity = wildcards
            .len()
            .min((balanced_binth as f64 * 1.3) as usize)
            .min(15);
        if capacity >= threshold {
            let node = tree.node_mut(id);
            if node.wrs.is_none() && (2..=6).contains(&node.depth) {
                node.wrs = Some(WildcardStore::new(capacity));
            }
            if node.wrs.is_some() {
                let mut sorted = wildcards;
                sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
                let wrs = node.wrs.as_mut().expect("just checked");
                for rule in sorted {
                    if wrs.len() < wrs.capacity() {
                        wrs.add(rule);
                    } else {
                        kicked.push(rule);
                    }
                }
                node.update_max_wrs_priority();
                return;
            }
        }
    }

    kicked.extend(wildcards);
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeline_common::{FieldRange, SRC_IP};

    fn src_prefix_rule(id: u32, priority: i32, value: u32, plen: u32) -> Rule {
        let mut ranges = [
            FieldRange::full(32),
            FieldRange::full(32),
            FieldRange::full(16),
            FieldRange::full(16),
            FieldRange::full(8),
        ];
        let mut prefix_len = [0; FIELD_COUNT];
        let low = if plen == 0 {
            0
        } else {
            value & (u32::MAX << (32 - plen))
        };
        let high = if plen == 0 {
            u32::MAX
        } else {
            low + ((1u64 << (32 - plen)) - 1) as u32
        };
        ranges[SRC_IP] = FieldRange { low, high };
        prefix_len[SRC_IP] = plen;
        Rule {
            id,
            priority,
            ranges,
            prefix_len,
        }
    }

    #[test]
    fn test_partition_option_shape() {
        let opts = partition_options(2);
        // Non-decreasing pairs over {-1..4}: C(6+1, 2) = 21.
        assert_eq!(opts.len(), 21);
        assert!(opts.contains(&vec![-1, -1]));
        assert!(opts.contains(&vec![0, 4]));
        assert!(opts.iter().all(|o| o.len() == 2 && o[0] <= o[1]));
    }

    #[test]
    fn test_leaf_capacity_scaling() {
        // Tree 0 doubles, triples past 90k rules.
        assert_eq!(leaf_capacity(8, 50_000, 0), 16);
        assert_eq!(leaf_capacity(8, 100_000, 0), 24);
        // Later trees grow gently and cap at 2.5x.
        assert_eq!(leaf_capacity(8, 50_000, 1), 12);
        assert_eq!(leaf_capacity(8, 50_000, 10), 20);
        // Tiny remainders get at least their own size.
        assert_eq!(leaf_capacity(8, 20, 0), 20);
    }

    #[test]
    fn test_small_ruleset_is_single_leaf() {
        let rules: Vec<Rule> = (0..4)
            .map(|i| src_prefix_rule(i, i as i32, i << 24, 8))
            .collect();
        let mut kicked = Vec::new();
        let config = ClassifierConfig::default();
        let options = partition_options(config.max_bits);
        let tree = build_tree(rules, 0, &config, &options, &mut kicked);
        assert!(kicked.is_empty());
        assert_eq!(tree.node_count(), 1);
        assert!(tree.node(tree.root()).is_leaf);
        assert_eq!(tree.rule_count(), 4);
        assert_eq!(tree.max_priority(), 3);
    }

    #[test]
    fn test_split_places_every_rule_once() {
        // 64 distinct /8 prefixes force a split at the root.
        let rules: Vec<Rule> = (0..64)
            .map(|i| src_prefix_rule(i, i as i32, i << 24, 8))
            .collect();
        let mut kicked = Vec::new();
        let config = ClassifierConfig::default();
        let options = partition_options(config.max_bits);
        let tree = build_tree(rules.clone(), 0, &config, &options, &mut kicked);

        assert!(tree.node_count() > 1);
        assert_eq!(tree.rule_count() + kicked.len(), rules.len());

        // Every placed rule sits under the child its bits select.
        let root = tree.node(tree.root());
        assert!(!root.is_leaf);
        for rule in &rules {
            if kicked.iter().any(|k| k.id == rule.id) {
                continue;
            }
            let loc = rule_location(rule, &root.splits).expect("concrete on split bits");
            assert!(root.children[loc].is_some());
        }
    }

    #[test]
    fn test_leaves_stay_priority_sorted() {
        let rules: Vec<Rule> = (0..128)
            .map(|i| src_prefix_rule(i, (i * 31 % 128) as i32, (i % 32) << 24, 8))
            .collect();
        let mut kicked = Vec::new();
        let config = ClassifierConfig::default();
        let options = partition_options(config.max_bits);
        let tree = build_tree(rules, 0, &config, &options, &mut kicked);

        for node in tree.iter_nodes() {
            if !node.is_leaf {
                continue;
            }
            assert!(node
                .rules
                .windows(2)
                .all(|w| w[0].priority >= w[1].priority));
            assert_eq!(
                node.max_leaf_priority,
                node.rules.first().map_or(-1, |r| r.priority)
            );
        }
    }

    #[test]
    fn test_wildcards_without_wrs_are_kicked() {
        // Root is depth 1, outside the WRS depth band, so a wildcard-heavy
        // split at the root kicks.
        let mut rules: Vec<Rule> = (0..32)
            .map(|i| src_prefix_rule(i, i as i32, i << 24, 8))
            .collect();
        rules.push(src_prefix_rule(99, 999, 0, 0)); // fully wildcard
        let mut kicked = Vec::new();
        let config = ClassifierConfig {
            binth: 4,
            ..Default::default()
        };
        let options = partition_options(config.max_bits);
        let tree = build_tree(rules, 0, &config, &options, &mut kicked);
        assert!(kicked.iter().any(|r| r.id == 99));
        assert_eq!(tree.rule_count() + kicked.len(), 33);
    }
}
