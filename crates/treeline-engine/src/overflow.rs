//! Priority-layered overflow container
//!
//! Catches the rules no tree could absorb: wildcard-heavy rules and the
//! residue of construction. Rules are binned into fixed-width priority
//! windows so a search can walk layers top-down and stop as soon as the
//! running best priority beats everything a layer could hold.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;

use treeline_common::{Packet, Rule};

/// One priority window worth of rules.
///
/// `sorted` is a dirty flag: mutation clears it, the next search re-sorts
/// under shared access. Re-sorting is the only thing a search may change.
#[derive(Debug)]
struct PriorityLayer {
    rules: RefCell<Vec<Rule>>,
    sorted: Cell<bool>,
    max_priority: i32,
}

impl PriorityLayer {
    fn new() -> Self {
        Self {
            rules: RefCell::new(Vec::new()),
            sorted: Cell::new(true),
            max_priority: -1,
        }
    }
}

/// Overflow container layered by priority window.
#[derive(Debug)]
pub struct OverflowContainer {
    layers: Vec<PriorityLayer>,
    rule_to_layer: HashMap<u32, usize>,
    layer_width: i32,
    lazy_sorts: Cell<u64>,
}

impl OverflowContainer {
    /// Empty container with the given priority window per layer.
    pub fn new(layer_width: i32) -> Self {
        Self {
            layers: Vec::new(),
            rule_to_layer: HashMap::new(),
            layer_width: layer_width.max(1),
            lazy_sorts: Cell::new(0),
        }
    }

    /// Add a rule to the layer covering its priority.
    pub fn insert(&mut self, rule: Rule) {
        let idx = (rule.priority.max(0) / self.layer_width) as usize;
        if idx >= self.layers.len() {
            self.layers.resize_with(idx + 1, PriorityLayer::new);
        }
        let layer = &mut self.layers[idx];
        layer.max_priority = layer.max_priority.max(rule.priority);
        layer.sorted.set(false);
        self.rule_to_layer.insert(rule.id, idx);
        layer.rules.get_mut().push(rule);
    }

    /// Remove the rule with `id`. O(1) layer lookup, linear within the
    /// layer.
    pub fn remove(&mut self, id: u32) -> bool {
        let Some(&idx) = self.rule_to_layer.get(&id) else {
            return false;
        };
        let Some(layer) = self.layers.get_mut(idx) else {
            return false;
        };
        let rules = layer.rules.get_mut();
        let Some(pos) = rules.iter().position(|r| r.id == id) else {
            return false;
        };
        rules.remove(pos);
        layer.sorted.set(false);
        layer.max_priority = rules.iter().map(|r| r.priority).max().unwrap_or(-1);
        self.rule_to_layer.remove(&id);
        true
    }

    /// Best matching priority above `current_best`, walking layers from the
    /// highest window down and pruning layers that cannot win.
    pub fn search(&self, packet: &Packet, current_best: i32) -> i32 {
        let mut best = current_best;
        for layer in self.layers.iter().rev() {
            if layer.max_priority <= best {
                continue;
            }
            if layer.rules.borrow().is_empty() {
                continue;
            }
            if !layer.sorted.get() {
                layer
                    .rules
                    .borrow_mut()
                    .sort_by(|a, b| b.priority.cmp(&a.priority));
                layer.sorted.set(true);
                self.lazy_sorts.set(self.lazy_sorts.get() + 1);
            }
            for rule in layer.rules.borrow().iter() {
                if rule.priority <= best {
                    break;
                }
                if rule.matches(packet) {
                    best = rule.priority;
                    break;
                }
            }
        }
        best
    }

    /// Re-layer the whole container into up to ten equal-sized bands,
    /// sorted descending overall. Idempotent for unchanged content.
    pub fn optimize(&mut self) {
        let mut all: Vec<Rule> = self
            .layers
            .iter_mut()
            .flat_map(|l| l.rules.get_mut().drain(..))
            .collect();
        if all.is_empty() {
            self.layers.clear();
            self.rule_to_layer.clear();
            return;
        }
        all.sort_by(|a, b| b.priority.cmp(&a.priority));

        let num_layers = (all.len() / 100).clamp(1, 10);
        let per_layer = (all.len() / num_layers).max(1);

        self.layers.clear();
        self.rule_to_layer.clear();
        self.layers.resize_with(num_layers, PriorityLayer::new);
        // Highest priorities land in the last layer so search still walks
        // best-first from the back.
        for (i, rule) in all.into_iter().enumerate() {
            let band = (i / per_layer).min(num_layers - 1);
            let idx = num_layers - 1 - band;
            let layer = &mut self.layers[idx];
            layer.max_priority = layer.max_priority.max(rule.priority);
            self.rule_to_layer.insert(rule.id, idx);
            layer.rules.get_mut().push(rule);
        }
    }

    /// Highest priority stored anywhere in the container, or `-1`.
    pub fn max_priority(&self) -> i32 {
        self.layers
            .iter()
            .map(|l| l.max_priority)
            .max()
            .unwrap_or(-1)
    }

    /// Total rules held across all layers.
    pub fn len(&self) -> usize {
        self.layers.iter().map(|l| l.rules.borrow().len()).sum()
    }

    /// Whether the container holds no rules.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.rules.borrow().is_empty())
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.layers.clear();
        self.rule_to_layer.clear();
    }

    /// Approximate heap footprint.
    pub fn mem_size_bytes(&self) -> usize {
        self.len() * mem::size_of::<Rule>()
            + self.layers.len() * mem::size_of::<PriorityLayer>()
            + self.rule_to_layer.len() * (mem::size_of::<u32>() + mem::size_of::<usize>())
    }

    /// How many lazy re-sorts searches have performed so far.
    pub fn lazy_sort_count(&self) -> u64 {
        self.lazy_sorts.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeline_common::{FieldRange, FIELD_COUNT};

    fn wildcard_rule(id: u32, priority: i32) -> Rule {
        Rule {
            id,
            priority,
            ranges: [
                FieldRange::full(32),
                FieldRange::full(32),
                FieldRange::full(16),
                FieldRange::full(16),
                FieldRange::full(8),
            ],
            prefix_len: [0; FIELD_COUNT],
        }
    }

    #[test]
    fn test_insert_search_remove() {
        let mut ovf = OverflowContainer::new(10_000);
        ovf.insert(wildcard_rule(0, 5));
        ovf.insert(wildcard_rule(1, 25_000));
        ovf.insert(wildcard_rule(2, 12_000));
        assert_eq!(ovf.len(), 3);
        assert_eq!(ovf.max_priority(), 25_000);

        let pkt = Packet::new([0; 5]);
        assert_eq!(ovf.search(&pkt, -1), 25_000);
        // Pruned entirely when the running best already beats every layer.
        assert_eq!(ovf.search(&pkt, 30_000), 30_000);

        assert!(ovf.remove(1));
        assert_eq!(ovf.search(&pkt, -1), 12_000);
        assert!(!ovf.remove(1));
        assert_eq!(ovf.len(), 2);
    }

    #[test]
    fn test_lazy_sort_runs_once() {
        let mut ovf = OverflowContainer::new(10_000);
        for i in 0..10 {
            ovf.insert(wildcard_rule(i, i as i32));
        }
        let pkt = Packet::new([0; 5]);
        assert_eq!(ovf.lazy_sort_count(), 0);
        assert_eq!(ovf.search(&pkt, -1), 9);
        assert_eq!(ovf.lazy_sort_count(), 1);
        // No mutation in between: the second search must not re-sort.
        assert_eq!(ovf.search(&pkt, -1), 9);
        assert_eq!(ovf.lazy_sort_count(), 1);

        ovf.insert(wildcard_rule(99, 3));
        let _ = ovf.search(&pkt, -1);
        assert_eq!(ovf.lazy_sort_count(), 2);
    }

    #[test]
    fn test_optimize_preserves_content() {
        let mut ovf = OverflowContainer::new(10_000);
        for i in 0..250 {
            ovf.insert(wildcard_rule(i, (i * 7) as i32));
        }
        let pkt = Packet::new([0; 5]);
        let before = ovf.search(&pkt, -1);
        ovf.optimize();
        assert_eq!(ovf.len(), 250);
        assert_eq!(ovf.search(&pkt, -1), before);
        assert_eq!(ovf.max_priority(), 249 * 7);
        // Every rule still reachable by id.
        assert!(ovf.remove(123));
        assert_eq!(ovf.len(), 249);
    }

    #[test]
    fn test_zero_priority_rule() {
        let mut ovf = OverflowContainer::new(10_000);
        ovf.insert(wildcard_rule(0, 0));
        let pkt = Packet::new([0; 5]);
        assert_eq!(ovf.search(&pkt, -1), 0);
        assert_eq!(ovf.max_priority(), 0);
    }
}
