//! Wildcard rule side-storage
//!
//! A small fixed-capacity bucket hung off an interior tree node for rules
//! that are wildcard on the bits the node splits on. Kept priority-sorted
//! lazily: mutation marks the bucket dirty, the next search re-sorts.

use std::cell::{Cell, RefCell};

use treeline_common::{Packet, Rule};

/// Fixed-capacity, priority-sorted wildcard bucket.
///
/// Lookups take shared access; the lazy re-sort runs through interior
/// mutability and leaves nothing else observable behind.
#[derive(Debug)]
pub struct WildcardStore {
    rules: RefCell<Vec<Rule>>,
    capacity: usize,
    sorted: Cell<bool>,
}

impl WildcardStore {
    /// Empty store holding at most `capacity` rules.
    pub fn new(capacity: usize) -> Self {
        Self {
            rules: RefCell::new(Vec::with_capacity(capacity)),
            capacity,
            sorted: Cell::new(true),
        }
    }

    /// Append a rule. Fails when the bucket is full.
    pub fn add(&mut self, rule: Rule) -> bool {
        let rules = self.rules.get_mut();
        if rules.len() >= self.capacity {
            return false;
        }
        rules.push(rule);
        self.sorted.set(false);
        true
    }

    /// Remove the rule with `id`, if present.
    pub fn remove(&mut self, id: u32) -> bool {
        let rules = self.rules.get_mut();
        match rules.iter().position(|r| r.id == id) {
            Some(pos) => {
                rules.remove(pos);
                self.sorted.set(false);
                true
            }
            None => false,
        }
    }

    /// Priority of the best rule matching `packet`, or `-1`.
    pub fn highest_match(&self, packet: &Packet) -> i32 {
        if self.is_empty() {
            return -1;
        }
        self.ensure_sorted();
        let rules = self.rules.borrow();
        // Sorted descending: the first hit is the answer.
        for rule in rules.iter() {
            if rule.matches(packet) {
                return rule.priority;
            }
        }
        -1
    }

    /// Priority of the best rule stored, or `-1` when empty.
    pub fn max_priority(&self) -> i32 {
        self.ensure_sorted();
        self.rules.borrow().first().map_or(-1, |r| r.priority)
    }

    /// Number of rules held.
    pub fn len(&self) -> usize {
        self.rules.borrow().len()
    }

    /// Whether the bucket holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.borrow().is_empty()
    }

    /// Capacity ceiling.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every rule.
    pub fn clear(&mut self) {
        self.rules.get_mut().clear();
        self.sorted.set(true);
    }

    /// Snapshot of the stored rules, priority-descending.
    pub fn rules(&self) -> Vec<Rule> {
        self.ensure_sorted();
        self.rules.borrow().clone()
    }

    fn ensure_sorted(&self) {
        if !self.sorted.get() {
            self.rules
                .borrow_mut()
                .sort_by(|a, b| b.priority.cmp(&a.priority));
            self.sorted.set(true);
        }
    }
}
