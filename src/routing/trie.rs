//! Level-indexed routing trie mapping subscription filters to payloads.
//!
//! Each node holds an optional payload for filters terminating there, a
//! literal-level child map, a `+` child, and a payload slot for a trailing
//! `#`. The `#` slot has no children by construction, and nodes left with
//! neither payloads nor children are pruned on every mutating operation.

use std::collections::{BTreeSet, HashMap};

use super::topic::{Filter, FilterLevel, Topic};

/// Capability interface for trie payloads: an associative combine used on
/// overlapping inserts, a difference used on unsubscribe, and the emptiness
/// test that drives pruning.
pub trait RoutePayload: Clone {
    fn combine(self, other: Self) -> Self;
    fn difference(self, other: &Self) -> Self;
    fn is_empty(&self) -> bool;
}

/// Set payloads combine by union and difference by set-minus.
impl<T: Ord + Clone> RoutePayload for BTreeSet<T> {
    fn combine(mut self, other: Self) -> Self {
        self.extend(other);
        self
    }

    fn difference(mut self, other: &Self) -> Self {
        for item in other {
            self.remove(item);
        }
        self
    }

    fn is_empty(&self) -> bool {
        BTreeSet::is_empty(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Node<V> {
    payload: Option<V>,
    hash: Option<V>,
    children: HashMap<String, Node<V>>,
    plus: Option<Box<Node<V>>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Node {
            payload: None,
            hash: None,
            children: HashMap::new(),
            plus: None,
        }
    }
}

impl<V> Node<V> {
    fn is_vacant(&self) -> bool {
        self.payload.is_none()
            && self.hash.is_none()
            && self.children.is_empty()
            && self.plus.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trie<V> {
    root: Node<V>,
}

impl<V> Default for Trie<V> {
    fn default() -> Self {
        Trie {
            root: Node::default(),
        }
    }
}

impl<V: RoutePayload> Trie<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_vacant()
    }

    /// Insert `value` at `filter`, combining with any existing payload.
    /// Inserting the same filter twice never duplicates structure.
    pub fn insert_with(&mut self, filter: &Filter, value: V) {
        let mut node = &mut self.root;
        for level in filter.levels() {
            match level {
                FilterLevel::MultiWildcard => {
                    combine_slot(&mut node.hash, value);
                    return;
                }
                FilterLevel::SingleWildcard => {
                    node = node.plus.get_or_insert_with(Default::default);
                }
                FilterLevel::Literal(lit) => {
                    node = node.children.entry(lit.clone()).or_default();
                }
            }
        }
        combine_slot(&mut node.payload, value);
    }

    /// Remove the payload stored exactly at `filter`, pruning any nodes
    /// left vacant along the path.
    pub fn remove(&mut self, filter: &Filter) {
        Self::remove_at(&mut self.root, filter.levels());
    }

    fn remove_at(node: &mut Node<V>, levels: &[FilterLevel]) {
        match levels.split_first() {
            None => node.payload = None,
            Some((FilterLevel::MultiWildcard, _)) => node.hash = None,
            Some((FilterLevel::SingleWildcard, rest)) => {
                if let Some(child) = node.plus.as_deref_mut() {
                    Self::remove_at(child, rest);
                }
                if node.plus.as_deref().is_some_and(Node::is_vacant) {
                    node.plus = None;
                }
            }
            Some((FilterLevel::Literal(lit), rest)) => {
                let prune = if let Some(child) = node.children.get_mut(lit) {
                    Self::remove_at(child, rest);
                    child.is_vacant()
                } else {
                    false
                };
                if prune {
                    node.children.remove(lit);
                }
            }
        }
    }

    /// Replace the payload at `filter` with `f(payload)`, removing it (and
    /// pruning) when the result is empty. Absent payloads are untouched.
    pub fn adjust(&mut self, filter: &Filter, f: impl FnOnce(V) -> V) {
        Self::adjust_at(&mut self.root, filter.levels(), f);
    }

    fn adjust_at(node: &mut Node<V>, levels: &[FilterLevel], f: impl FnOnce(V) -> V) {
        match levels.split_first() {
            None => adjust_slot(&mut node.payload, f),
            Some((FilterLevel::MultiWildcard, _)) => adjust_slot(&mut node.hash, f),
            Some((FilterLevel::SingleWildcard, rest)) => {
                if let Some(child) = node.plus.as_deref_mut() {
                    Self::adjust_at(child, rest, f);
                }
                if node.plus.as_deref().is_some_and(Node::is_vacant) {
                    node.plus = None;
                }
            }
            Some((FilterLevel::Literal(lit), rest)) => {
                let prune = if let Some(child) = node.children.get_mut(lit) {
                    Self::adjust_at(child, rest, f);
                    child.is_vacant()
                } else {
                    false
                };
                if prune {
                    node.children.remove(lit);
                }
            }
        }
    }

    /// Structural zip: where both tries carry a payload, replace the left
    /// one with its difference against the right; left-only payloads are
    /// kept and right-only payloads ignored. Emptied nodes are pruned.
    pub fn subtract(&mut self, other: &Trie<V>) {
        Self::subtract_at(&mut self.root, &other.root);
    }

    fn subtract_at(node: &mut Node<V>, other: &Node<V>) {
        if let Some(rhs) = other.payload.as_ref() {
            subtract_slot(&mut node.payload, rhs);
        }
        if let Some(rhs) = other.hash.as_ref() {
            subtract_slot(&mut node.hash, rhs);
        }
        if let Some(other_plus) = other.plus.as_deref() {
            if let Some(child) = node.plus.as_deref_mut() {
                Self::subtract_at(child, other_plus);
            }
            if node.plus.as_deref().is_some_and(Node::is_vacant) {
                node.plus = None;
            }
        }
        for (level, other_child) in &other.children {
            let prune = if let Some(child) = node.children.get_mut(level) {
                Self::subtract_at(child, other_child);
                child.is_vacant()
            } else {
                false
            };
            if prune {
                node.children.remove(level);
            }
        }
    }

    /// Transform every payload, preserving structure.
    pub fn map<W: RoutePayload>(&self, f: impl Fn(&V) -> W) -> Trie<W> {
        Trie {
            root: Self::map_node(&self.root, &f),
        }
    }

    fn map_node<W>(node: &Node<V>, f: &impl Fn(&V) -> W) -> Node<W> {
        Node {
            payload: node.payload.as_ref().map(f),
            hash: node.hash.as_ref().map(f),
            children: node
                .children
                .iter()
                .map(|(level, child)| (level.clone(), Self::map_node(child, f)))
                .collect(),
            plus: node
                .plus
                .as_deref()
                .map(|child| Box::new(Self::map_node(child, f))),
        }
    }

    /// Combined payload of every stored filter matching `topic`, or `None`
    /// when nothing matches. The trie is walked in lockstep with the topic
    /// levels: at each step the literal child and the `+` child descend,
    /// while a `#` slot contributes unconditionally at any depth (so `a/#`
    /// also matches the topic `a`).
    pub fn matches(&self, topic: &Topic) -> Option<V> {
        let mut acc = None;
        Self::match_at(&self.root, topic.levels(), &mut acc);
        acc
    }

    fn match_at(node: &Node<V>, levels: &[String], acc: &mut Option<V>) {
        if let Some(value) = node.hash.as_ref() {
            combine_slot(acc, value.clone());
        }
        match levels.split_first() {
            None => {
                if let Some(value) = node.payload.as_ref() {
                    combine_slot(acc, value.clone());
                }
            }
            Some((level, rest)) => {
                if let Some(child) = node.children.get(level) {
                    Self::match_at(child, rest, acc);
                }
                if let Some(child) = node.plus.as_deref() {
                    Self::match_at(child, rest, acc);
                }
            }
        }
    }
}

fn combine_slot<V: RoutePayload>(slot: &mut Option<V>, value: V) {
    *slot = Some(match slot.take() {
        Some(existing) => existing.combine(value),
        None => value,
    });
}

fn adjust_slot<V: RoutePayload>(slot: &mut Option<V>, f: impl FnOnce(V) -> V) {
    if let Some(value) = slot.take() {
        let value = f(value);
        if !value.is_empty() {
            *slot = Some(value);
        }
    }
}

fn subtract_slot<V: RoutePayload>(slot: &mut Option<V>, rhs: &V) {
    if let Some(value) = slot.take() {
        let value = value.difference(rhs);
        if !value.is_empty() {
            *slot = Some(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> Filter {
        Filter::parse(s).unwrap()
    }

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    fn set(keys: &[u64]) -> BTreeSet<u64> {
        keys.iter().copied().collect()
    }

    #[test]
    fn insert_then_match() {
        let mut trie = Trie::new();
        trie.insert_with(&filter("a/+"), set(&[1]));
        assert_eq!(trie.matches(&topic("a/x")), Some(set(&[1])));
        assert_eq!(trie.matches(&topic("b/x")), None);
        assert_eq!(trie.matches(&topic("a/x/y")), None);
    }

    #[test]
    fn remove_is_insert_inverse() {
        let mut trie = Trie::new();
        trie.insert_with(&filter("a/b"), set(&[1]));
        let snapshot = trie.clone();
        trie.insert_with(&filter("a/b/c"), set(&[2]));
        trie.remove(&filter("a/b/c"));
        assert_eq!(trie, snapshot);
        trie.remove(&filter("a/b"));
        assert!(trie.is_empty());
    }

    #[test]
    fn combine_matches_single_insert_of_union() {
        let mut twice = Trie::new();
        twice.insert_with(&filter("a/#"), set(&[1]));
        twice.insert_with(&filter("a/#"), set(&[2]));
        let mut once = Trie::new();
        once.insert_with(&filter("a/#"), set(&[1, 2]));
        assert_eq!(twice, once);
    }

    #[test]
    fn multi_wildcard_captures_descendants_and_self() {
        let mut trie = Trie::new();
        trie.insert_with(&filter("a/#"), set(&[7]));
        assert_eq!(trie.matches(&topic("a")), Some(set(&[7])));
        assert_eq!(trie.matches(&topic("a/b")), Some(set(&[7])));
        assert_eq!(trie.matches(&topic("a/b/c")), Some(set(&[7])));
        assert_eq!(trie.matches(&topic("b/a")), None);
    }

    #[test]
    fn single_wildcard_matches_one_level_including_empty() {
        let mut trie = Trie::new();
        trie.insert_with(&filter("+/x"), set(&[3]));
        assert_eq!(trie.matches(&topic("/x")), Some(set(&[3])));
        assert_eq!(trie.matches(&topic("a/x")), Some(set(&[3])));
        assert_eq!(trie.matches(&topic("x")), None);
        assert_eq!(trie.matches(&topic("a/b/x")), None);
    }

    #[test]
    fn top_level_wildcards_cover_leading_empty_levels() {
        let mut trie = Trie::new();
        trie.insert_with(&filter("#"), set(&[1]));
        assert_eq!(trie.matches(&topic("/a")), Some(set(&[1])));
        assert_eq!(trie.matches(&topic("a/b/c")), Some(set(&[1])));

        let mut plus = Trie::new();
        plus.insert_with(&filter("+"), set(&[2]));
        assert_eq!(plus.matches(&topic("a")), Some(set(&[2])));
        assert_eq!(plus.matches(&topic("a/b")), None);
    }

    #[test]
    fn overlapping_filters_union_their_payloads() {
        let mut trie = Trie::new();
        trie.insert_with(&filter("a/b"), set(&[1]));
        trie.insert_with(&filter("a/+"), set(&[2]));
        trie.insert_with(&filter("#"), set(&[3]));
        assert_eq!(trie.matches(&topic("a/b")), Some(set(&[1, 2, 3])));
        assert_eq!(trie.matches(&topic("a/c")), Some(set(&[2, 3])));
    }

    #[test]
    fn adjust_prunes_emptied_payloads() {
        let mut trie = Trie::new();
        trie.insert_with(&filter("a/b"), set(&[1, 2]));
        trie.adjust(&filter("a/b"), |payload| {
            RoutePayload::difference(payload, &set(&[1]))
        });
        assert_eq!(trie.matches(&topic("a/b")), Some(set(&[2])));
        trie.adjust(&filter("a/b"), |payload| {
            RoutePayload::difference(payload, &set(&[2]))
        });
        assert!(trie.is_empty());
    }

    #[test]
    fn subtract_removes_overlaps_and_keeps_the_rest() {
        let mut broker = Trie::new();
        broker.insert_with(&filter("a/b"), set(&[1, 2]));
        broker.insert_with(&filter("c/#"), set(&[1]));
        broker.insert_with(&filter("d"), set(&[2]));

        let mut gone = Trie::new();
        gone.insert_with(&filter("a/b"), set(&[1]));
        gone.insert_with(&filter("c/#"), set(&[1]));

        broker.subtract(&gone);
        assert_eq!(broker.matches(&topic("a/b")), Some(set(&[2])));
        assert_eq!(broker.matches(&topic("c/x")), None);
        assert_eq!(broker.matches(&topic("d")), Some(set(&[2])));
    }

    #[test]
    fn map_converts_payload_types() {
        let mut trie: Trie<BTreeSet<u64>> = Trie::new();
        trie.insert_with(&filter("a/+"), set(&[5]));
        trie.insert_with(&filter("b/#"), set(&[6]));
        let relabeled = trie.map(|_| set(&[9]));
        assert_eq!(relabeled.matches(&topic("a/x")), Some(set(&[9])));
        assert_eq!(relabeled.matches(&topic("b/y")), Some(set(&[9])));
    }
}
