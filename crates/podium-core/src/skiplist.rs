//! Indexable skip list ordered by rank.
//!
//! Every forward link records how many level-0 nodes it jumps over (its
//! span), which turns the skip list into an order-statistics structure:
//! rank lookups and rank-to-node lookups are `O(log N)`, and a rank window is
//! `O(log N + window)`.
//!
//! Nodes live in an arena (`Vec<Node>`) and link to each other by index. Slot
//! 0 is the header. Freed slots are recycled.
//!
//! Order: higher score first; equal scores fall back to ascending member.

use rand::Rng;
use std::cmp::Ordering;

const MAX_LEVEL: usize = 32;
const BRANCH_PROBABILITY: f64 = 0.25;
const HEAD: usize = 0;

/// Compare two `(score, member)` keys in rank order.
#[must_use]
pub fn rank_order(a_score: f64, a_member: &str, b_score: f64, b_member: &str) -> Ordering {
    b_score
        .total_cmp(&a_score)
        .then_with(|| a_member.cmp(b_member))
}

#[derive(Debug, Clone, Copy)]
struct Link {
    next: Option<usize>,
    span: usize,
}

const EMPTY_LINK: Link = Link {
    next: None,
    span: 0,
};

#[derive(Debug)]
struct Node {
    member: String,
    score: f64,
    links: Vec<Link>,
}

/// A skip list of `(member, score)` pairs kept in rank order.
#[derive(Debug)]
pub struct SkipList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    level: usize,
    len: usize,
}

impl SkipList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        let head = Node {
            member: String::new(),
            score: 0.0,
            links: vec![EMPTY_LINK; MAX_LEVEL],
        };
        Self {
            nodes: vec![head],
            free: Vec::new(),
            level: 1,
            len: 0,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove every element.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn precedes(&self, idx: usize, score: f64, member: &str) -> bool {
        let node = &self.nodes[idx];
        rank_order(node.score, &node.member, score, member) == Ordering::Less
    }

    fn is_key(&self, idx: usize, score: f64, member: &str) -> bool {
        let node = &self.nodes[idx];
        node.score.total_cmp(&score) == Ordering::Equal && node.member == member
    }

    fn random_level() -> usize {
        let mut rng = rand::thread_rng();
        let mut level = 1;
        while level < MAX_LEVEL && rng.gen_bool(BRANCH_PROBABILITY) {
            level += 1;
        }
        level
    }

    fn alloc(&mut self, member: &str, score: f64, level: usize) -> usize {
        let node = Node {
            member: member.to_owned(),
            score,
            links: vec![EMPTY_LINK; level],
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        node.member = String::new();
        node.links = Vec::new();
        self.free.push(idx);
    }

    /// Insert a key. The caller guarantees the member is not already present.
    pub fn insert(&mut self, member: &str, score: f64) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];

        let mut x = HEAD;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.nodes[x].links[i].next {
                if !self.precedes(next, score, member) {
                    break;
                }
                rank[i] += self.nodes[x].links[i].span;
                x = next;
            }
            update[i] = x;
        }

        let level = Self::random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = HEAD;
                self.nodes[HEAD].links[i].span = self.len;
            }
            self.level = level;
        }

        let idx = self.alloc(member, score, level);
        for i in 0..level {
            let prev = update[i];
            let prev_link = self.nodes[prev].links[i];
            let distance = rank[0] - rank[i];
            self.nodes[idx].links[i] = Link {
                next: prev_link.next,
                span: prev_link.span - distance,
            };
            self.nodes[prev].links[i] = Link {
                next: Some(idx),
                span: distance + 1,
            };
        }

        // links above the new node now jump over one more element
        for i in level..self.level {
            self.nodes[update[i]].links[i].span += 1;
        }

        self.len += 1;
    }

    /// Remove a key. Returns `false` if it was not present.
    pub fn remove(&mut self, member: &str, score: f64) -> bool {
        let mut update = [HEAD; MAX_LEVEL];

        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].next {
                if !self.precedes(next, score, member) {
                    break;
                }
                x = next;
            }
            update[i] = x;
        }

        let target = match self.nodes[x].links[0].next {
            Some(t) if self.is_key(t, score, member) => t,
            _ => return false,
        };

        for i in 0..self.level {
            let prev = update[i];
            if self.nodes[prev].links[i].next == Some(target) {
                let removed = self.nodes[target].links[i];
                let link = &mut self.nodes[prev].links[i];
                link.span = link.span + removed.span - 1;
                link.next = removed.next;
            } else {
                self.nodes[prev].links[i].span -= 1;
            }
        }

        while self.level > 1 && self.nodes[HEAD].links[self.level - 1].next.is_none() {
            self.level -= 1;
        }

        self.release(target);
        self.len -= 1;
        true
    }

    /// 1-based rank of a key, if present.
    #[must_use]
    pub fn rank(&self, member: &str, score: f64) -> Option<usize> {
        let mut rank = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].next {
                let node = &self.nodes[next];
                if rank_order(node.score, &node.member, score, member) == Ordering::Greater {
                    break;
                }
                rank += self.nodes[x].links[i].span;
                x = next;
            }
            if x != HEAD && self.is_key(x, score, member) {
                return Some(rank);
            }
        }
        None
    }

    fn node_at(&self, rank: usize) -> Option<usize> {
        if rank == 0 || rank > self.len {
            return None;
        }

        let mut traversed = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.nodes[x].links[i].next {
                let span = self.nodes[x].links[i].span;
                if traversed + span > rank {
                    break;
                }
                traversed += span;
                x = next;
            }
            if traversed == rank {
                return Some(x);
            }
        }
        None
    }

    /// Element at a 1-based rank.
    #[must_use]
    pub fn get(&self, rank: usize) -> Option<(&str, f64)> {
        self.node_at(rank).map(|idx| {
            let node = &self.nodes[idx];
            (node.member.as_str(), node.score)
        })
    }

    /// Iterate the inclusive 1-based rank window `[start, stop]`.
    ///
    /// Bounds past the end are clamped; `start == 0` is treated as 1.
    #[must_use]
    pub fn range(&self, start: usize, stop: usize) -> Range<'_> {
        let start = start.max(1);
        let stop = stop.min(self.len);
        let remaining = if start > stop { 0 } else { stop - start + 1 };
        let cursor = if remaining == 0 {
            None
        } else {
            self.node_at(start)
        };
        Range {
            list: self,
            cursor,
            remaining,
        }
    }

    /// Iterate every element in rank order.
    #[must_use]
    pub fn iter(&self) -> Range<'_> {
        self.range(1, self.len)
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a rank window.
pub struct Range<'a> {
    list: &'a SkipList,
    cursor: Option<usize>,
    remaining: usize,
}

impl<'a> Iterator for Range<'a> {
    type Item = (&'a str, f64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.cursor?;
        let node = &self.list.nodes[idx];
        self.cursor = node.links[0].next;
        self.remaining -= 1;
        Some((node.member.as_str(), node.score))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn sorted(pairs: &HashMap<String, f64>) -> Vec<(String, f64)> {
        let mut v: Vec<(String, f64)> = pairs.iter().map(|(m, s)| (m.clone(), *s)).collect();
        v.sort_by(|a, b| rank_order(a.1, &a.0, b.1, &b.0));
        v
    }

    #[test]
    fn test_rank_order_ties_by_member() {
        assert_eq!(rank_order(10.0, "a", 5.0, "a"), Ordering::Less);
        assert_eq!(rank_order(5.0, "a", 5.0, "b"), Ordering::Less);
        assert_eq!(rank_order(5.0, "b", 5.0, "a"), Ordering::Greater);
    }

    #[test]
    fn test_insert_rank_and_get() {
        let mut list = SkipList::new();
        list.insert("p1", 100.0);
        list.insert("p2", 200.0);
        list.insert("p3", 150.0);

        assert_eq!(list.len(), 3);
        assert_eq!(list.rank("p2", 200.0), Some(1));
        assert_eq!(list.rank("p3", 150.0), Some(2));
        assert_eq!(list.rank("p1", 100.0), Some(3));
        assert_eq!(list.rank("p1", 99.0), None);

        assert_eq!(list.get(1), Some(("p2", 200.0)));
        assert_eq!(list.get(3), Some(("p1", 100.0)));
        assert_eq!(list.get(0), None);
        assert_eq!(list.get(4), None);
    }

    #[test]
    fn test_remove_adjusts_ranks() {
        let mut list = SkipList::new();
        for (i, m) in ["a", "b", "c", "d"].iter().enumerate() {
            list.insert(m, i as f64);
        }
        assert!(list.remove("c", 2.0));
        assert!(!list.remove("c", 2.0));
        assert_eq!(list.len(), 3);
        assert_eq!(list.rank("d", 3.0), Some(1));
        assert_eq!(list.rank("b", 1.0), Some(2));
        assert_eq!(list.rank("a", 0.0), Some(3));
    }

    #[test]
    fn test_range_clamps() {
        let mut list = SkipList::new();
        for i in 0..10 {
            list.insert(&format!("m{i}"), i as f64);
        }
        let window: Vec<_> = list.range(0, 3).map(|(m, _)| m.to_string()).collect();
        assert_eq!(window, vec!["m9", "m8", "m7"]);

        assert_eq!(list.range(9, 50).count(), 2);
        assert_eq!(list.range(11, 20).count(), 0);
        assert_eq!(list.range(5, 4).count(), 0);
    }

    #[test]
    fn test_slots_are_reused() {
        let mut list = SkipList::new();
        for round in 0..5 {
            for i in 0..100 {
                list.insert(&format!("m{i}"), (i * round) as f64);
            }
            for i in 0..100 {
                assert!(list.remove(&format!("m{i}"), (i * round) as f64));
            }
        }
        assert!(list.is_empty());
        assert!(list.nodes.len() <= 101);
    }

    proptest! {
        #[test]
        fn prop_matches_sorted_model(
            ops in prop::collection::vec((0u8..40, -50i32..50, any::<bool>()), 1..300)
        ) {
            let mut list = SkipList::new();
            let mut model: HashMap<String, f64> = HashMap::new();

            for (member, score, insert) in ops {
                let member = format!("m{member}");
                let score = f64::from(score);
                if let Some(old) = model.remove(&member) {
                    prop_assert!(list.remove(&member, old));
                }
                if insert {
                    list.insert(&member, score);
                    model.insert(member, score);
                }
            }

            let expected = sorted(&model);
            prop_assert_eq!(list.len(), expected.len());

            let actual: Vec<(String, f64)> =
                list.iter().map(|(m, s)| (m.to_string(), s)).collect();
            prop_assert_eq!(&actual, &expected);

            for (i, (member, score)) in expected.iter().enumerate() {
                prop_assert_eq!(list.rank(member, *score), Some(i + 1));
                prop_assert_eq!(list.get(i + 1).map(|(m, _)| m.to_string()), Some(member.clone()));
            }
        }
    }
}
