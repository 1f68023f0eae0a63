//! Sorted Collections
//!
//! A sorted set pairs two indexes over the same members:
//!
//! - an [`AvlTree`] ordered by `(score, name)` for range and rank queries
//! - a [`HashIndex`] keyed by name for point lookups, whose payload is the
//!   member's tree handle
//!
//! Both are updated together on every mutation.

use crate::storage::avl::{AvlTree, NodeId};
use crate::storage::hash::{hash_bytes, HashIndex};
use bytes::Bytes;
use std::cmp::Ordering;

/// One member of a sorted set.
#[derive(Debug, Clone)]
pub struct ZMember {
    pub score: f64,
    pub name: Bytes,
}

impl PartialEq for ZMember {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ZMember {}

impl PartialOrd for ZMember {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ZMember {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// A set of unique names ordered by score.
#[derive(Debug, Default)]
pub struct ZSet {
    tree: AvlTree<ZMember>,
    names: HashIndex<NodeId>,
}

impl ZSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Adds `name` or moves it to `score`. Returns true if it was added.
    pub fn insert(&mut self, name: Bytes, score: f64) -> bool {
        let tree = &self.tree;
        let found = self
            .names
            .lookup(hash_bytes(&name), |id| tree[*id].name == name);

        match found {
            Some(slot) => {
                let node = self.names[slot];
                if self.tree[node].score.total_cmp(&score).is_ne() {
                    let mut member = self.tree.delete(node);
                    member.score = score;
                    self.names[slot] = self.tree.insert(member);
                }
                false
            }
            None => {
                let hcode = hash_bytes(&name);
                let node = self.tree.insert(ZMember { score, name });
                self.names.insert(hcode, node);
                true
            }
        }
    }

    /// Tree handle of `name`.
    pub fn lookup(&mut self, name: &[u8]) -> Option<NodeId> {
        let tree = &self.tree;
        let slot = self
            .names
            .lookup(hash_bytes(name), |id| tree[*id].name == name)?;
        Some(self.names[slot])
    }

    pub fn score(&mut self, name: &[u8]) -> Option<f64> {
        self.lookup(name).map(|node| self.tree[node].score)
    }

    /// Zero-based rank of `name` in score order.
    pub fn rank(&mut self, name: &[u8]) -> Option<usize> {
        self.lookup(name).map(|node| self.tree.rank(node))
    }

    /// Removes `name`, returning true if it was present.
    pub fn remove(&mut self, name: &[u8]) -> bool {
        let tree = &self.tree;
        match self
            .names
            .pop(hash_bytes(name), |id| tree[*id].name == name)
        {
            Some(node) => {
                self.tree.delete(node);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn member(&self, node: NodeId) -> &ZMember {
        &self.tree[node]
    }

    /// First member ordered at or after `(score, name)`.
    pub fn seek_ge(&self, score: f64, name: &[u8]) -> Option<NodeId> {
        let probe = ZMember {
            score,
            name: Bytes::copy_from_slice(name),
        };
        self.tree.seek_ge(&probe)
    }

    /// Member `k` positions away from `node`.
    pub fn offset(&self, node: NodeId, k: i64) -> Option<NodeId> {
        self.tree.offset(node, k)
    }

    /// Up to `limit` members starting `offset` places after the first member
    /// at or after `(score, name)`.
    pub fn query(&self, score: f64, name: &[u8], offset: i64, limit: usize) -> Vec<&ZMember> {
        let mut out = Vec::new();
        let mut cur = self
            .seek_ge(score, name)
            .and_then(|start| self.offset(start, offset));

        while let Some(node) = cur {
            if out.len() >= limit {
                break;
            }
            out.push(self.member(node));
            cur = self.offset(node, 1);
        }
        out
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &ZMember> + '_ {
        self.tree.iter().map(|(_, m)| m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::avl::tests::verify;

    fn names(members: Vec<&ZMember>) -> Vec<String> {
        members
            .into_iter()
            .map(|m| String::from_utf8_lossy(&m.name).into_owned())
            .collect()
    }

    #[test]
    fn test_insert_and_score() {
        let mut z = ZSet::new();
        assert!(z.insert(Bytes::from("alice"), 3.0));
        assert!(z.insert(Bytes::from("bob"), 1.0));
        assert!(!z.insert(Bytes::from("alice"), 2.0));

        assert_eq!(z.len(), 2);
        assert_eq!(z.score(b"alice"), Some(2.0));
        assert_eq!(z.score(b"bob"), Some(1.0));
        assert_eq!(z.score(b"carol"), None);
    }

    #[test]
    fn test_score_update_reorders() {
        let mut z = ZSet::new();
        z.insert(Bytes::from("a"), 1.0);
        z.insert(Bytes::from("b"), 2.0);
        z.insert(Bytes::from("c"), 3.0);

        z.insert(Bytes::from("a"), 10.0);
        verify(&z.tree);
        let order: Vec<_> = z.iter().map(|m| m.name.clone()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(z.rank(b"a"), Some(2));
    }

    #[test]
    fn test_ties_ordered_by_name() {
        let mut z = ZSet::new();
        for name in ["delta", "alpha", "charlie", "bravo"] {
            z.insert(Bytes::from(name), 1.0);
        }
        assert_eq!(
            names(z.query(1.0, b"", 0, 10)),
            vec!["alpha", "bravo", "charlie", "delta"]
        );
    }

    #[test]
    fn test_remove() {
        let mut z = ZSet::new();
        z.insert(Bytes::from("a"), 1.0);
        z.insert(Bytes::from("b"), 2.0);

        assert!(z.remove(b"a"));
        assert!(!z.remove(b"a"));
        assert_eq!(z.score(b"a"), None);
        assert_eq!(z.len(), 1);
        verify(&z.tree);
        assert_eq!(names(z.query(0.0, b"", 0, 10)), vec!["b"]);

        z.insert(Bytes::from("c"), 3.0);
        verify(&z.tree);
        assert_eq!(names(z.query(0.0, b"", 0, 10)), vec!["b", "c"]);
        assert_eq!(z.rank(b"c"), Some(1));
    }

    #[test]
    fn test_rescore_to_negative_zero() {
        let mut z = ZSet::new();
        z.insert(Bytes::from("a"), 0.0);
        z.insert(Bytes::from("b"), 0.0);

        assert!(!z.insert(Bytes::from("b"), -0.0));
        let score = z.score(b"b").unwrap();
        assert!(score == 0.0 && score.is_sign_negative());
        // -0.0 orders before 0.0.
        assert_eq!(z.rank(b"b"), Some(0));
        verify(&z.tree);
    }

    #[test]
    fn test_query_offset_and_limit() {
        let mut z = ZSet::new();
        for i in 0..20 {
            z.insert(Bytes::from(format!("m{:02}", i)), i as f64);
        }

        assert_eq!(names(z.query(5.0, b"", 0, 3)), vec!["m05", "m06", "m07"]);
        assert_eq!(names(z.query(5.0, b"", 2, 2)), vec!["m07", "m08"]);
        assert_eq!(names(z.query(5.0, b"", -2, 2)), vec!["m03", "m04"]);
        assert_eq!(names(z.query(18.0, b"", 0, 10)), vec!["m18", "m19"]);
        assert!(z.query(100.0, b"", 0, 10).is_empty());
        assert!(z.query(0.0, b"", 50, 10).is_empty());
        assert!(z.query(0.0, b"", 0, 0).is_empty());
    }

    #[test]
    fn test_thousand_members_rank_walk() {
        let mut z = ZSet::new();
        for i in (0..1000).map(|i| (i * 7919) % 1000) {
            z.insert(Bytes::from(format!("m{:04}", i)), i as f64);
        }
        verify(&z.tree);

        let first = z.lookup(b"m0000").unwrap();
        let target = z.offset(first, 500).unwrap();
        assert_eq!(&z.member(target).name[..], b"m0500");

        assert!(z.remove(b"m0500"));
        let now_500th = z.offset(first, 499).unwrap();
        assert_eq!(&z.member(now_500th).name[..], b"m0499");
        let now_501st = z.offset(first, 500).unwrap();
        assert_eq!(&z.member(now_501st).name[..], b"m0501");
    }
}
