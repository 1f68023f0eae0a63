//! Order-Statistics AVL Tree
//!
//! The secondary index behind sorted collections. Every node carries its
//! subtree height (for balancing) and its subtree size (for rank queries),
//! so walking `k` positions away from a node costs O(log n) no matter how
//! large `k` is.
//!
//! Nodes live in a slab arena and refer to each other by [`NodeId`]. A
//! parent link is a plain handle with no ownership attached, which keeps
//! rotations to a handful of link rewrites.
//!
//! ## Invariants
//!
//! - `|height(left) - height(right)| <= 1` for every node once an
//!   operation returns (a difference of 2 exists only while fixing up).
//! - `count = 1 + count(left) + count(right)`.
//! - In-order traversal is sorted; equal values keep insertion order.

use slab::Slab;
use std::ops::Index;

/// Stable handle to a node in an [`AvlTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node<T> {
    value: T,
    height: u32,
    count: u32,
    left: Option<NodeId>,
    right: Option<NodeId>,
    parent: Option<NodeId>,
}

impl<T> Node<T> {
    fn leaf(value: T) -> Self {
        Self {
            value,
            height: 1,
            count: 1,
            left: None,
            right: None,
            parent: None,
        }
    }
}

/// A balanced search tree with rank-based navigation.
#[derive(Debug)]
pub struct AvlTree<T> {
    nodes: Slab<Node<T>>,
    root: Option<NodeId>,
}

impl<T> Default for AvlTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AvlTree<T> {
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            root: None,
        }
    }

    /// Number of nodes reachable from the root.
    #[inline]
    pub fn len(&self) -> usize {
        self.count(self.root) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    #[inline]
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(id.0).map(|n| &n.value)
    }

    /// The smallest element.
    pub fn first(&self) -> Option<NodeId> {
        let mut cur = self.root?;
        while let Some(left) = self.node(cur).left {
            cur = left;
        }
        Some(cur)
    }

    /// Returns the node `k` positions after `id` in sorted order, or before
    /// it when `k` is negative. `None` when that position is out of range.
    pub fn offset(&self, id: NodeId, k: i64) -> Option<NodeId> {
        let mut node = id;
        let mut pos: i64 = 0;

        while pos != k {
            let n = self.node(node);
            if pos < k && pos + self.count(n.right) >= k {
                // Target is inside the right subtree.
                let right = n.right?;
                node = right;
                pos += self.count(self.node(right).left) + 1;
            } else if pos > k && pos - self.count(n.left) <= k {
                // Target is inside the left subtree.
                let left = n.left?;
                node = left;
                pos -= self.count(self.node(left).right) + 1;
            } else {
                // Not below us: climb.
                let parent = n.parent?;
                if self.node(parent).right == Some(node) {
                    pos -= self.count(n.left) + 1;
                } else {
                    pos += self.count(n.right) + 1;
                }
                node = parent;
            }
        }
        Some(node)
    }

    /// Zero-based position of `id` in sorted order.
    pub fn rank(&self, id: NodeId) -> usize {
        let mut rank = self.count(self.node(id).left) as usize;
        let mut cur = id;
        while let Some(parent) = self.node(cur).parent {
            let p = self.node(parent);
            if p.right == Some(cur) {
                rank += self.count(p.left) as usize + 1;
            }
            cur = parent;
        }
        rank
    }

    /// In-order iterator over the values.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            tree: self,
            next: self.first(),
        }
    }

    /// Detaches `id` from the tree and returns its value.
    pub fn delete(&mut self, id: NodeId) -> T {
        let (left, right) = {
            let n = self.node(id);
            (n.left, n.right)
        };

        match (left, right) {
            (Some(_), Some(right)) => {
                // Swap in the in-order successor: leftmost of the right subtree.
                let mut victim = right;
                while let Some(next) = self.node(victim).left {
                    victim = next;
                }
                let root = self.detach_easy(victim);

                // Fix-up may have rotated `id`; copy its links as they are now.
                let (l, r, parent, height, count) = {
                    let n = self.node(id);
                    (n.left, n.right, n.parent, n.height, n.count)
                };
                {
                    let v = self.node_mut(victim);
                    v.left = l;
                    v.right = r;
                    v.parent = parent;
                    v.height = height;
                    v.count = count;
                }
                if let Some(l) = l {
                    self.node_mut(l).parent = Some(victim);
                }
                if let Some(r) = r {
                    self.node_mut(r).parent = Some(victim);
                }
                self.root = match parent {
                    Some(p) => {
                        self.replace_child(p, id, Some(victim));
                        root
                    }
                    None => Some(victim),
                };
            }
            _ => {
                self.root = self.detach_easy(id);
            }
        }

        self.nodes.remove(id.0).value
    }

    #[inline]
    fn node(&self, id: NodeId) -> &Node<T> {
        &self.nodes[id.0]
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        &mut self.nodes[id.0]
    }

    #[inline]
    fn height(&self, id: Option<NodeId>) -> u32 {
        id.map_or(0, |id| self.node(id).height)
    }

    #[inline]
    fn count(&self, id: Option<NodeId>) -> i64 {
        id.map_or(0, |id| self.node(id).count as i64)
    }

    fn update(&mut self, id: NodeId) {
        let (left, right) = {
            let n = self.node(id);
            (n.left, n.right)
        };
        let height = 1 + self.height(left).max(self.height(right));
        let count = 1 + self.count(left) + self.count(right);
        let n = self.node_mut(id);
        n.height = height;
        n.count = count as u32;
    }

    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: Option<NodeId>) {
        let p = self.node_mut(parent);
        if p.left == Some(old) {
            p.left = new;
        } else {
            p.right = new;
        }
    }

    fn rotate_left(&mut self, id: NodeId) -> NodeId {
        let Some(pivot) = self.node(id).right else {
            return id;
        };
        let inner = self.node(pivot).left;
        let parent = self.node(id).parent;

        if let Some(inner) = inner {
            self.node_mut(inner).parent = Some(id);
        }
        self.node_mut(id).right = inner;
        self.node_mut(id).parent = Some(pivot);
        self.node_mut(pivot).left = Some(id);
        self.node_mut(pivot).parent = parent;

        self.update(id);
        self.update(pivot);
        pivot
    }

    fn rotate_right(&mut self, id: NodeId) -> NodeId {
        let Some(pivot) = self.node(id).left else {
            return id;
        };
        let inner = self.node(pivot).right;
        let parent = self.node(id).parent;

        if let Some(inner) = inner {
            self.node_mut(inner).parent = Some(id);
        }
        self.node_mut(id).left = inner;
        self.node_mut(id).parent = Some(pivot);
        self.node_mut(pivot).right = Some(id);
        self.node_mut(pivot).parent = parent;

        self.update(id);
        self.update(pivot);
        pivot
    }

    /// Left subtree is two levels deeper.
    fn fix_left(&mut self, id: NodeId) -> NodeId {
        if let Some(left) = self.node(id).left {
            let l = self.node(left);
            if self.height(l.left) < self.height(l.right) {
                let new_left = self.rotate_left(left);
                self.node_mut(id).left = Some(new_left);
            }
        }
        self.rotate_right(id)
    }

    /// Right subtree is two levels deeper.
    fn fix_right(&mut self, id: NodeId) -> NodeId {
        if let Some(right) = self.node(id).right {
            let r = self.node(right);
            if self.height(r.right) < self.height(r.left) {
                let new_right = self.rotate_right(right);
                self.node_mut(id).right = Some(new_right);
            }
        }
        self.rotate_left(id)
    }

    /// Restores heights, counts and balance from `id` up to the root and
    /// returns the root.
    fn fix(&mut self, mut id: NodeId) -> NodeId {
        loop {
            self.update(id);
            let (left, right, parent) = {
                let n = self.node(id);
                (n.left, n.right, n.parent)
            };
            let (l, r) = (self.height(left), self.height(right));

            let subtree = if l == r + 2 {
                self.fix_left(id)
            } else if l + 2 == r {
                self.fix_right(id)
            } else {
                id
            };

            let Some(parent) = parent else {
                return subtree;
            };
            self.replace_child(parent, id, Some(subtree));
            id = parent;
        }
    }

    /// Unlinks a node with at most one child and returns the new root.
    fn detach_easy(&mut self, id: NodeId) -> Option<NodeId> {
        let (child, parent) = {
            let n = self.node(id);
            debug_assert!(n.left.is_none() || n.right.is_none());
            (n.left.or(n.right), n.parent)
        };

        if let Some(child) = child {
            self.node_mut(child).parent = parent;
        }
        let Some(parent) = parent else {
            return child;
        };
        self.replace_child(parent, id, child);
        Some(self.fix(parent))
    }
}

impl<T: Ord> AvlTree<T> {
    /// Inserts `value` and rebalances. Equal values are placed after the
    /// existing ones.
    pub fn insert(&mut self, value: T) -> NodeId {
        let id = NodeId(self.nodes.insert(Node::leaf(value)));
        let Some(mut cur) = self.root else {
            self.root = Some(id);
            return id;
        };

        loop {
            let go_left = self.nodes[id.0].value < self.nodes[cur.0].value;
            let next = if go_left {
                self.node(cur).left
            } else {
                self.node(cur).right
            };
            match next {
                Some(next) => cur = next,
                None => {
                    if go_left {
                        self.node_mut(cur).left = Some(id);
                    } else {
                        self.node_mut(cur).right = Some(id);
                    }
                    self.node_mut(id).parent = Some(cur);
                    break;
                }
            }
        }

        self.root = Some(self.fix(cur));
        id
    }

    /// First node whose value is `>= probe`.
    pub fn seek_ge(&self, probe: &T) -> Option<NodeId> {
        let mut found = None;
        let mut cur = self.root;
        while let Some(id) = cur {
            let n = self.node(id);
            if n.value < *probe {
                cur = n.right;
            } else {
                found = Some(id);
                cur = n.left;
            }
        }
        found
    }
}

impl<T> Index<NodeId> for AvlTree<T> {
    type Output = T;

    fn index(&self, id: NodeId) -> &T {
        &self.node(id).value
    }
}

/// In-order iterator returned by [`AvlTree::iter`].
pub struct Iter<'a, T> {
    tree: &'a AvlTree<T>,
    next: Option<NodeId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.tree.offset(id, 1);
        Some((id, &self.tree[id]))
    }
}
