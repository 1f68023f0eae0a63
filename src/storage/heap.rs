//! Expiry Heap
//!
//! An array-backed binary min-heap of expiration timestamps. Items are
//! addressed by their array position rather than by key, so every owner
//! has to know where its item currently sits.
//!
//! Each structural operation takes an `on_move(owner, position)` callback
//! and invokes it for every item it places, including the final slot of
//! the item being repaired. Owners store that position and hand it back to
//! [`ExpiryHeap::update`] / [`ExpiryHeap::remove`] later.

/// One scheduled expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapItem<K> {
    /// Absolute expiration time in milliseconds.
    pub expires_at: u64,
    /// Back-reference to whatever owns this item.
    pub owner: K,
}

/// Binary min-heap ordered by `expires_at`.
#[derive(Debug, Clone)]
pub struct ExpiryHeap<K> {
    items: Vec<HeapItem<K>>,
}

impl<K> Default for ExpiryHeap<K> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<K: Copy> ExpiryHeap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The earliest expiration, if any.
    #[inline]
    pub fn peek(&self) -> Option<&HeapItem<K>> {
        self.items.first()
    }

    #[inline]
    pub fn get(&self, pos: usize) -> Option<&HeapItem<K>> {
        self.items.get(pos)
    }

    /// Schedules a new item and returns the position it settled at.
    pub fn push(
        &mut self,
        expires_at: u64,
        owner: K,
        mut on_move: impl FnMut(K, usize),
    ) -> usize {
        self.items.push(HeapItem { expires_at, owner });
        self.sift_up(self.items.len() - 1, &mut on_move)
    }

    /// Changes the timestamp at `pos` and restores heap order.
    pub fn set(&mut self, pos: usize, expires_at: u64, on_move: impl FnMut(K, usize)) {
        if let Some(item) = self.items.get_mut(pos) {
            item.expires_at = expires_at;
            self.update(pos, on_move);
        }
    }

    /// Restores heap order after the item at `pos` changed.
    pub fn update(&mut self, pos: usize, mut on_move: impl FnMut(K, usize)) {
        if pos >= self.items.len() {
            return;
        }
        let pos = self.sift_down(pos, &mut on_move);
        self.sift_up(pos, &mut on_move);
    }

    /// Removes the item at `pos`. The last item fills the hole.
    pub fn remove(&mut self, pos: usize, mut on_move: impl FnMut(K, usize)) -> Option<HeapItem<K>> {
        if pos >= self.items.len() {
            return None;
        }
        let removed = self.items.swap_remove(pos);
        if pos < self.items.len() {
            self.update(pos, &mut on_move);
        }
        Some(removed)
    }

    /// Removes the earliest item.
    pub fn pop(&mut self, on_move: impl FnMut(K, usize)) -> Option<HeapItem<K>> {
        self.remove(0, on_move)
    }

    fn sift_up(&mut self, mut pos: usize, on_move: &mut impl FnMut(K, usize)) -> usize {
        let item = self.items[pos];
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.items[parent].expires_at <= item.expires_at {
                break;
            }
            self.items[pos] = self.items[parent];
            on_move(self.items[pos].owner, pos);
            pos = parent;
        }
        self.items[pos] = item;
        on_move(item.owner, pos);
        pos
    }

    fn sift_down(&mut self, mut pos: usize, on_move: &mut impl FnMut(K, usize)) -> usize {
        let item = self.items[pos];
        let len = self.items.len();
        loop {
            let left = pos * 2 + 1;
            let right = left + 1;
            let mut smallest = pos;
            let mut min = item.expires_at;
            if left < len && self.items[left].expires_at < min {
                smallest = left;
                min = self.items[left].expires_at;
            }
            if right < len && self.items[right].expires_at < min {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.items[pos] = self.items[smallest];
            on_move(self.items[pos].owner, pos);
            pos = smallest;
        }
        self.items[pos] = item;
        on_move(item.owner, pos);
        pos
    }
}
