//! Idle List
//!
//! Orders open connections by last activity. Links are stored in a side
//! table indexed by connection slot, so moving a connection to the tail,
//! unlinking it, and finding the least recently active one are all O(1).
//!
//! ```text
//! head (oldest)                                    tail (newest)
//!   ┌───┐      ┌───┐      ┌───┐      ┌───┐
//!   │ 7 │ ───► │ 2 │ ───► │ 9 │ ───► │ 4 │
//!   └───┘ ◄─── └───┘ ◄─── └───┘ ◄─── └───┘
//! ```

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

/// Doubly linked list of connection slots.
#[derive(Debug, Default)]
pub struct IdleList {
    links: Vec<Link>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl IdleList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.links.get(slot).is_some_and(|l| l.linked)
    }

    /// Least recently active slot.
    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    /// Appends `slot` at the tail. Does nothing if it is already linked.
    pub fn push_back(&mut self, slot: usize) {
        if self.contains(slot) {
            return;
        }
        if slot >= self.links.len() {
            self.links.resize(slot + 1, Link::default());
        }

        self.links[slot] = Link {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => self.links[tail].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
    }

    /// Unlinks `slot`. Returns false if it was not in the list.
    pub fn remove(&mut self, slot: usize) -> bool {
        if !self.contains(slot) {
            return false;
        }
        let Link { prev, next, .. } = self.links[slot];

        match prev {
            Some(p) => self.links[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n].prev = prev,
            None => self.tail = prev,
        }

        self.links[slot] = Link::default();
        self.len -= 1;
        true
    }

    /// Marks `slot` as most recently active.
    pub fn touch(&mut self, slot: usize) {
        if self.tail == Some(slot) {
            return;
        }
        self.remove(slot);
        self.push_back(slot);
    }

    /// Slots from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, move |&slot| self.links[slot].next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(list: &IdleList) -> Vec<usize> {
        list.iter().collect()
    }

    #[test]
    fn test_push_back_order() {
        let mut list = IdleList::new();
        assert!(list.is_empty());
        assert_eq!(list.front(), None);

        for slot in [3, 0, 7] {
            list.push_back(slot);
        }
        assert_eq!(order(&list), vec![3, 0, 7]);
        assert_eq!(list.front(), Some(3));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_push_back_twice_is_noop() {
        let mut list = IdleList::new();
        list.push_back(1);
        list.push_back(2);
        list.push_back(1);
        assert_eq!(order(&list), vec![1, 2]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_touch_moves_to_tail() {
        let mut list = IdleList::new();
        for slot in 0..4 {
            list.push_back(slot);
        }
        list.touch(0);
        assert_eq!(order(&list), vec![1, 2, 3, 0]);
        list.touch(2);
        assert_eq!(order(&list), vec![1, 3, 0, 2]);
        list.touch(2);
        assert_eq!(order(&list), vec![1, 3, 0, 2]);
        assert_eq!(list.front(), Some(1));
    }

    #[test]
    fn test_remove_head_middle_tail() {
        let mut list = IdleList::new();
        for slot in 0..5 {
            list.push_back(slot);
        }
        assert!(list.remove(0));
        assert!(list.remove(2));
        assert!(list.remove(4));
        assert!(!list.remove(4));
        assert_eq!(order(&list), vec![1, 3]);
        assert_eq!(list.front(), Some(1));

        assert!(list.remove(1));
        assert!(list.remove(3));
        assert!(list.is_empty());
        assert_eq!(list.front(), None);
    }

    #[test]
    fn test_removed_slot_never_reappears() {
        let mut list = IdleList::new();
        list.push_back(0);
        list.push_back(1);
        list.remove(0);

        // Touching activity on other slots must not resurrect slot 0.
        list.touch(1);
        assert!(!list.contains(0));
        assert_eq!(order(&list), vec![1]);
    }

    #[test]
    fn test_evict_from_head() {
        let mut list = IdleList::new();
        for slot in 0..3 {
            list.push_back(slot);
        }
        list.touch(0);

        let mut evicted = Vec::new();
        while let Some(slot) = list.front() {
            evicted.push(slot);
            list.remove(slot);
        }
        assert_eq!(evicted, vec![1, 2, 0]);
    }
}
