//! Doubly-linked list of values with tail eviction
//!
//! The most recently added value is the head and the oldest is the tail.
//! `next` links point toward the head, `prev` links toward the tail, so a
//! walk from the tail along `next` visits values in insertion order.
//!
//! Nodes live in a slab owned by the list. A [`NodeHandle`] carries the slot
//! generation, so a handle to a removed node never addresses a reused slot.

/// Opaque reference to a node returned by [`LinkedList::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    next: Option<usize>,
    prev: Option<usize>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    node: Option<Node<T>>,
}

#[derive(Debug)]
pub struct LinkedList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> LinkedList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link `value` in as the new head. O(1).
    pub fn add(&mut self, value: T) -> NodeHandle {
        let node = Node {
            value,
            next: None,
            prev: self.head,
        };
        let index = self.alloc(node);

        match self.head {
            Some(old_head) => {
                if let Some(old) = self.node_mut(old_head) {
                    old.next = Some(index);
                }
            }
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;

        NodeHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Unlink the node behind `handle`. Returns `None` for stale handles.
    pub fn remove(&mut self, handle: NodeHandle) -> Option<T> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let (next, prev) = {
            let node = slot.node.as_ref()?;
            (node.next, node.prev)
        };

        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.head = prev,
        }
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.tail = next,
        }

        self.len -= 1;
        self.release(handle.index)
    }

    /// Visit values head → tail. Returning `false` from `visitor` stops the walk.
    pub fn iterate<F>(&self, mut visitor: F)
    where
        F: FnMut(&T) -> bool,
    {
        for value in self.iter() {
            if !visitor(value) {
                break;
            }
        }
    }

    /// Visit values tail → head. Returning `false` from `visitor` stops the walk.
    pub fn iterate_reverse<F>(&self, mut visitor: F)
    where
        F: FnMut(&T) -> bool,
    {
        for value in self.iter().rev() {
            if !visitor(value) {
                break;
            }
        }
    }

    /// Walk from the tail toward the head, evicting every node for which
    /// `keep` returns `false`. The first node for which `keep` returns `true`
    /// becomes the new tail and the walk stops there.
    ///
    /// Each evicted value is handed to `on_evicted` exactly once, oldest
    /// first. Returns the number of evicted values.
    pub fn evict_from_tail_while<P, E>(&mut self, mut keep: P, mut on_evicted: E) -> usize
    where
        P: FnMut(&T) -> bool,
        E: FnMut(T),
    {
        let mut evicted = 0;

        while let Some(index) = self.tail {
            let Some(node) = self.node(index) else {
                break;
            };
            if keep(&node.value) {
                break;
            }

            let next = node.next;
            self.tail = next;
            match next {
                Some(n) => {
                    if let Some(newer) = self.node_mut(n) {
                        newer.prev = None;
                    }
                }
                None => self.head = None,
            }
            self.len -= 1;

            if let Some(value) = self.release(index) {
                on_evicted(value);
                evicted += 1;
            }
        }

        evicted
    }

    /// Drop every node. Outstanding handles become stale.
    pub fn clear(&mut self) {
        for index in 0..self.slots.len() {
            if self.slots[index].node.is_some() {
                self.release(index);
            }
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Iterate head → tail; `.rev()` walks tail → head.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            front: self.head,
            back: self.tail,
            remaining: self.len,
        }
    }

    fn node(&self, index: usize) -> Option<&Node<T>> {
        self.slots.get(index).and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut Node<T>> {
        self.slots.get_mut(index).and_then(|slot| slot.node.as_mut())
    }

    fn alloc(&mut self, node: Node<T>) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize) -> Option<T> {
        let slot = self.slots.get_mut(index)?;
        let node = slot.node.take()?;
        slot.generation += 1;
        self.free.push(index);
        Some(node.value)
    }
}

impl<T: Clone> LinkedList<T> {
    /// Head-to-tail snapshot.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> Default for LinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T> {
    list: &'a LinkedList<T>,
    front: Option<usize>,
    back: Option<usize>,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.list.node(self.front?)?;
        self.front = node.prev;
        self.remaining -= 1;
        Some(&node.value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.list.node(self.back?)?;
        self.back = node.next;
        self.remaining -= 1;
        Some(&node.value)
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
