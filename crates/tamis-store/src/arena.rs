use std::sync::Arc;

/// Sentinel value indicating "no node" (null pointer equivalent).
pub const NIL: u32 = u32::MAX;

/// A node in the arena-allocated doubly-linked list.
pub struct Node<I> {
    pub key: String,
    pub item: Arc<I>,
    /// Size charged when the node was inserted.
    pub size: usize,
    pub prev: u32,
    pub next: u32,
}

impl<I> Node<I> {
    pub fn new(key: String, item: Arc<I>, size: usize) -> Self {
        Self {
            key,
            item,
            size,
            prev: NIL,
            next: NIL,
        }
    }
}

/// Arena-allocated doubly-linked list.
///
/// Nodes are stored in a `Vec<Option<Node>>`. Indices (`u32`) serve as pointers.
/// A free-list tracks reclaimed slots; the slot vector grows on demand because
/// the owning store is bounded by bytes, not by entry count.
pub struct Arena<I> {
    slots: Vec<Option<Node<I>>>,
    free_list: Vec<u32>,
    pub head: u32,
    pub tail: u32,
    len: usize,
}

impl<I> Arena<I> {
    /// Create an empty arena with room for `capacity` nodes before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Number of active (occupied) nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get a reference to the node at `index`.
    #[inline]
    pub fn get(&self, index: u32) -> Option<&Node<I>> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    /// Get a mutable reference to the node at `index`.
    #[inline]
    pub fn get_mut(&mut self, index: u32) -> Option<&mut Node<I>> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    fn allocate(&mut self) -> u32 {
        match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn set_prev(&mut self, index: u32, prev: u32) {
        if let Some(node) = self.get_mut(index) {
            node.prev = prev;
        }
    }

    fn set_next(&mut self, index: u32, next: u32) {
        if let Some(node) = self.get_mut(index) {
            node.next = next;
        }
    }

    /// Insert a node at the head of the list and return its index.
    pub fn push_head(&mut self, mut node: Node<I>) -> u32 {
        let index = self.allocate();

        node.prev = NIL;
        node.next = self.head;
        self.slots[index as usize] = Some(node);

        if self.head != NIL {
            self.set_prev(self.head, index);
        }

        self.head = index;

        if self.tail == NIL {
            self.tail = index;
        }

        self.len += 1;
        index
    }

    /// Remove a node from the list and return it. The slot is reclaimed.
    pub fn remove(&mut self, index: u32) -> Option<Node<I>> {
        let node = self.slots.get_mut(index as usize)?.take()?;

        if node.prev != NIL {
            self.set_next(node.prev, node.next);
        } else {
            // Was head
            self.head = node.next;
        }

        if node.next != NIL {
            self.set_prev(node.next, node.prev);
        } else {
            // Was tail
            self.tail = node.prev;
        }

        self.free_list.push(index);
        self.len -= 1;
        Some(node)
    }

    /// Move an existing node to the head of the list.
    pub fn move_to_head(&mut self, index: u32) {
        if self.head == index {
            return;
        }

        let (prev, next) = match self.get(index) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        // Unlink from current position
        if prev != NIL {
            self.set_next(prev, next);
        }

        if next != NIL {
            self.set_prev(next, prev);
        } else {
            // Was tail
            self.tail = prev;
        }

        // Link at head
        let old_head = self.head;
        if let Some(node) = self.get_mut(index) {
            node.prev = NIL;
            node.next = old_head;
        }

        if old_head != NIL {
            self.set_prev(old_head, index);
        }

        self.head = index;
    }

    /// Remove the tail node and return it.
    pub fn pop_tail(&mut self) -> Option<(u32, Node<I>)> {
        if self.tail == NIL {
            return None;
        }
        let index = self.tail;
        let node = self.remove(index)?;
        Some((index, node))
    }

    /// Indices of all occupied nodes, head to tail.
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while cursor != NIL {
            out.push(cursor);
            cursor = self.get(cursor).map_or(NIL, |n| n.next);
        }
        out
    }

    /// Drop every node and reset the list.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_list.clear();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }
}
