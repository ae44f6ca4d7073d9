//! LRU list operations with O(1) complexity.
//
// Doubly-linked list threaded through a slot arena: entries keep their slot
// index, so touch/remove need no key lookup. Freed slots are reused.

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: String,
    prev: usize,
    next: usize,
}

/// Access order of cache keys, most recently used at the head.
#[derive(Debug)]
pub struct LruList {
    slots: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl LruList {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Links `key` at the head and returns its slot.
    pub fn push_front(&mut self, key: String) -> usize {
        let node = Node {
            key,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = node;
                slot
            }
            None => {
                self.slots.push(node);
                self.slots.len() - 1
            }
        };
        self.link_front(slot);
        self.len += 1;
        slot
    }

    /// Moves a slot to the head.
    pub fn touch(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.link_front(slot);
    }

    /// Unlinks a slot and returns its key.
    pub fn remove(&mut self, slot: usize) -> String {
        self.unlink(slot);
        self.free.push(slot);
        self.len -= 1;
        std::mem::take(&mut self.slots[slot].key)
    }

    /// Least recently used key.
    pub fn peek_tail(&self) -> Option<&str> {
        (self.tail != NIL).then(|| self.slots[self.tail].key.as_str())
    }

    pub fn pop_tail(&mut self) -> Option<String> {
        if self.tail == NIL {
            return None;
        }
        Some(self.remove(self.tail))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let n = &self.slots[slot];
            (n.prev, n.next)
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }

        let n = &mut self.slots[slot];
        n.prev = NIL;
        n.next = NIL;
    }

    fn link_front(&mut self, slot: usize) {
        self.slots[slot].prev = NIL;
        self.slots[slot].next = self.head;
        if self.head == NIL {
            self.tail = slot;
        } else {
            self.slots[self.head].prev = slot;
        }
        self.head = slot;
    }
}

impl Default for LruList {
    fn default() -> Self {
        Self::new()
    }
}
