//! Per-thread worker heap.
//!
//! A binary min-heap of [`HeapEntry`] stored across fixed-size chunks that are
//! allocated on the owning zone's NUMA node. Logical index `i` lives in chunk
//! `i / chunk_size` at offset `i % chunk_size`, so the usual `2i + 1` /
//! `2i + 2` child arithmetic works across chunk boundaries.
//!
//! ```text
//!   chunk 0            chunk 1            chunk 2 (allocated on demand)
//!   [ 0 1 2 3 ]  ──►   [ 4 5 6 7 ]  ──►   [ 8 . . . ]
//! ```
//!
//! The heap grows one chunk at a time and never shrinks. It has no internal
//! locking; the priority queue wraps each one in an even/odd lock.

use core::alloc::Layout;

use crate::numa::{AllocationPolicy, NumaAllocator, NumaBuffer};
use crate::Key;

/// A key/value pair as stored in worker heaps.
///
/// Entries order by key, then by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapEntry<V> {
    /// Priority; smaller is served first
    pub key: Key,
    /// Payload
    pub value: V,
}

impl<V> HeapEntry<V> {
    /// Creates an entry.
    #[inline]
    pub fn new(key: Key, value: V) -> Self {
        Self { key, value }
    }
}

impl<V> From<(Key, V)> for HeapEntry<V> {
    fn from((key, value): (Key, V)) -> Self {
        Self { key, value }
    }
}

impl<V> From<HeapEntry<V>> for (Key, V) {
    fn from(e: HeapEntry<V>) -> Self {
        (e.key, e.value)
    }
}

/// Chunked, NUMA-local binary min-heap.
pub struct WorkerHeap<V: Copy> {
    chunks: Vec<NumaBuffer<HeapEntry<V>>>,
    chunk_size: usize,
    len: usize,
    policy: AllocationPolicy,
    allocator: NumaAllocator,
}

impl<V: Copy + Ord> WorkerHeap<V> {
    /// Creates a heap with one chunk of `chunk_size` entries allocated
    /// according to `policy`.
    pub fn new(chunk_size: usize, policy: AllocationPolicy) -> crate::Result<Self> {
        let allocator = NumaAllocator::new();
        let first = allocator.buffer(chunk_size.max(1), policy)?;
        Ok(Self {
            chunks: vec![first],
            chunk_size: chunk_size.max(1),
            len: 0,
            policy,
            allocator,
        })
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the heap holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entries the allocated chunks can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_size
    }

    /// Number of allocated chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Smallest entry, if any.
    #[inline]
    pub fn peek(&self) -> Option<HeapEntry<V>> {
        (self.len > 0).then(|| self.get(0))
    }

    /// Inserts an entry, allocating a new chunk when full.
    pub fn push(&mut self, entry: HeapEntry<V>) {
        if self.len == self.capacity() {
            self.grow();
        }

        let mut i = self.len;
        self.len += 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            let p = self.get(parent);
            if p <= entry {
                break;
            }
            self.set(i, p);
            i = parent;
        }
        self.set(i, entry);
    }

    /// Removes and returns the smallest entry.
    pub fn pop(&mut self) -> Option<HeapEntry<V>> {
        if self.len == 0 {
            return None;
        }

        let min = self.get(0);
        self.len -= 1;
        if self.len == 0 {
            return Some(min);
        }

        let last = self.get(self.len);
        let mut i = 0;
        loop {
            let left = 2 * i + 1;
            if left >= self.len {
                break;
            }
            let right = left + 1;
            let mut child = left;
            let mut c = self.get(left);
            if right < self.len {
                let r = self.get(right);
                if r < c {
                    child = right;
                    c = r;
                }
            }
            if last <= c {
                break;
            }
            self.set(i, c);
            i = child;
        }
        self.set(i, last);

        Some(min)
    }

    /// Sum of all keys (wrapping).
    pub fn key_sum(&self) -> Key {
        self.iter().fold(0, |acc, e| acc.wrapping_add(e.key))
    }

    /// Entries in storage order.
    pub fn iter(&self) -> impl Iterator<Item = HeapEntry<V>> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    /// Returns `true` if every parent is not greater than its children.
    pub fn is_heap(&self) -> bool {
        (1..self.len).all(|i| self.get((i - 1) / 2) <= self.get(i))
    }

    fn grow(&mut self) {
        match self.allocator.buffer(self.chunk_size, self.policy) {
            Ok(chunk) => self.chunks.push(chunk),
            Err(_) => {
                let layout = Layout::array::<HeapEntry<V>>(self.chunk_size)
                    .unwrap_or_else(|_| Layout::new::<HeapEntry<V>>());
                std::alloc::handle_alloc_error(layout)
            }
        }
    }

    #[inline]
    fn slot(&self, i: usize) -> *mut HeapEntry<V> {
        debug_assert!(i < self.capacity());
        let chunk = &self.chunks[i / self.chunk_size];
        // SAFETY: offset < chunk_size, the chunk's element count
        unsafe { (chunk.as_ptr() as *mut HeapEntry<V>).add(i % self.chunk_size) }
    }

    #[inline]
    fn get(&self, i: usize) -> HeapEntry<V> {
        // SAFETY: callers only read indices < len, which were written
        unsafe { self.slot(i).read() }
    }

    #[inline]
    fn set(&mut self, i: usize, entry: HeapEntry<V>) {
        // SAFETY: i < capacity; &mut self is exclusive
        unsafe { self.slot(i).write(entry) }
    }
}

impl<V: Copy + Ord + core::fmt::Debug> core::fmt::Debug for WorkerHeap<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerHeap")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("min", &self.peek())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn heap(chunk: usize) -> WorkerHeap<u32> {
        WorkerHeap::new(chunk, AllocationPolicy::Local).unwrap()
    }

    #[test]
    fn test_push_pop_sorted() {
        let mut h = heap(16);
        for k in [5, 3, 9, 1, 7, 3] {
            h.push(HeapEntry::new(k, k as u32));
        }
        assert_eq!(h.len(), 6);
        assert_eq!(h.peek().map(|e| e.key), Some(1));

        let keys: Vec<Key> = std::iter::from_fn(|| h.pop()).map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 3, 3, 5, 7, 9]);
        assert!(h.pop().is_none());
    }

    #[test]
    fn test_grows_across_chunks_and_never_shrinks() {
        let mut h = heap(4);
        assert_eq!(h.capacity(), 4);

        for k in (0..37).rev() {
            h.push(HeapEntry::new(k, 0));
            assert!(h.is_heap());
        }
        assert_eq!(h.chunk_count(), 10);

        for expected in 0..37 {
            assert_eq!(h.pop().unwrap().key, expected);
        }
        assert!(h.is_empty());
        assert_eq!(h.capacity(), 40);
    }

    #[test]
    fn test_ties_break_on_value() {
        let mut h = heap(8);
        h.push(HeapEntry::new(4, 9));
        h.push(HeapEntry::new(4, 2));
        assert_eq!(h.pop(), Some(HeapEntry::new(4, 2)));
        assert_eq!(h.pop(), Some(HeapEntry::new(4, 9)));
    }

    #[test]
    fn test_key_sum_and_iter() {
        let mut h = heap(2);
        for k in [10, -3, 7] {
            h.push(HeapEntry::new(k, 0));
        }
        assert_eq!(h.key_sum(), 14);
        assert_eq!(h.iter().count(), 3);
        h.pop();
        assert_eq!(h.key_sum(), 17);
    }

    #[test]
    fn test_entry_conversions() {
        let e: HeapEntry<u8> = (3, 4).into();
        let (k, v): (Key, u8) = e.into();
        assert_eq!((k, v), (3, 4));
    }
}
