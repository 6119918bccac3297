//! Leader Set
//!
//! A lock-free sorted singly-linked list (Harris) holding, at any time, a
//! small number of the smallest entries of every worker. Delete-min is
//! Linden-style: it claims the first live node by tagging that node's own
//! `next`, and only swings the head past the claimed prefix once the prefix
//! is `max_offset` nodes long, so most delete-mins never contend with the
//! inserts that touch the head link.
//!
//! ```text
//!  head ─► [2]ᴰ ─► [3]ᴰ ─► [5] ─► [5]ᴹ ─► [8] ─► [9] ─► null
//!          └ deleted ┘     first   moving
//!                          live
//! ```
//!
//! Entries are ordered by `(key, value)`. An insert of a pair that is
//! already live fails; the caller decides what to do with the entry.
//!
//! # Reclamation
//!
//! Every operation runs under an epoch guard. The thread whose CAS unlinks a
//! run of marked nodes retires exactly that run; marked nodes are frozen, so
//! the run is well defined.

mod link;

pub use link::Tag;

use crossbeam_utils::CachePadded;

use crate::epoch::{Guard, Shared};
use crate::worker::HeapEntry;
use crate::Key;
use link::{alloc_node, Link, Marked};

/// Identifies the worker an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Owner {
    /// Zone index
    pub zone: u32,
    /// Worker index within the zone
    pub idx: u32,
}

impl Owner {
    /// Creates an owner id.
    pub fn new(zone: usize, idx: usize) -> Self {
        Self {
            zone: zone as u32,
            idx: idx as u32,
        }
    }
}

/// An entry removed from, or observed in, the leader set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderEntry<V> {
    /// Priority
    pub key: Key,
    /// Payload
    pub value: V,
    /// Worker that inserted it
    pub owner: Owner,
}

impl<V> LeaderEntry<V> {
    /// The key/value pair without the owner.
    pub fn entry(&self) -> HeapEntry<V>
    where
        V: Copy,
    {
        HeapEntry::new(self.key, self.value)
    }
}

/// Result of [`LeaderSet::insert_and_move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome<V> {
    /// The pair was already live; nothing changed.
    Duplicate,
    /// Inserted, and the owner's largest other entry was evicted.
    Moved {
        /// The evicted entry
        evicted: HeapEntry<V>,
        /// The owner's largest remaining entry other than the new one
        next_largest: Option<HeapEntry<V>>,
    },
    /// Inserted; the owner had no other live entry to evict.
    NothingToMove,
}

#[repr(align(8))]
pub(crate) struct Node<V> {
    key: Key,
    value: V,
    owner: Owner,
    next: Link<V>,
}

impl<V: Copy + Ord> Node<V> {
    #[inline]
    fn pair(&self) -> (Key, V) {
        (self.key, self.value)
    }

    #[inline]
    fn entry(&self) -> HeapEntry<V> {
        HeapEntry::new(self.key, self.value)
    }

    #[inline]
    fn leader_entry(&self) -> LeaderEntry<V> {
        LeaderEntry {
            key: self.key,
            value: self.value,
            owner: self.owner,
        }
    }
}

/// Lock-free sorted set of leader entries.
pub struct LeaderSet<V> {
    head: CachePadded<Link<V>>,
    max_offset: usize,
}

// SAFETY: nodes are shared through atomics and reclaimed through epochs
unsafe impl<V: Send + Sync> Send for LeaderSet<V> {}
unsafe impl<V: Send + Sync> Sync for LeaderSet<V> {}

impl<V: Copy + Ord + Send + Sync> LeaderSet<V> {
    /// Creates an empty set whose delete-min swings the head once
    /// `max_offset` nodes have been traversed.
    pub fn new(max_offset: usize) -> Self {
        Self {
            head: CachePadded::new(Link::null()),
            max_offset: max_offset.max(1),
        }
    }

    /// Head swing threshold.
    pub fn max_offset(&self) -> usize {
        self.max_offset
    }

    /// Finds adjacent `(left, right)` with `left < pair <= right`, both live,
    /// unlinking any marked run between them.
    ///
    /// `left` is returned as the link to CAS; `right` may be null (end).
    fn search<'g>(&'g self, pair: (Key, V), guard: &'g Guard<'_>) -> (&'g Link<V>, Shared<'g, Node<V>>) {
        'retry: loop {
            let mut left: &'g Link<V> = &self.head;
            let mut left_next = self.head.load(guard).ptr;
            let mut curr = left_next;

            // SAFETY (all derefs below): loaded under `guard`
            while let Some(node) = unsafe { Marked::live(curr).node() } {
                let next = node.next.load(guard);
                if !next.tag.is_live() {
                    curr = next.ptr;
                    continue;
                }
                if node.pair() >= pair {
                    break;
                }
                left = &node.next;
                left_next = next.ptr;
                curr = next.ptr;
            }
            let right = curr;

            if left_next != right {
                if left.swing(left_next, right, guard).is_err() {
                    continue 'retry;
                }
                // SAFETY: our CAS unlinked [left_next, right); the run is frozen
                unsafe { retire_run(left_next, right, guard) };
            }

            if let Some(node) = unsafe { Marked::live(right).node() } {
                if !node.next.load(guard).tag.is_live() {
                    continue 'retry;
                }
            }
            return (left, right);
        }
    }

    /// Inserts the node, returning it, or `None` if the pair is live.
    fn insert_node<'g>(
        &'g self,
        key: Key,
        value: V,
        owner: Owner,
        guard: &'g Guard<'_>,
    ) -> Option<Shared<'g, Node<V>>> {
        let mut new: Option<Shared<'g, Node<V>>> = None;
        loop {
            let (left, right) = self.search((key, value), guard);

            if let Some(node) = unsafe { Marked::live(right).node() } {
                if node.pair() == (key, value) {
                    if let Some(unpublished) = new {
                        // SAFETY: never published
                        drop(unsafe { unpublished.into_owned() });
                    }
                    return None;
                }
            }

            let node = *new.get_or_insert_with(|| {
                alloc_node(
                    Node {
                        key,
                        value,
                        owner,
                        next: Link::null(),
                    },
                    guard,
                )
            });
            // SAFETY: unpublished, exclusively ours
            unsafe { node.deref() }.next.init(right);

            if left.swing(right, node, guard).is_ok() {
                return Some(node);
            }
        }
    }

    /// Inserts `(key, value)` for `owner`. Returns `false` if the pair is
    /// already live.
    pub fn insert(&self, key: Key, value: V, owner: Owner, guard: &Guard<'_>) -> bool {
        self.insert_node(key, value, owner, guard).is_some()
    }

    /// Inserts `(key, value)` for `owner`, then evicts the owner's largest
    /// other live entry.
    pub fn insert_and_move(
        &self,
        key: Key,
        value: V,
        owner: Owner,
        guard: &Guard<'_>,
    ) -> MoveOutcome<V> {
        let Some(inserted) = self.insert_node(key, value, owner, guard) else {
            return MoveOutcome::Duplicate;
        };

        'rescan: loop {
            let mut victim: Option<(&Node<V>, Shared<'_, Node<V>>)> = None;
            let mut next_largest = None;

            let mut curr = self.head.load(guard).ptr;
            while let Some(node) = unsafe { Marked::live(curr).node() } {
                let next = node.next.load(guard);
                if next.tag.is_live() && node.owner == owner && curr != inserted {
                    next_largest = victim.map(|(v, _)| v.entry());
                    victim = Some((node, next.ptr));
                }
                curr = next.ptr;
            }

            let Some((node, mut expected)) = victim else {
                return MoveOutcome::NothingToMove;
            };

            loop {
                match node.next.claim(expected, Tag::Moving, guard) {
                    Ok(()) => {
                        let evicted = node.entry();
                        // Unlinks it; `node` may be freed from here on.
                        self.search(evicted.into(), guard);
                        return MoveOutcome::Moved {
                            evicted,
                            next_largest,
                        };
                    }
                    Err(seen) if seen.tag.is_live() => expected = seen.ptr,
                    Err(_) => continue 'rescan,
                }
            }
        }
    }

    /// Claims and returns the smallest live entry.
    pub fn delete_min(&self, guard: &Guard<'_>) -> Option<LeaderEntry<V>> {
        let observed = self.head.load(guard).ptr;
        let mut curr = observed;
        let mut offset = 0;

        while let Some(node) = unsafe { Marked::live(curr).node() } {
            offset += 1;
            let next = node.next.load(guard);
            if !next.tag.is_live() {
                curr = next.ptr;
                continue;
            }

            let prev = node.next.mark(Tag::Deleted, guard);
            if !prev.tag.is_live() {
                curr = prev.ptr;
                continue;
            }

            if offset >= self.max_offset
                && curr != observed
                && self.head.swing(observed, curr, guard).is_ok()
            {
                // SAFETY: our CAS unlinked [observed, curr); every node in it
                // was marked when we walked past it
                unsafe { retire_run(observed, curr, guard) };
            }
            return Some(node.leader_entry());
        }

        None
    }

    /// Iterates over live entries in order.
    pub fn iter<'g>(&'g self, guard: &'g Guard<'_>) -> Iter<'g, V> {
        Iter {
            curr: self.head.load(guard).ptr,
            guard,
        }
    }

    /// Number of live entries.
    pub fn len(&self, guard: &Guard<'_>) -> usize {
        self.iter(guard).count()
    }

    /// Returns `true` if no live entry exists.
    pub fn is_empty(&self, guard: &Guard<'_>) -> bool {
        self.iter(guard).next().is_none()
    }

    /// Sum of live keys (wrapping).
    pub fn key_sum(&self, guard: &Guard<'_>) -> Key {
        self.iter(guard).fold(0, |acc, e| acc.wrapping_add(e.key))
    }

    /// Number of adjacent live pairs out of `(key, value)` order.
    pub fn order_violations(&self, guard: &Guard<'_>) -> usize {
        let mut prev: Option<(Key, V)> = None;
        let mut violations = 0;
        for e in self.iter(guard) {
            if prev.is_some_and(|p| p > (e.key, e.value)) {
                violations += 1;
            }
            prev = Some((e.key, e.value));
        }
        violations
    }
}

/// Retires every node in `[from, to)`.
///
/// # Safety
///
/// The caller's CAS must have unlinked exactly this run, and every node in it
/// must be marked.
unsafe fn retire_run<V>(from: Shared<'_, Node<V>>, to: Shared<'_, Node<V>>, guard: &Guard<'_>) {
    let mut curr = from;
    while curr != to {
        let Some(node) = (unsafe { curr.as_ref() }) else {
            break;
        };
        let next = node.next.load(guard).ptr;
        unsafe { guard.defer_destroy(curr.as_raw() as *mut Node<V>) };
        curr = next;
    }
}

/// Iterator over live leader entries.
pub struct Iter<'g, V> {
    curr: Shared<'g, Node<V>>,
    guard: &'g Guard<'g>,
}

impl<V: Copy + Ord> Iterator for Iter<'_, V> {
    type Item = LeaderEntry<V>;

    fn next(&mut self) -> Option<LeaderEntry<V>> {
        loop {
            let node = unsafe { Marked::live(self.curr).node() }?;
            let next = node.next.load(self.guard);
            self.curr = next.ptr;
            if next.tag.is_live() {
                return Some(node.leader_entry());
            }
        }
    }
}

impl<V> Drop for LeaderSet<V> {
    fn drop(&mut self) {
        // Unlinked nodes belong to the collector; free what is still linked.
        let mut curr = self.head.raw();
        while !curr.is_null() {
            // SAFETY: &mut self; linked nodes are owned by the list
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next.raw();
        }
    }
}

impl<V> core::fmt::Debug for LeaderSet<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LeaderSet")
            .field("max_offset", &self.max_offset)
            .finish_non_exhaustive()
    }
}
