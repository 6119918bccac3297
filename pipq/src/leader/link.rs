//! Typed `next` links for leader-set nodes.
//!
//! A node's removal state lives in the two low bits of its *own* `next`
//! word. Once either bit is set the word never changes again, so a marked
//! node is frozen: nothing can be linked after it, and the only way it
//! leaves the list is a CAS on its unmarked predecessor.
//!
//! ```text
//!   bit 0  DELETED  set by delete-min (fetch_or, linearization point)
//!   bit 1  MOVING   set by an eviction (CAS from Live)
//! ```
//!
//! A delete-min that races with an eviction can leave both bits set
//! (`DeletedMoving`); the eviction won, the delete-min moves on.

use crate::epoch::{Atomic, Guard, Owned, Shared};
use crate::sync::atomic::Ordering;

use super::Node;

/// Removal state of a node, read from its own `next` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Tag {
    /// In the set
    Live = 0,
    /// Claimed by delete-min
    Deleted = 1,
    /// Claimed by an eviction
    Moving = 2,
    /// Eviction claimed it first, then a delete-min also tagged it
    DeletedMoving = 3,
}

impl Tag {
    #[inline]
    fn from_bits(bits: usize) -> Tag {
        match bits & 3 {
            0 => Tag::Live,
            1 => Tag::Deleted,
            2 => Tag::Moving,
            _ => Tag::DeletedMoving,
        }
    }

    /// Returns `true` for [`Tag::Live`].
    #[inline]
    pub fn is_live(self) -> bool {
        self == Tag::Live
    }
}

/// A loaded link value: untagged target plus the tag of the link's owner.
pub(crate) struct Marked<'g, V> {
    pub(crate) ptr: Shared<'g, Node<V>>,
    pub(crate) tag: Tag,
}

impl<V> Clone for Marked<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Marked<'_, V> {}

impl<'g, V> Marked<'g, V> {
    #[inline]
    pub(crate) fn live(ptr: Shared<'g, Node<V>>) -> Self {
        Self { ptr, tag: Tag::Live }
    }

    #[inline]
    fn from_shared(s: Shared<'g, Node<V>>) -> Self {
        Self {
            ptr: s.with_tag(0),
            tag: Tag::from_bits(s.tag()),
        }
    }

    #[inline]
    fn into_shared(self) -> Shared<'g, Node<V>> {
        self.ptr.with_tag(self.tag as usize)
    }

    /// Target node, `None` at the end of the list.
    ///
    /// # Safety
    ///
    /// The value must have been loaded under the guard that `'g` is bound to.
    #[inline]
    pub(crate) unsafe fn node(&self) -> Option<&'g Node<V>> {
        unsafe { self.ptr.as_ref() }
    }
}

/// The `next` field of a node, or the head link of the set.
pub(crate) struct Link<V> {
    inner: Atomic<Node<V>>,
}

impl<V> Link<V> {
    pub(crate) fn null() -> Self {
        Self {
            inner: Atomic::null(),
        }
    }

    #[inline]
    pub(crate) fn load<'g>(&self, guard: &'g Guard<'_>) -> Marked<'g, V> {
        Marked::from_shared(self.inner.load(Ordering::Acquire, guard))
    }

    /// Points an unpublished link at `target`.
    #[inline]
    pub(crate) fn init(&self, target: Shared<'_, Node<V>>) {
        self.inner.store(target.with_tag(0), Ordering::Relaxed);
    }

    /// Swings the link from `current` to `new`, both untagged.
    #[inline]
    pub(crate) fn swing<'g>(
        &self,
        current: Shared<'_, Node<V>>,
        new: Shared<'_, Node<V>>,
        guard: &'g Guard<'_>,
    ) -> Result<(), Marked<'g, V>> {
        self.inner
            .compare_exchange(
                current.with_tag(0),
                new.with_tag(0),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .map(|_| ())
            .map_err(Marked::from_shared)
    }

    /// Sets `tag` on a live link that still points at `expected`.
    #[inline]
    pub(crate) fn claim<'g>(
        &self,
        expected: Shared<'_, Node<V>>,
        tag: Tag,
        guard: &'g Guard<'_>,
    ) -> Result<(), Marked<'g, V>> {
        let current = Marked::live(expected.with_tag(0));
        let new = Marked {
            ptr: current.ptr,
            tag,
        };
        self.inner
            .compare_exchange(
                current.into_shared(),
                new.into_shared(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .map(|_| ())
            .map_err(Marked::from_shared)
    }

    /// Unconditionally ORs `tag` into the link, returning the previous value.
    #[inline]
    pub(crate) fn mark<'g>(&self, tag: Tag, guard: &'g Guard<'_>) -> Marked<'g, V> {
        Marked::from_shared(self.inner.fetch_or(tag as usize, Ordering::AcqRel, guard))
    }

    /// Raw untagged target for teardown.
    #[inline]
    pub(crate) fn raw(&self) -> *mut Node<V> {
        self.inner.load_raw(Ordering::Relaxed)
    }
}

/// Allocates a node ready for publication.
pub(crate) fn alloc_node<'g, V>(node: Node<V>, guard: &'g Guard<'_>) -> Shared<'g, Node<V>> {
    Owned::new(node).into_shared(guard)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_tag_bits() {
        assert_eq!(Tag::from_bits(0), Tag::Live);
        assert_eq!(Tag::from_bits(1), Tag::Deleted);
        assert_eq!(Tag::from_bits(2), Tag::Moving);
        assert_eq!(Tag::from_bits(3), Tag::DeletedMoving);
        assert_eq!(Tag::Deleted as usize | Tag::Moving as usize, Tag::DeletedMoving as usize);
        assert!(Tag::Live.is_live());
        assert!(!Tag::Moving.is_live());
    }
}
