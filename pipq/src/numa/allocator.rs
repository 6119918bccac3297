//! NUMA-Aware Memory Allocator
//!
//! Worker heap chunks and per-zone worker arrays are allocated here, bound
//! to the node of the zone that owns them. Large requests go through
//! `mmap` + `mbind`; small ones, and every request on a node the running
//! system does not have, fall back to the global allocator.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use std::alloc::{alloc, dealloc};

use super::{NodeId, NumaError, NumaTopology, Result};
use crate::config::CACHE_LINE_SIZE;

/// Requests at or above this size are page-mapped and node-bound.
#[cfg(all(target_os = "linux", feature = "numa"))]
const MMAP_THRESHOLD: usize = 4096;

/// Policy for memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationPolicy {
    /// Allocate on the calling thread's node
    #[default]
    Local,

    /// Allocate on a specific node
    OnNode(NodeId),

    /// Let the OS decide (first-touch policy)
    FirstTouch,
}

/// How a block was obtained, so it can be returned the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(all(target_os = "linux", feature = "numa")), allow(dead_code))]
enum Backing {
    Dangling,
    Heap,
    Mapped,
}

/// NUMA-aware memory allocator.
///
/// # Example
///
/// ```rust
/// use pipq::numa::{AllocationPolicy, NumaAllocator};
///
/// let allocator = NumaAllocator::new();
/// let buffer = allocator.buffer::<u64>(1024, AllocationPolicy::Local).unwrap();
/// assert_eq!(buffer.count(), 1024);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct NumaAllocator {
    topology: &'static NumaTopology,
}

impl NumaAllocator {
    /// Creates an allocator over the system topology.
    pub fn new() -> Self {
        Self {
            topology: NumaTopology::get(),
        }
    }

    /// Allocates uninitialized room for `count` values of `T`.
    pub fn buffer<T>(&self, count: usize, policy: AllocationPolicy) -> Result<NumaBuffer<T>> {
        let layout = Self::layout_for::<T>(count)?;
        let node = self.resolve_node(policy);

        if layout.size() == 0 {
            return Ok(NumaBuffer {
                ptr: NonNull::dangling(),
                count,
                node,
                backing: Backing::Dangling,
                layout,
            });
        }

        let (ptr, backing) = self.allocate_on_node(layout, node, policy)?;
        Ok(NumaBuffer {
            ptr: ptr.cast(),
            count,
            node,
            backing,
            layout,
        })
    }

    fn layout_for<T>(count: usize) -> Result<Layout> {
        let size = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(NumaError::AllocationFailed)?;
        let align = mem::align_of::<T>().max(CACHE_LINE_SIZE);
        Layout::from_size_align(size, align).map_err(|_| NumaError::AllocationFailed)
    }

    /// Resolves a policy to a specific node.
    fn resolve_node(&self, policy: AllocationPolicy) -> NodeId {
        match policy {
            AllocationPolicy::Local => self.topology.current_node(),
            AllocationPolicy::OnNode(node) => node,
            AllocationPolicy::FirstTouch => self.topology.current_node(),
        }
    }

    fn allocate_on_node(
        &self,
        layout: Layout,
        node: NodeId,
        policy: AllocationPolicy,
    ) -> Result<(NonNull<u8>, Backing)> {
        let bind = policy != AllocationPolicy::FirstTouch
            && self.topology.is_numa_available()
            && self.topology.node(node.0).is_some();

        #[cfg(all(target_os = "linux", feature = "numa"))]
        if bind && layout.size() >= MMAP_THRESHOLD && layout.align() <= page_size() {
            return Self::allocate_mapped(layout, node).map(|p| (p, Backing::Mapped));
        }

        #[cfg(not(all(target_os = "linux", feature = "numa")))]
        let _ = (bind, node);

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr)
            .map(|p| (p, Backing::Heap))
            .ok_or(NumaError::AllocationFailed)
    }

    /// Maps anonymous memory and binds it to `node` before the first touch.
    #[cfg(all(target_os = "linux", feature = "numa"))]
    fn allocate_mapped(layout: Layout, node: NodeId) -> Result<NonNull<u8>> {
        use crate::config::MAX_NUMA_NODES;

        const MPOL_BIND: libc::c_int = 2;
        const BITS: usize = mem::size_of::<libc::c_ulong>() * 8;

        // SAFETY: anonymous private mapping, no file descriptor involved
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                layout.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(NumaError::AllocationFailed);
        }

        let mut nodemask = [0 as libc::c_ulong; MAX_NUMA_NODES / BITS + 1];
        let idx = node.0 as usize;
        if idx < MAX_NUMA_NODES {
            nodemask[idx / BITS] = 1 << (idx % BITS);
            // Failure leaves first-touch placement, which is still correct.
            // SAFETY: ptr/len describe the mapping created above
            unsafe {
                libc::syscall(
                    libc::SYS_mbind,
                    ptr,
                    layout.size(),
                    MPOL_BIND,
                    nodemask.as_ptr(),
                    (MAX_NUMA_NODES + 1) as libc::c_ulong,
                    0 as libc::c_uint,
                );
            }
        }

        // Fault every page in now so placement happens at initialization.
        let page = page_size();
        let base = ptr as *mut u8;
        for offset in (0..layout.size()).step_by(page) {
            // SAFETY: offset is inside the mapping
            unsafe { base.add(offset).write_volatile(0) };
        }

        NonNull::new(base).ok_or(NumaError::AllocationFailed)
    }
}

impl Default for NumaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(target_os = "linux", feature = "numa"))]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        MMAP_THRESHOLD
    }
}

/// An uninitialized, node-bound allocation of `count` values of `T`.
///
/// The buffer never runs destructors for its contents.
pub struct NumaBuffer<T> {
    ptr: NonNull<T>,
    count: usize,
    node: NodeId,
    backing: Backing,
    layout: Layout,
}

impl<T> NumaBuffer<T> {
    /// Returns a pointer to the buffer.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    /// Returns a mutable pointer to the buffer.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Returns the number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the NUMA node.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns whether the memory was page-mapped and node-bound.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.backing == Backing::Mapped
    }
}

impl<T> Drop for NumaBuffer<T> {
    fn drop(&mut self) {
        match self.backing {
            Backing::Dangling => {}
            // SAFETY: allocated with this layout by the global allocator
            Backing::Heap => unsafe { dealloc(self.ptr.as_ptr().cast(), self.layout) },
            #[cfg(all(target_os = "linux", feature = "numa"))]
            Backing::Mapped => unsafe {
                // SAFETY: ptr/len describe a live mapping we own
                libc::munmap(self.ptr.as_ptr().cast(), self.layout.size());
            },
            #[cfg(not(all(target_os = "linux", feature = "numa")))]
            Backing::Mapped => {}
        }
    }
}

// SAFETY: NumaBuffer owns its memory
unsafe impl<T: Send> Send for NumaBuffer<T> {}
unsafe impl<T: Sync> Sync for NumaBuffer<T> {}

/// A fully initialized, node-bound slice that drops its elements.
///
/// Used for the per-zone worker arrays.
pub struct NumaSlice<T> {
    buffer: NumaBuffer<T>,
    _marker: PhantomData<T>,
}

impl<T> NumaSlice<T> {
    /// Allocates `count` elements on `node`, initializing element `i` with
    /// `init(i)`.
    pub fn from_fn(
        count: usize,
        policy: AllocationPolicy,
        mut init: impl FnMut(usize) -> T,
    ) -> Result<Self> {
        Self::try_from_fn(count, policy, |i| Ok::<T, NumaError>(init(i)))
    }

    /// Like [`from_fn`](Self::from_fn), stopping at the first failed
    /// initialization. Elements built so far are dropped.
    pub fn try_from_fn<E: From<NumaError>>(
        count: usize,
        policy: AllocationPolicy,
        mut init: impl FnMut(usize) -> core::result::Result<T, E>,
    ) -> core::result::Result<Self, E> {
        let mut buffer = NumaAllocator::new().buffer::<T>(count, policy)?;

        // Drops whatever was written so far on error or panic.
        struct Partial<T> {
            base: *mut T,
            written: usize,
        }
        impl<T> Drop for Partial<T> {
            fn drop(&mut self) {
                // SAFETY: the first `written` slots are initialized
                unsafe {
                    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.base, self.written))
                };
            }
        }

        let mut partial = Partial {
            base: buffer.as_mut_ptr(),
            written: 0,
        };
        for i in 0..count {
            let value = init(i)?;
            // SAFETY: i < count, slot is uninitialized
            unsafe { partial.base.add(i).write(value) };
            partial.written += 1;
        }
        mem::forget(partial);

        Ok(Self {
            buffer,
            _marker: PhantomData,
        })
    }

    /// Returns the node the elements live on.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.buffer.node()
    }
}

impl<T> Deref for NumaSlice<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        // SAFETY: every element was initialized in from_fn
        unsafe { core::slice::from_raw_parts(self.buffer.as_ptr(), self.buffer.count()) }
    }
}

impl<T> DerefMut for NumaSlice<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: every element was initialized in from_fn; &mut self is exclusive
        unsafe { core::slice::from_raw_parts_mut(self.buffer.as_mut_ptr(), self.buffer.count()) }
    }
}

impl<T> Drop for NumaSlice<T> {
    fn drop(&mut self) {
        // SAFETY: elements are initialized and dropped exactly once
        unsafe { ptr::drop_in_place(&mut **self as *mut [T]) };
    }
}

// SAFETY: NumaSlice owns its elements
unsafe impl<T: Send> Send for NumaSlice<T> {}
unsafe impl<T: Sync> Sync for NumaSlice<T> {}

impl<T: core::fmt::Debug> core::fmt::Debug for NumaSlice<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::config::MAX_NUMA_NODES;
    use std::rc::Rc;

    #[test]
    fn test_buffer_small_and_large() {
        let allocator = NumaAllocator::new();

        let small = allocator.buffer::<u64>(8, AllocationPolicy::Local).unwrap();
        assert_eq!(small.count(), 8);
        assert_eq!(small.as_ptr() as usize % CACHE_LINE_SIZE, 0);

        let mut large = allocator
            .buffer::<u64>(1 << 16, AllocationPolicy::OnNode(NodeId(0)))
            .unwrap();
        unsafe {
            large.as_mut_ptr().write(7);
            large.as_mut_ptr().add((1 << 16) - 1).write(9);
            assert_eq!(*large.as_ptr(), 7);
        }
    }

    #[test]
    fn test_zero_size_buffer() {
        let allocator = NumaAllocator::new();
        let buffer = allocator.buffer::<u64>(0, AllocationPolicy::Local).unwrap();
        assert_eq!(buffer.count(), 0);
        assert!(!buffer.is_bound());
    }

    #[test]
    fn test_unknown_node_falls_back() {
        let allocator = NumaAllocator::new();
        let buffer = allocator
            .buffer::<u64>(4096, AllocationPolicy::OnNode(NodeId(MAX_NUMA_NODES as u32 - 1)))
            .unwrap();
        assert_eq!(buffer.count(), 4096);
    }

    #[test]
    fn test_overflowing_request() {
        let allocator = NumaAllocator::new();
        assert!(allocator
            .buffer::<u64>(usize::MAX, AllocationPolicy::Local)
            .is_err());
    }

    #[test]
    fn test_numa_slice_init_and_drop() {
        let marker = Rc::new(());
        {
            let slice = NumaSlice::from_fn(5, AllocationPolicy::Local, |i| (i, marker.clone()))
                .unwrap();
            assert_eq!(slice.len(), 5);
            assert_eq!(slice[3].0, 3);
            assert_eq!(Rc::strong_count(&marker), 6);
        }
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_numa_slice_failed_init_drops_prefix() {
        let marker = Rc::new(());
        let result = NumaSlice::try_from_fn(4, AllocationPolicy::Local, |i| {
            if i == 2 {
                Err(NumaError::AllocationFailed)
            } else {
                Ok(marker.clone())
            }
        });
        assert_eq!(result.err(), Some(NumaError::AllocationFailed));
        assert_eq!(Rc::strong_count(&marker), 1);
    }
}
