//! Fiber stacks and the allocators that provide them.

use core::ptr::NonNull;
use portable_atomic::{AtomicUsize, Ordering};
use std::alloc::{alloc, dealloc, Layout};
use std::sync::Arc;

/// Smallest usable stack a fiber gets, whatever the caller asked for.
///
/// Unwinding a termination signal through a fiber needs a few pages of its own.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

const STACK_ALIGN: usize = 16;

/// A raw stack region handed out by a [`StackAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct StackMemory {
    /// Lowest address of the mapping, guard area included.
    pub base: NonNull<u8>,
    /// Total length of the mapping in bytes.
    pub len: usize,
    /// Bytes at `base` that are not usable (guard page).
    pub guard: usize,
}

/// Pluggable source of fiber stack memory.
pub trait StackAllocator: Send + Sync {
    /// Reserve a stack with at least `size` usable bytes.
    ///
    /// Returns `None` when the memory cannot be provided.
    fn allocate(&self, size: usize) -> Option<StackMemory>;

    /// Give back a region obtained from [`StackAllocator::allocate`].
    ///
    /// # Safety
    ///
    /// `memory` must come from this allocator and must not be used afterwards.
    unsafe fn deallocate(&self, memory: StackMemory);
}

/// Byte and object counters shared by all stacks of one manager.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    reserved: AtomicUsize,
    stacks: AtomicUsize,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently reserved for stacks, guard pages included.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Stacks currently alive.
    pub fn live_stacks(&self) -> usize {
        self.stacks.load(Ordering::Relaxed)
    }
}

/// A fiber stack. The memory is returned to its allocator on drop.
pub struct Stack {
    memory: StackMemory,
    allocator: Arc<dyn StackAllocator>,
    counters: Arc<MemoryCounters>,
}

// The stack is only ever touched by the fiber that runs on it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Reserve a stack of at least `size` usable bytes.
    pub fn new(
        allocator: Arc<dyn StackAllocator>,
        counters: Arc<MemoryCounters>,
        size: usize,
    ) -> Option<Self> {
        let memory = allocator.allocate(size.max(MIN_STACK_SIZE))?;
        counters.reserved.fetch_add(memory.len, Ordering::Relaxed);
        counters.stacks.fetch_add(1, Ordering::Relaxed);
        Some(Self {
            memory,
            allocator,
            counters,
        })
    }

    /// Highest usable address, aligned for the initial frame.
    pub fn top(&self) -> *mut u8 {
        let end = self.memory.base.as_ptr() as usize + self.memory.len;
        (end & !(STACK_ALIGN - 1)) as *mut u8
    }

    /// Usable bytes between the guard area and [`Stack::top`].
    pub fn usable_size(&self) -> usize {
        self.top() as usize - self.memory.base.as_ptr() as usize - self.memory.guard
    }

    /// Total bytes reserved, guard area included.
    pub fn reserved_size(&self) -> usize {
        self.memory.len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.counters
            .reserved
            .fetch_sub(self.memory.len, Ordering::Relaxed);
        self.counters.stacks.fetch_sub(1, Ordering::Relaxed);
        unsafe { self.allocator.deallocate(self.memory) };
    }
}

/// Stacks from the global allocator, without a guard page.
#[derive(Debug, Default)]
pub struct HeapStackAllocator;

impl StackAllocator for HeapStackAllocator {
    fn allocate(&self, size: usize) -> Option<StackMemory> {
        let len = size.checked_add(STACK_ALIGN - 1)? & !(STACK_ALIGN - 1);
        let layout = Layout::from_size_align(len, STACK_ALIGN).ok()?;
        let base = NonNull::new(unsafe { alloc(layout) })?;
        Some(StackMemory {
            base,
            len,
            guard: 0,
        })
    }

    unsafe fn deallocate(&self, memory: StackMemory) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(memory.len, STACK_ALIGN);
            dealloc(memory.base.as_ptr(), layout);
        }
    }
}

/// Stacks mapped with `mmap`, with one inaccessible guard page at the low end.
#[cfg(unix)]
#[derive(Debug)]
pub struct MmapStackAllocator {
    page_size: usize,
}

#[cfg(unix)]
impl MmapStackAllocator {
    pub fn new() -> Self {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page > 0 { page as usize } else { 4096 };
        Self { page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(unix)]
impl Default for MmapStackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl StackAllocator for MmapStackAllocator {
    fn allocate(&self, size: usize) -> Option<StackMemory> {
        let usable = size.checked_add(self.page_size - 1)? & !(self.page_size - 1);
        let len = usable.checked_add(self.page_size)?;
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return None;
            }
            if libc::mprotect(ptr, self.page_size, libc::PROT_NONE) != 0 {
                libc::munmap(ptr, len);
                return None;
            }
            Some(StackMemory {
                base: NonNull::new(ptr as *mut u8)?,
                len,
                guard: self.page_size,
            })
        }
    }

    unsafe fn deallocate(&self, memory: StackMemory) {
        unsafe {
            libc::munmap(memory.base.as_ptr() as *mut libc::c_void, memory.len);
        }
    }
}

/// The allocator used when the manager configuration names none.
pub fn default_stack_allocator() -> Arc<dyn StackAllocator> {
    #[cfg(unix)]
    {
        Arc::new(MmapStackAllocator::new())
    }
    #[cfg(not(unix))]
    {
        Arc::new(HeapStackAllocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_is_clamped_and_aligned() {
        let counters = Arc::new(MemoryCounters::new());
        let stack = Stack::new(default_stack_allocator(), counters.clone(), 1024).unwrap();

        assert!(stack.usable_size() >= MIN_STACK_SIZE);
        assert_eq!(stack.top() as usize % STACK_ALIGN, 0);
        assert_eq!(counters.live_stacks(), 1);
        assert_eq!(counters.reserved_bytes(), stack.reserved_size());

        drop(stack);
        assert_eq!(counters.live_stacks(), 0);
        assert_eq!(counters.reserved_bytes(), 0);
    }

    #[test]
    fn test_heap_stack_is_writable() {
        let counters = Arc::new(MemoryCounters::new());
        let stack = Stack::new(Arc::new(HeapStackAllocator), counters, 80 * 1024).unwrap();
        let top = stack.top();
        unsafe {
            top.sub(8).write(0xAB);
            assert_eq!(top.sub(8).read(), 0xAB);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_mmap_stack_has_guard_page() {
        let allocator = MmapStackAllocator::new();
        let memory = allocator.allocate(MIN_STACK_SIZE).unwrap();
        assert_eq!(memory.guard, allocator.page_size());
        assert_eq!(memory.len, MIN_STACK_SIZE + allocator.page_size());
        unsafe { allocator.deallocate(memory) };
    }
}
