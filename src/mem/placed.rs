//! Construction of runtime objects inside caller-supplied memory.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::ptr::NonNull;

/// An object living in memory the caller provided.
///
/// The object is dropped in place when the `Placed` handle goes away; the
/// memory itself stays with the caller. Use [`Placed::layout`] to size and
/// align a buffer before calling [`Placed::in_bytes`].
pub struct Placed<'a, T> {
    ptr: NonNull<T>,
    _marker: PhantomData<&'a mut T>,
}

unsafe impl<T: Send> Send for Placed<'_, T> {}
unsafe impl<T: Sync> Sync for Placed<'_, T> {}

impl<'a, T> Placed<'a, T> {
    /// Size and alignment the memory for a `T` must have.
    pub fn layout() -> Layout {
        Layout::new::<T>()
    }

    /// Move `value` into `slot`.
    pub fn new(slot: &'a mut MaybeUninit<T>, value: T) -> Self {
        let value = slot.write(value);
        Self {
            ptr: NonNull::from(value),
            _marker: PhantomData,
        }
    }

    /// Move `value` into a raw byte buffer.
    ///
    /// Gives the value back if `memory` is too small or misaligned for `T`.
    pub fn in_bytes(memory: &'a mut [u8], value: T) -> Result<Self, T> {
        let layout = Self::layout();
        let addr = memory.as_mut_ptr() as usize;
        if memory.len() < layout.size() || addr % layout.align() != 0 {
            return Err(value);
        }
        let ptr = memory.as_mut_ptr() as *mut T;
        unsafe {
            ptr.write(value);
            Ok(Self {
                ptr: NonNull::new_unchecked(ptr),
                _marker: PhantomData,
            })
        }
    }
}

impl<T> Deref for Placed<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for Placed<'_, T> {
    fn drop(&mut self) {
        unsafe { core::ptr::drop_in_place(self.ptr.as_ptr()) };
    }
}
