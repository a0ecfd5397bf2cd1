use std::alloc::{handle_alloc_error, Layout};

/// Rounds the `value` up to the nearest power of two.
#[inline]
pub fn round_to_pow2(value: usize) -> usize {
    let v = value.saturating_sub(1);
    let v = v | (v >> 1);
    let v = v | (v >> 2);
    let v = v | (v >> 4);
    let v = v | (v >> 8);
    let v = v | (v >> 16);
    #[cfg(target_pointer_width = "64")]
    let v = v | (v >> 32);
    v + 1
}

/// Allocates zeroed storage for `count` elements of type T.
///
/// Allocation failure is fatal: the table cannot operate on partial
/// storage, so this aborts through [`handle_alloc_error`].
pub(crate) fn allocate_zeroed<T>(count: usize) -> *mut T {
    // We unwrap here because we want to panic if we fail to get a valid layout
    let layout = Layout::array::<T>(count).unwrap();
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) } as *mut T;
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    ptr
}

/// Deallocates `count` elements of type T previously returned by
/// [`allocate_zeroed`].
pub(crate) fn deallocate<T>(ptr: *mut T, count: usize) {
    let layout = Layout::array::<T>(count).unwrap();
    unsafe {
        std::alloc::dealloc(ptr as *mut u8, layout);
    }
}
