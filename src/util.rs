//! Small helpers shared by both endpoints.

use std::cmp;
use std::os::raw::c_char;

#[cfg(all(debug_assertions, feature = "assert_process_allocs"))]
#[global_allocator]
static A: assert_no_alloc::AllocDisabler = assert_no_alloc::AllocDisabler;

/// Temporarily allow allocations within `func` if the `assert_process_allocs`
/// feature is enabled. The protocol is allowed to allocate its frame buffers
/// on the audio path; everything else gets caught.
pub fn permit_alloc<T, F: FnOnce() -> T>(func: F) -> T {
    cfg_if::cfg_if! {
        if #[cfg(all(debug_assertions, feature = "assert_process_allocs"))] {
            assert_no_alloc::permit_alloc(func)
        } else {
            func()
        }
    }
}

/// The length of the null-terminated string at the start of `bytes`, including
/// the terminator. Falls back to the whole slice plus a synthesised terminator
/// when the peer forgot one.
pub fn cstr_len(bytes: &[u8]) -> usize {
    match bytes.iter().position(|b| *b == 0) {
        Some(pos) => pos + 1,
        None => bytes.len() + 1,
    }
}

/// Copy the null-terminated string at the start of `src` into the raw C buffer
/// the host handed us. VST 2.4 string buffers have well-known maximum sizes,
/// so `cap` is the opcode-specific limit.
///
/// # Safety
///
/// `dest` must point to a writable buffer of at least `cap` bytes.
pub unsafe fn copy_cstr_out(dest: *mut c_char, src: &[u8], cap: usize) {
    if dest.is_null() || cap == 0 {
        return;
    }

    let len = cmp::min(cstr_len(src).saturating_sub(1), cap - 1);
    std::ptr::copy_nonoverlapping(src.as_ptr() as *const c_char, dest, len);
    *dest.add(len) = 0;
}

/// View a `#[repr(C)]` value as its raw bytes, for copying ABI structs into
/// a frame's data slot.
///
/// # Safety
///
/// `T` must be plain old data: no padding-sensitive reads happen, but the
/// bytes are sent to the peer verbatim.
pub unsafe fn as_raw_bytes<T>(value: &T) -> &[u8] {
    std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
}

/// Read the null-terminated string starting at `src` as bytes including the
/// terminator, reading no more than `cap` bytes in total.
///
/// # Safety
///
/// `src` must point to a readable null-terminated buffer of at most `cap`
/// bytes.
pub unsafe fn cstr_in<'a>(src: *const c_char, cap: usize) -> &'a [u8] {
    if src.is_null() {
        return &[];
    }

    let mut len = 0;
    while len + 1 < cap && *src.add(len) != 0 {
        len += 1;
    }
    std::slice::from_raw_parts(src as *const u8, len + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstr_len_includes_terminator() {
        assert_eq!(cstr_len(b"abc\0def"), 4);
        assert_eq!(cstr_len(b"abc"), 4);
        assert_eq!(cstr_len(b"\0"), 1);
    }
}
