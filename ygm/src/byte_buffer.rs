//! A growable, page-aligned byte arena used as serialization scratch and as
//! the payload of in-flight sends and receives.
//!
//! Capacity always rounds up to a whole number of pages, the way a direct
//! `mmap`/`mremap`-backed arena would; this crate favors a safe `Vec<u8>`
//! with capacity requests rounded the same way, since the borrow checker
//! already gives us the "no dangling mutable region survives a
//! reallocation" guarantee a raw-pointer arena has to document as a caller
//! obligation instead.

use crate::error::{EngineError, Result};

fn page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions and never
    // fails on a POSIX system; a negative return only happens for unknown
    // parameter names.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn page_aligned(requested: usize) -> usize {
    let page = page_size();
    let pages = requested.div_ceil(page).max(1);
    pages * page
}

/// Growable byte buffer whose capacity is always a multiple of the system
/// page size.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = Self::new();
        buf.reserve(capacity);
        buf
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Resets length to zero. Capacity, and therefore the underlying
    /// allocation, is retained.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Reserves capacity for at least `cap` bytes total, rounded up to a
    /// page multiple.
    pub fn reserve(&mut self, cap: usize) {
        let target = page_aligned(cap);
        if target > self.data.capacity() {
            self.data.reserve_exact(target - self.data.len());
        }
    }

    /// Grows (never shrinks) the buffer to `new_len`, reserving capacity if
    /// needed. Newly exposed bytes are zeroed.
    pub fn resize(&mut self, new_len: usize) {
        if new_len > self.data.capacity() {
            self.reserve(new_len);
        }
        self.data.resize(new_len, 0);
    }

    /// Appends `bytes`, doubling capacity (or growing to fit, whichever is
    /// larger) and rounding to a page multiple when the current capacity is
    /// insufficient.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let needed = self.data.len() + bytes.len();
        if needed > self.data.capacity() {
            let doubled = self.data.capacity() * 2;
            self.reserve(doubled.max(needed));
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn swap(&mut self, other: &mut ByteBuffer) {
        std::mem::swap(&mut self.data, &mut other.data);
    }

    /// Reads a fixed-size array out of the buffer at `offset`, failing with
    /// [`EngineError::Invariant`] if the buffer is too short — frames are
    /// self-delimiting, so a short read means a bug in the framing logic,
    /// never malformed input from the substrate.
    pub fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let end = offset
            .checked_add(N)
            .ok_or_else(|| EngineError::Invariant("frame cursor overflow".into()))?;
        let slice = self.data.get(offset..end).ok_or_else(|| {
            EngineError::Invariant(format!(
                "frame truncated: wanted {N} bytes at offset {offset}, buffer is {} bytes",
                self.data.len()
            ))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Patches `N` bytes at `offset` in place — used to back-fill the
    /// routing header's payload-size placeholder once the frame body has
    /// been written.
    pub fn patch_array<const N: usize>(&mut self, offset: usize, value: [u8; N]) -> Result<()> {
        let end = offset
            .checked_add(N)
            .ok_or_else(|| EngineError::Invariant("frame cursor overflow".into()))?;
        let slice = self.data.get_mut(offset..end).ok_or_else(|| {
            EngineError::Invariant(format!("cannot patch {N} bytes at offset {offset}"))
        })?;
        slice.copy_from_slice(&value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffer_is_empty() {
        let buf = ByteBuffer::new();
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn reserve_rounds_to_page_multiple() {
        let mut buf = ByteBuffer::new();
        buf.reserve(1);
        assert_eq!(buf.capacity() % page_size(), 0);
        assert!(buf.capacity() >= page_size());
    }

    #[test]
    fn push_bytes_grows_and_retains_contents() {
        let mut buf = ByteBuffer::new();
        buf.push_bytes(b"hello");
        buf.push_bytes(b" world");
        assert_eq!(buf.data(), b"hello world");
    }

    #[test]
    fn clear_resets_length_not_capacity() {
        let mut buf = ByteBuffer::new();
        buf.push_bytes(&[1u8; 100]);
        let cap = buf.capacity();
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn swap_exchanges_contents() {
        let mut a = ByteBuffer::new();
        let mut b = ByteBuffer::new();
        a.push_bytes(b"a");
        b.push_bytes(b"bb");
        a.swap(&mut b);
        assert_eq!(a.data(), b"bb");
        assert_eq!(b.data(), b"a");
    }

    #[test]
    fn patch_array_overwrites_placeholder() {
        let mut buf = ByteBuffer::new();
        buf.push_bytes(&0u32.to_le_bytes());
        buf.patch_array(0, 42u32.to_le_bytes()).unwrap();
        assert_eq!(u32::from_le_bytes(buf.read_array(0).unwrap()), 42);
    }

    #[test]
    fn read_array_past_end_is_invariant_error() {
        let buf = ByteBuffer::new();
        assert!(buf.read_array::<4>(0).is_err());
    }
}
