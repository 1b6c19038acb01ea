use std::ptr::NonNull;

/// Class value marking a standalone large-block mapping.
pub(crate) const LARGE_CLASS: u16 = 0xFFFF;

/// 8-bit canary written into every header on creation. Checked on alloc,
/// free and resize when debug assertions are enabled.
const HEADER_CANARY: u8 = 0xB7;

/// Fixed preamble stored immediately before every user pointer, small or
/// large. Classification on free is a header read; no address-range lookup
/// is ever needed.
///
/// `size` is the class size for small blocks and the full mapping length
/// for large blocks (munmap needs it back).
///
/// Bit layout of `packed: u64`:
/// ```text
///   [63..56] canary  (8 bits)  — always 0xB7
///   [55..32] unused
///   [31..16] class   (16 bits) — size-class index, or 0xFFFF for large
///   [15..0]  node    (16 bits) — home node recorded at allocation time
/// ```
#[repr(C)]
pub(crate) struct BlockHeader {
    size: usize,
    packed: u64,
}

/// Bytes between a block's base address and its user pointer.
pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

// The 16-byte header keeps user pointers 16-aligned for every size class.
const _: () = assert!(HEADER_SIZE == 16);

impl BlockHeader {
    fn pack(class: u16, node: u16) -> u64 {
        (u64::from(HEADER_CANARY) << 56) | (u64::from(class) << 16) | u64::from(node)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn class(&self) -> u16 {
        ((self.packed >> 16) & 0xFFFF) as u16
    }

    #[inline]
    pub fn node(&self) -> u16 {
        (self.packed & 0xFFFF) as u16
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.class() == LARGE_CLASS
    }

    /// Verify the canary byte. Panics on corruption.
    /// No-op when debug assertions are disabled.
    #[inline]
    pub fn check_canary(&self) {
        #[cfg(debug_assertions)]
        {
            let canary = ((self.packed >> 56) & 0xFF) as u8;
            assert!(
                canary == HEADER_CANARY,
                "numalloc corruption: header canary was 0x{canary:02x}, expected 0x{HEADER_CANARY:02x}",
            );
        }
    }

    /// Write a header at `base` and return the user pointer just past it.
    ///
    /// # Safety
    /// `base` must point to at least `HEADER_SIZE` writable bytes aligned
    /// for `BlockHeader`.
    pub unsafe fn write(base: NonNull<u8>, size: usize, class: u16, node: u16) -> NonNull<u8> {
        // Safety: upheld by caller.
        unsafe {
            base.cast::<BlockHeader>().as_ptr().write(BlockHeader {
                size,
                packed: Self::pack(class, node),
            });
            NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE))
        }
    }

    /// Recover the header preceding a user pointer.
    ///
    /// # Safety
    /// `ptr` must be a live user pointer produced by this crate's
    /// allocation paths.
    pub unsafe fn from_user_ptr<'a>(ptr: NonNull<u8>) -> &'a BlockHeader {
        // Safety: upheld by caller — a well-formed header precedes ptr.
        unsafe { &*ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>() }
    }

    /// Base address of the block owning a user pointer.
    ///
    /// # Safety
    /// Same contract as [`from_user_ptr`](Self::from_user_ptr).
    pub unsafe fn base_of(ptr: NonNull<u8>) -> NonNull<u8> {
        // Safety: upheld by caller.
        unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE)) }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    // Header-aligned scratch block for exercising the accessors.
    fn scratch() -> Box<[u64; 8]> {
        Box::new([0u64; 8])
    }

    #[test]
    fn test_write_then_read_back() {
        let mut buf = scratch();
        let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Safety: buf is 64 bytes, header-aligned.
        let user = unsafe { BlockHeader::write(base, 256, 4, 1) };
        assert_eq!(user.as_ptr() as usize, base.as_ptr() as usize + HEADER_SIZE);

        // Safety: user was produced by write above.
        let header = unsafe { BlockHeader::from_user_ptr(user) };
        header.check_canary();
        assert_eq!(header.size(), 256);
        assert_eq!(header.class(), 4);
        assert_eq!(header.node(), 1);
        assert!(!header.is_large());

        // Safety: same block.
        assert_eq!(unsafe { BlockHeader::base_of(user) }, base);
    }

    #[test]
    fn test_large_sentinel() {
        let mut buf = scratch();
        let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Safety: buf is 64 bytes, header-aligned.
        let user = unsafe { BlockHeader::write(base, 4 * 1024 * 1024, LARGE_CLASS, 0) };
        // Safety: user was produced by write above.
        let header = unsafe { BlockHeader::from_user_ptr(user) };
        assert!(header.is_large());
        assert_eq!(header.size(), 4 * 1024 * 1024);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "header canary")]
    fn test_corrupted_canary_panics() {
        let mut buf = scratch();
        let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Safety: buf is 64 bytes, header-aligned.
        let user = unsafe { BlockHeader::write(base, 64, 2, 0) };
        // Safety: clobber the packed word in place.
        unsafe { base.as_ptr().cast::<u64>().add(1).write(0) };
        // Safety: header storage is still valid, just corrupted.
        unsafe { BlockHeader::from_user_ptr(user) }.check_canary();
    }
}
