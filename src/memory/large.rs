use super::header::{BlockHeader, HEADER_SIZE, LARGE_CLASS};
use super::numa::AllocError;
use super::stats;
use super::vm::{HUGE_PAGE_SIZE, PlatformVmOps, VmOps};
use std::ptr::NonNull;

/// Rounded mapping length for a large block of `total` bytes (header
/// included), and whether a huge-page mapping should be attempted.
fn mapping_size(total: usize, use_huge_pages: bool) -> (usize, bool) {
    if use_huge_pages && total >= HUGE_PAGE_SIZE {
        (total.next_multiple_of(HUGE_PAGE_SIZE), true)
    } else {
        (total.next_multiple_of(PlatformVmOps::page_size()), false)
    }
}

/// Standalone mapping for a request above the largest size class. The
/// mapping is bound to `node` before first touch so the kernel's placement
/// is definite, not first-touch luck.
pub(crate) fn alloc_large(
    node: usize,
    size: usize,
    use_huge_pages: bool,
) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(node < LARGE_CLASS as usize);
    let total = size
        .checked_add(HEADER_SIZE)
        .ok_or(AllocError::SizeOverflow)?;
    let (mapped, huge_preferred) = mapping_size(total, use_huge_pages);

    // Safety: FFI mapping call; mapped is non-zero.
    let base = unsafe { PlatformVmOps::map_anon(mapped, huge_preferred)? };
    PlatformVmOps::bind_pages(base, mapped, node);

    stats::TOTAL_RESERVED.add(mapped);
    stats::TOTAL_COMMITTED.add(mapped);
    stats::LARGE_BLOCK_COMMITTED.add(mapped);

    // The header records the mapping length — free recovers the munmap
    // arguments from it alone.
    // Safety: the mapping is writable and larger than one header.
    Ok(unsafe { BlockHeader::write(base, mapped, LARGE_CLASS, node as u16) })
}

/// Release a large block.
///
/// # Safety
/// `ptr` must be a live user pointer produced by [`alloc_large`].
pub(crate) unsafe fn free_large(ptr: NonNull<u8>) {
    // Safety: caller guarantees a live large-block header precedes ptr.
    let header = unsafe { BlockHeader::from_user_ptr(ptr) };
    header.check_canary();
    debug_assert!(header.is_large());
    let mapped = header.size();
    // Safety: same contract.
    let base = unsafe { BlockHeader::base_of(ptr) };

    stats::TOTAL_RESERVED.sub(mapped);
    stats::TOTAL_COMMITTED.sub(mapped);
    stats::LARGE_BLOCK_COMMITTED.sub(mapped);

    // Safety: base/mapped describe the whole mapping created in alloc_large.
    unsafe { drop(PlatformVmOps::release(base, mapped)) };
}
