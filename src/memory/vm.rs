use std::fmt;
use std::ptr::NonNull;

/// Huge page size used for large-allocation rounding (2MB).
pub(crate) const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug)]
pub enum VmError {
    ReserveFailed(std::io::Error),
    CommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    MapFailed(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReserveFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::MapFailed(e) => write!(f, "anonymous mapping failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReserveFailed(e)
            | VmError::CommitFailed(e)
            | VmError::ReleaseFailed(e)
            | VmError::MapFailed(e) => Some(e),
        }
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    /// No zero-fill promise; callers that hand out zeroed memory must zero
    /// at the allocator level.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Create an anonymous, private, readable and writable mapping.
    ///
    /// When `huge_preferred` is set, a huge-page-backed mapping is attempted
    /// first and a regular mapping is transparently used on failure.
    ///
    /// # Platform Notes
    /// - **Linux**: `MAP_HUGETLB | MAP_HUGE_2MB`. Requires pre-allocated
    ///   hugetlb pages (`/proc/sys/vm/nr_hugepages`).
    /// - **macOS `x86_64`**: XNU superpages (2MB only).
    /// - **macOS `aarch64`**: no superpage mechanism; always falls back.
    unsafe fn map_anon(size: usize, huge_preferred: bool) -> Result<NonNull<u8>, VmError>;

    /// Ask the kernel to place the pages of `[ptr, ptr+size)` on `node`.
    /// Best-effort: returns whether the binding took hold, never fails the
    /// caller. Platforms without a binding facility report `false`.
    fn bind_pages(ptr: NonNull<u8>, size: usize, node: usize) -> bool;

    /// Map a readable/writable region and bind it to `node` (best-effort).
    unsafe fn alloc_on_node(size: usize, node: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded precondition — size is non-zero.
        let ptr = unsafe { Self::map_anon(size, false)? };
        Self::bind_pages(ptr, size, node);
        Ok(ptr)
    }
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    // ----------------------------------------------------------------
    // Huge page mapping — platform-specific helpers
    // ----------------------------------------------------------------

    /// Linux: MAP_HUGETLB with the page-size encoded in the upper bits of
    /// flags. Requires pre-allocated hugetlb pages:
    ///   echo N > /proc/sys/vm/nr_hugepages
    #[cfg(target_os = "linux")]
    unsafe fn map_anon_huge(size: usize) -> Result<NonNull<u8>, VmError> {
        // MAP_HUGE_SHIFT is 26; the log₂ of the page size goes in bits [31:26].
        const MAP_HUGE_SHIFT: libc::c_int = 26;
        const MAP_HUGE_2MB: libc::c_int = 21 << MAP_HUGE_SHIFT;

        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_HUGETLB | MAP_HUGE_2MB,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::MapFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::MapFailed(io::Error::other("mmap returned null")))
    }

    /// macOS Intel (x86_64): XNU superpages via mmap flag.
    ///
    /// The superpage size is encoded in the upper 16 bits of the `flags`
    /// argument when `MAP_ANON` is set.
    /// `VM_FLAGS_SUPERPAGE_SIZE_2MB` (1) << `VM_FLAGS_SUPERPAGE_SHIFT` (16)
    /// = 0x10000.
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    unsafe fn map_anon_huge(size: usize) -> Result<NonNull<u8>, VmError> {
        const SUPERPAGE_2MB: libc::c_int = 1 << 16;

        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | SUPERPAGE_2MB,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::MapFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::MapFailed(io::Error::other("mmap returned null")))
    }

    /// Apple Silicon (aarch64): no superpage support whatsoever. The
    /// hardware only supports 16KB pages; any superpage flag to mmap results
    /// in `KERN_INVALID_ARGUMENT` from the Mach VM layer.
    #[cfg(all(target_os = "macos", not(target_arch = "x86_64")))]
    unsafe fn map_anon_huge(_size: usize) -> Result<NonNull<u8>, VmError> {
        Err(VmError::MapFailed(io::Error::new(
            io::ErrorKind::Unsupported,
            "no superpage support on this architecture",
        )))
    }

    // ----------------------------------------------------------------

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReserveFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReserveFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Transparent Huge Pages: ask the kernel to back this region
                // with 2MB pages when possible. Only worthwhile for regions
                // of at least one huge page.
                if size >= super::HUGE_PAGE_SIZE {
                    // Safety: FFI call to madvise.
                    unsafe {
                        libc::madvise(
                            ptr.as_ptr().cast::<libc::c_void>(),
                            size,
                            libc::MADV_HUGEPAGE,
                        )
                    };
                }
                // The linear arena commits in whole commit-unit steps right
                // before the memory is used; ask for immediate physical
                // backing to avoid a burst of minor page faults.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(
                        ptr.as_ptr().cast::<libc::c_void>(),
                        size,
                        libc::MADV_WILLNEED,
                    )
                };
            }

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page
                // size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        unsafe fn map_anon(size: usize, huge_preferred: bool) -> Result<NonNull<u8>, VmError> {
            debug_assert!(size != 0, "map_anon: size must be non-zero");

            if huge_preferred {
                // Safety: FFI mapping call; preconditions checked above.
                if let Ok(ptr) = unsafe { map_anon_huge(size) } {
                    return Ok(ptr);
                }
                // Huge pages unavailable (pool empty, unsupported hardware).
                // Fall through to a regular mapping with identical semantics.
            }

            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::MapFailed(io::Error::other("mmap returned null")))
        }

        #[cfg(target_os = "linux")]
        fn bind_pages(ptr: NonNull<u8>, size: usize, node: usize) -> bool {
            // Single-word nodemask covers nodes 0..63, far beyond any
            // machine this crate targets.
            const MPOL_BIND: libc::c_int = 2;
            let maxnode = 8 * std::mem::size_of::<libc::c_ulong>();
            if node >= maxnode {
                return false;
            }
            let nodemask: libc::c_ulong = 1 << node;
            // Safety: FFI call to mbind via raw syscall; libc does not
            // expose a direct binding. ptr/size describe a live mapping.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_mbind,
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size as libc::c_ulong,
                    MPOL_BIND,
                    &raw const nodemask,
                    maxnode as libc::c_ulong,
                    0,
                )
            };
            rc == 0
        }

        #[cfg(not(target_os = "linux"))]
        fn bind_pages(_ptr: NonNull<u8>, _size: usize, _node: usize) -> bool {
            // No node-binding facility; mappings stay node-oblivious.
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every
// "reservation" with a plain heap allocation (via `std::alloc`).
//
// `commit` is an intentional no-op: the memory is always accessible once
// reserved. `bind_pages` reports no binding. This is sufficient for testing
// the *synchronization* logic of the allocators (loom) and detecting
// undefined behaviour in unsafe pointer code (Miri); actual page-fault,
// huge-page and NUMA-binding behaviour is tested by the real platform
// implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReserveFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReserveFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReserveFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }

    unsafe fn map_anon(size: usize, _huge_preferred: bool) -> Result<NonNull<u8>, VmError> {
        // No real huge pages under the mock; forward to reserve.
        // Safety: caller guarantees size > 0.
        unsafe { Self::reserve(size) }
    }

    fn bind_pages(_ptr: NonNull<u8>, _size: usize, _node: usize) -> bool {
        false
    }
}
