use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum ArenaError {
    /// Invalid sizes or a failed VM step during creation.
    CreateFailed(String),
    /// Zero-size or non-power-of-two-aligned request.
    InvalidRequest,
    /// The reservation cannot hold the request.
    OutOfReserve { requested: usize, available: usize },
    /// Commit failure while growing the backed prefix.
    Vm(VmError),
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::CreateFailed(msg) => write!(f, "arena creation failed: {msg}"),
            ArenaError::InvalidRequest => write!(f, "invalid arena allocation request"),
            ArenaError::OutOfReserve {
                requested,
                available,
            } => write!(
                f,
                "arena out of reserve: requested {requested} bytes, {available} available"
            ),
            ArenaError::Vm(e) => write!(f, "VM operation failed: {e}"),
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArenaError::Vm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for ArenaError {
    fn from(e: VmError) -> Self {
        ArenaError::Vm(e)
    }
}

/// Default allocation alignment: the platform word size.
const DEFAULT_ALIGNMENT: usize = std::mem::size_of::<usize>();

/// Reserve-then-lazy-commit bump allocator with a saveable watermark.
///
/// The reservation is carved at creation and never moves; physical backing
/// grows in whole commit-unit steps as the position advances. [`reset`] and
/// [`set_position`] give scoped, stack-disciplined reclamation — everything
/// allocated after a saved position is logically released by restoring it.
/// Committed pages are never returned to the OS before the arena drops.
///
/// Allocations are always zero-filled: a slot below the commit watermark
/// may hold residue from a previous position cycle.
///
/// [`reset`]: Self::reset
/// [`set_position`]: Self::set_position
pub struct LinearArena {
    base: NonNull<u8>,
    reserve_size: usize,
    commit_unit: usize,
    position: usize,
    committed: usize,
}

// Safety: LinearArena owns its mapping. Not Sync — one owner at a time.
unsafe impl Send for LinearArena {}

impl LinearArena {
    /// Reserve `reserve_size` bytes of address space and commit the first
    /// `commit_unit` of them. Both are rounded up to the page size; the
    /// commit unit is clamped to the reservation.
    ///
    /// # Errors
    ///
    /// Returns `ArenaError::CreateFailed` on zero sizes or when either VM
    /// step fails.
    pub fn create(reserve_size: usize, commit_unit: usize) -> Result<Self, ArenaError> {
        if reserve_size == 0 || commit_unit == 0 {
            return Err(ArenaError::CreateFailed(format!(
                "reserve ({reserve_size}) and commit ({commit_unit}) sizes must be non-zero"
            )));
        }
        let page_size = PlatformVmOps::page_size();
        let reserve_size = reserve_size.next_multiple_of(page_size);
        let commit_unit = commit_unit.next_multiple_of(page_size).min(reserve_size);

        // Safety: FFI reservation; size validated above.
        let base = unsafe { PlatformVmOps::reserve(reserve_size) }
            .map_err(|e| ArenaError::CreateFailed(e.to_string()))?;
        // Safety: commit_unit <= reserve_size, so the prefix is in range.
        if let Err(e) = unsafe { PlatformVmOps::commit(base, commit_unit) } {
            // Safety: releasing the reservation made just above.
            unsafe { drop(PlatformVmOps::release(base, reserve_size)) };
            return Err(ArenaError::CreateFailed(e.to_string()));
        }

        stats::TOTAL_RESERVED.add(reserve_size);
        stats::TOTAL_COMMITTED.add(commit_unit);
        stats::LINEAR_ARENA_COMMITTED.add(commit_unit);

        Ok(Self {
            base,
            reserve_size,
            commit_unit,
            position: 0,
            committed: commit_unit,
        })
    }

    /// Allocate `size` word-aligned, zero-filled bytes.
    ///
    /// # Errors
    ///
    /// See [`alloc_aligned`](Self::alloc_aligned).
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.alloc_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Allocate `size` zero-filled bytes aligned to `align` (a power of
    /// two).
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a zero size or bad alignment,
    /// `OutOfReserve` when the reservation cannot hold the request, and a
    /// VM error when committing additional backing fails.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, ArenaError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(ArenaError::InvalidRequest);
        }

        let aligned = self.position.next_multiple_of(align);
        let new_position = aligned
            .checked_add(size)
            .filter(|&p| p <= self.reserve_size)
            .ok_or(ArenaError::OutOfReserve {
                requested: size,
                available: self.reserve_size - self.position,
            })?;

        if new_position > self.committed {
            // Grow the backed prefix in whole commit-unit steps, clamped to
            // the end of the reservation.
            let target = new_position
                .next_multiple_of(self.commit_unit)
                .min(self.reserve_size);
            let grow = target - self.committed;
            // Safety: committed..target lies inside the reservation.
            let start = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.committed)) };
            // Safety: FFI call to commit.
            unsafe { PlatformVmOps::commit(start, grow)? };

            stats::TOTAL_COMMITTED.add(grow);
            stats::LINEAR_ARENA_COMMITTED.add(grow);
            self.committed = target;
        }

        self.position = new_position;
        // Safety: aligned + size <= committed <= reserve_size.
        let slot = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(aligned)) };
        // The slot may hold residue from before a reset/set_position.
        // Safety: the slot is committed and writable for `size` bytes.
        unsafe { std::ptr::write_bytes(slot.as_ptr(), 0, size) };
        Ok(slot)
    }

    /// Rewind to the start. Does not decommit.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Current watermark, for later [`set_position`](Self::set_position).
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Restore a previously saved watermark. Values beyond the reservation
    /// are ignored. Every allocation made after the position was saved is
    /// logically released.
    pub fn set_position(&mut self, position: usize) {
        if position <= self.reserve_size {
            self.position = position;
        }
    }

    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reserve_size
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed
    }
}

impl Drop for LinearArena {
    fn drop(&mut self) {
        // Safety: base/reserve_size describe the mapping made in create.
        unsafe { drop(PlatformVmOps::release(self.base, self.reserve_size)) };
        stats::TOTAL_RESERVED.sub(self.reserve_size);
        stats::TOTAL_COMMITTED.sub(self.committed);
        stats::LINEAR_ARENA_COMMITTED.sub(self.committed);
    }
}
