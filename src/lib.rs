#[cfg(not(target_pointer_width = "64"))]
compile_error!("numalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// NUMA allocator
pub use memory::numa::{
    AllocError, GlobalNumaAllocator, NumaAllocator, NumaAllocatorConfig, ThreadCache,
};
pub use memory::size_class::{SIZE_CLASSES, class_of, class_size};
pub use memory::topology::NumaTopology;

// linear arena
pub use memory::arena::{ArenaError, LinearArena};

// mgmt/stats
pub use memory::stats::{MemoryStats, memory_stats};

// errors
pub use memory::vm::VmError;
