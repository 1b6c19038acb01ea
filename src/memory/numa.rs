use super::header::{BlockHeader, HEADER_SIZE};
use super::large;
use super::node_pool::NodePool;
use super::size_class::{self, SIZE_CLASS_COUNT};
use super::topology::NumaTopology;
use super::vm::VmError;
use crate::sync::RwLock;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::cell::{Cell, UnsafeCell};
use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum AllocError {
    AlreadyInitialized,
    NotInitialized,
    ZeroSize,
    SizeOverflow,
    NodeExhausted { node: usize },
    Vm(VmError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::AlreadyInitialized => write!(f, "allocator already initialized"),
            AllocError::NotInitialized => write!(f, "allocator not initialized"),
            AllocError::ZeroSize => write!(f, "zero-size allocation request"),
            AllocError::SizeOverflow => write!(f, "allocation size overflows usize"),
            AllocError::NodeExhausted { node } => write!(f, "node {node} pool exhausted"),
            AllocError::Vm(e) => write!(f, "VM operation failed: {e}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Vm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for AllocError {
    fn from(e: VmError) -> Self {
        AllocError::Vm(e)
    }
}

/// Configuration for [`NumaAllocator`]. All fields have sensible defaults.
/// Set at init time via [`NumaAllocator::with_config`] or
/// [`GlobalNumaAllocator::init_with_config`].
#[derive(Clone, Debug)]
pub struct NumaAllocatorConfig {
    /// Bytes mapped per NUMA node at init. Default: 256 MB.
    pub pool_size_per_node: usize,

    /// Blocks carved per slow-path batch refill. One pool-mutex acquisition
    /// amortises over this many fast-path allocations. Default: 64.
    pub refill_batch: usize,

    /// Attempt huge-page-backed mappings for large allocations, with
    /// graceful fallback to regular pages. Default: true.
    pub use_huge_pages: bool,
}

impl Default for NumaAllocatorConfig {
    fn default() -> Self {
        Self {
            pool_size_per_node: 256 * 1024 * 1024,
            refill_batch: 64,
            use_huge_pages: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Thread Cache
// ----------------------------------------------------------------------------

/// Singly-linked stack of free blocks, threaded through the first `usize`
/// of each block's user storage (never through the header). Valid because
/// every size class is at least pointer-sized.
pub(crate) struct FreeStack {
    head: Option<NonNull<u8>>,
    count: u32,
}

impl FreeStack {
    pub fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    pub fn push(&mut self, ptr: NonNull<u8>) {
        // Safety: ptr refers to a free block of at least 16 user bytes,
        // aligned to at least align_of::<usize>().
        unsafe {
            *ptr.cast::<usize>().as_ptr() = self.head.map_or(0, |p| p.as_ptr() as usize);
        }
        self.head = Some(ptr);
        self.count += 1;
    }

    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let ptr = self.head?;
        // Safety: ptr is valid and aligned (see push).
        unsafe {
            let next = *ptr.cast::<usize>().as_ptr();
            self.head = NonNull::new(next as *mut u8);
        }
        self.count -= 1;
        Some(ptr)
    }
}

/// Per-thread allocation state. Created lazily on a thread's first
/// allocation; the home node is sampled once at creation and never
/// re-sampled, even if the thread later migrates to another node.
pub struct ThreadCache {
    home_node: usize,
    bins: [FreeStack; SIZE_CLASS_COUNT],
    allocs: u64,
    frees: u64,
}

impl ThreadCache {
    pub(crate) fn new(home_node: usize) -> Self {
        Self {
            home_node,
            bins: std::array::from_fn(|_| FreeStack::new()),
            allocs: 0,
            frees: 0,
        }
    }

    #[must_use]
    pub fn home_node(&self) -> usize {
        self.home_node
    }

    /// (allocations served, frees absorbed) for this cache.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.allocs, self.frees)
    }

    #[cfg(test)]
    pub(crate) fn cached_count(&self, class: usize) -> u32 {
        self.bins[class].count
    }
}

/// Classify `ptr` by its header and either unmap it (large) or push it onto
/// the calling thread's cache. The free is absorbed by the *current*
/// thread's cache regardless of which thread allocated the block; this is
/// the documented single-producer/single-consumer simplification.
pub(crate) unsafe fn free_into_cache(cache: &mut ThreadCache, ptr: NonNull<u8>) {
    // Safety: caller guarantees ptr was produced by this crate's
    // allocation paths and is not yet freed.
    let header = unsafe { BlockHeader::from_user_ptr(ptr) };
    header.check_canary();
    if header.is_large() {
        // Safety: the header says this is a standalone mapping.
        unsafe { large::free_large(ptr) };
    } else {
        cache.bins[header.class() as usize].push(ptr);
    }
    cache.frees += 1;
}

// ----------------------------------------------------------------------------
// Allocator instance
// ----------------------------------------------------------------------------

pub struct NumaAllocator {
    topology: NumaTopology,
    pools: Vec<NodePool>,
    config: NumaAllocatorConfig,
}

impl NumaAllocator {
    /// Create an allocator with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if any node pool cannot be mapped.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(NumaAllocatorConfig::default())
    }

    /// Discover the topology and map one pool per node.
    ///
    /// Pools are first-touched from the initialising thread; the explicit
    /// node binding issued by the VM shim makes the placement definite
    /// wherever the platform supports it.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if any node pool cannot be mapped.
    pub fn with_config(config: NumaAllocatorConfig) -> Result<Self, AllocError> {
        let topology = NumaTopology::discover();
        let mut pools = Vec::with_capacity(topology.num_nodes());
        for node in 0..topology.num_nodes() {
            pools.push(NodePool::new(node, config.pool_size_per_node)?);
        }
        Ok(Self {
            topology,
            pools,
            config,
        })
    }

    #[must_use]
    pub fn topology(&self) -> &NumaTopology {
        &self.topology
    }

    /// Build a cache homed on the calling thread's current node.
    #[must_use]
    pub fn new_cache(&self) -> ThreadCache {
        ThreadCache::new(self.topology.current_node())
    }

    /// Serve `size` bytes from `cache`, falling back to a batch refill from
    /// the cache's home-node pool or to the large-block path.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` on zero size, home-node pool exhaustion, or VM
    /// failure in the large path.
    pub fn alloc_with_cache(
        &self,
        cache: &mut ThreadCache,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let ptr = match size_class::class_of(size) {
            Some(class) => {
                if let Some(ptr) = cache.bins[class].pop() {
                    // Fast path: no locks, no syscalls.
                    #[cfg(debug_assertions)]
                    {
                        // Safety: blocks on the stack carry live headers.
                        let header = unsafe { BlockHeader::from_user_ptr(ptr) };
                        header.check_canary();
                        debug_assert_eq!(header.class() as usize, class);
                    }
                    ptr
                } else {
                    self.refill_class(cache, class)?
                }
            }
            None => large::alloc_large(cache.home_node, size, self.config.use_huge_pages)?,
        };
        cache.allocs += 1;
        Ok(ptr)
    }

    /// Slow path: carve one batch of `class` blocks out of the home-node
    /// pool. Returns the first block; the rest become the new class stack.
    fn refill_class(
        &self,
        cache: &mut ThreadCache,
        class: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let block_size = size_class::class_size(class);
        let stride = HEADER_SIZE + block_size;
        let batch = self.config.refill_batch.max(1);
        // Caches homed by a stale topology reading clamp to a real pool.
        let home = cache.home_node.min(self.pools.len() - 1);

        let span = self.pools[home].reserve_batch(stride * batch)?;

        // Safety: the span is committed pool memory of batch*stride bytes;
        // each block base is header-aligned (stride is a multiple of 16).
        let first = unsafe { BlockHeader::write(span, block_size, class as u16, home as u16) };
        for i in 1..batch {
            // Safety: i * stride stays inside the span.
            let block = unsafe { NonNull::new_unchecked(span.as_ptr().add(i * stride)) };
            // Safety: as above.
            let user = unsafe { BlockHeader::write(block, block_size, class as u16, home as u16) };
            cache.bins[class].push(user);
        }
        // The returned block was never pushed, so it is not double-tracked
        // in the class stack.
        Ok(first)
    }

    /// Return a block to `cache`, or unmap it if it is large.
    ///
    /// # Safety
    /// - `ptr` must have been returned by an allocation path of this crate.
    /// - `ptr` must not have been freed already.
    pub unsafe fn free_with_cache(&self, cache: &mut ThreadCache, ptr: NonNull<u8>) {
        // Safety: forwarded caller contract.
        unsafe { free_into_cache(cache, ptr) }
    }
}

// ----------------------------------------------------------------------------
// Global facade
// ----------------------------------------------------------------------------

// The instance lives behind an RwLock<Option<..>> rather than a OnceLock so
// that cleanup() can tear it down and a later init() can rebuild it.
// Steady-state operations only ever take the read side.
crate::sync::sync_static! {
    static INSTANCE: RwLock<Option<NumaAllocator>> = RwLock::new(None);
}

// Bumped on every init() and cleanup(). A thread cache built under an older
// generation holds pointers into pools that no longer exist; each handle
// discards its cache when it observes a newer generation.
crate::sync::sync_static! {
    static GENERATION: AtomicU64 = AtomicU64::new(0);
}

thread_local! {
    static THREAD_CACHE: ThreadCacheHandle = ThreadCacheHandle::new();
}

/// Per-thread handle owning the thread-local cache.
///
/// # Safety
///
/// `cache` is wrapped in `UnsafeCell` because it is only ever accessed by
/// the owning thread (via TLS). None of the facade paths re-enter the TLS
/// access point — they interact with pools and the VM shim directly.
struct ThreadCacheHandle {
    cache: UnsafeCell<Option<ThreadCache>>,
    generation: Cell<u64>,
}

impl ThreadCacheHandle {
    fn new() -> Self {
        Self {
            cache: UnsafeCell::new(None),
            generation: Cell::new(GENERATION.load(Ordering::Relaxed)),
        }
    }

    /// Discard a cache built under an older init/cleanup generation.
    /// Called at the top of every facade path.
    #[inline]
    fn check_generation(&self) {
        let current = GENERATION.load(Ordering::Acquire);
        if self.generation.get() != current {
            self.generation.set(current);
            // Safety: single-threaded TLS access (see struct-level comment).
            let cache = crate::sync::unsafe_cell_get_mut!(self.cache);
            *cache = None;
        }
    }
}

pub struct GlobalNumaAllocator;

impl GlobalNumaAllocator {
    /// Initialize the global allocator with `pool_size_per_node` bytes
    /// mapped on every node.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::AlreadyInitialized` on a second call, or the
    /// propagated error of any failed sub-step.
    pub fn init(pool_size_per_node: usize) -> Result<(), AllocError> {
        Self::init_with_config(NumaAllocatorConfig {
            pool_size_per_node,
            ..NumaAllocatorConfig::default()
        })
    }

    /// Initialize the global allocator with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::AlreadyInitialized` on a second call, or the
    /// propagated error of any failed sub-step.
    pub fn init_with_config(config: NumaAllocatorConfig) -> Result<(), AllocError> {
        let mut guard = INSTANCE
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_some() {
            return Err(AllocError::AlreadyInitialized);
        }
        *guard = Some(NumaAllocator::with_config(config)?);
        GENERATION.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized() -> bool {
        INSTANCE
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    /// Allocate `size` bytes on the calling thread's home node.
    ///
    /// # Errors
    ///
    /// Returns `AllocError` on zero size, missing init, node-pool
    /// exhaustion, or VM failure.
    pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
        let guard = INSTANCE
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(allocator) = guard.as_ref() else {
            return Err(AllocError::NotInitialized);
        };
        THREAD_CACHE.with(|handle| {
            handle.check_generation();
            // Safety: single-threaded TLS access; alloc_with_cache never
            // re-enters TLS.
            let slot = crate::sync::unsafe_cell_get_mut!(handle.cache);
            let cache = slot.get_or_insert_with(|| allocator.new_cache());
            allocator.alloc_with_cache(cache, size)
        })
    }

    /// Free a pointer previously obtained from [`allocate`](Self::allocate),
    /// [`zeroed`](Self::zeroed) or [`resize`](Self::resize).
    ///
    /// The block is absorbed by the calling thread's cache (small) or
    /// unmapped (large).
    ///
    /// # Safety
    /// - `ptr` must have been returned by this facade and not freed since.
    pub unsafe fn free(ptr: NonNull<u8>) {
        // The read guard keeps cleanup() from unmapping pools while the
        // header is being read.
        let guard = INSTANCE
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        THREAD_CACHE.with(|handle| {
            handle.check_generation();
            // Safety: single-threaded TLS access.
            let slot = crate::sync::unsafe_cell_get_mut!(handle.cache);
            let cache = slot.get_or_insert_with(|| match guard.as_ref() {
                Some(allocator) => allocator.new_cache(),
                None => ThreadCache::new(0),
            });
            // Safety: forwarded caller contract.
            unsafe { free_into_cache(cache, ptr) }
        });
    }

    /// Allocate `num * size` bytes and zero them. Small-class blocks may
    /// carry residue from previous use, so zeroing is unconditional.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::SizeOverflow` when `num * size` overflows, and
    /// any [`allocate`](Self::allocate) error otherwise.
    pub fn zeroed(num: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = num.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
        let ptr = Self::allocate(total)?;
        // Safety: the block has at least `total` usable bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// Resize an allocation. `None` input behaves as
    /// [`allocate`](Self::allocate); a zero `new_size` frees the block and
    /// returns `Ok(None)`. A request that still fits the block's capacity
    /// returns the pointer unchanged; otherwise the contents move to a
    /// fresh block and the old one is freed.
    ///
    /// # Errors
    ///
    /// Any [`allocate`](Self::allocate) error. On error the original block
    /// is left untouched.
    ///
    /// # Safety
    /// - A `Some` `ptr` must have been returned by this facade and not
    ///   freed since.
    pub unsafe fn resize(
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return Self::allocate(new_size).map(Some);
        };
        if new_size == 0 {
            // Safety: forwarded caller contract.
            unsafe { Self::free(ptr) };
            return Ok(None);
        }

        // Safety: caller guarantees ptr is live and from this facade.
        let header = unsafe { BlockHeader::from_user_ptr(ptr) };
        header.check_canary();
        // Usable capacity: the class size for small blocks; for large
        // blocks the mapping length minus the in-band header.
        let old_capacity = if header.is_large() {
            header.size() - HEADER_SIZE
        } else {
            header.size()
        };
        if new_size <= old_capacity {
            return Ok(Some(ptr));
        }

        let fresh = Self::allocate(new_size)?;
        // Safety: both blocks are live; old_capacity bytes are readable
        // from ptr and writable at fresh (new_size > old_capacity).
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_capacity);
            Self::free(ptr);
        }
        Ok(Some(fresh))
    }

    /// (allocations served, frees absorbed) for the calling thread, or
    /// `(0, 0)` if this thread has no cache yet. Never creates a cache.
    #[must_use]
    pub fn thread_stats() -> (u64, u64) {
        THREAD_CACHE.with(|handle| {
            handle.check_generation();
            // Safety: single-threaded TLS access.
            let slot = crate::sync::unsafe_cell_get_mut!(handle.cache);
            slot.as_ref().map_or((0, 0), ThreadCache::stats)
        })
    }

    /// Print the discovered topology to the diagnostic channel.
    pub fn print_topology() {
        let guard = INSTANCE
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_ref() {
            Some(allocator) => println!("{}", allocator.topology()),
            None => println!("numalloc: topology not initialized"),
        }
    }

    /// Tear down the global allocator: every node pool is unmapped and the
    /// topology discarded. Subsequent operations report `NotInitialized`
    /// until the next [`init`](Self::init). Outstanding pointers become
    /// dangling; freeing them after cleanup is undefined.
    pub fn cleanup() {
        let mut guard = INSTANCE
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.take().is_some() {
            GENERATION.fetch_add(1, Ordering::AcqRel);
        }
        drop(guard);
        // Other threads drop their caches cooperatively on next use; the
        // calling thread's cache can go right now.
        THREAD_CACHE.with(ThreadCacheHandle::check_generation);
    }
}
