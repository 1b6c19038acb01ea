// Synchronization primitives, selected once per build.
//
// Normal builds re-export std; `--cfg loom` builds re-export loom so the
// model checker can schedule every atomic and lock operation. Nothing in
// the crate may reach into `std::sync` directly — going through this
// module is what keeps the loom builds honest.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
}

// ---------------------------------------------------------------------------
// sync (Mutex, Arc, RwLock)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, RwLock};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, RwLock};

// ---------------------------------------------------------------------------
// cell (UnsafeCell, Cell)
// ---------------------------------------------------------------------------
pub(crate) mod cell {
    #[cfg(loom)]
    pub(crate) use loom::cell::{Cell, UnsafeCell};

    #[cfg(not(loom))]
    pub(crate) use std::cell::{Cell, UnsafeCell};
}

/// `&mut T` out of an `UnsafeCell<T>`, papering over the API split: std
/// hands back a raw pointer from `.get()`, loom wants a `with_mut` closure.
///
/// # Safety
/// The caller owns exclusivity, exactly as for `UnsafeCell::get`.
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: upheld by caller.
            unsafe { &mut *$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: upheld by caller.
            unsafe { $cell.with_mut(|p| &mut *p) }
        }
    }};
}
pub(crate) use unsafe_cell_get_mut;

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::spawn;

    #[cfg(not(loom))]
    pub(crate) use std::thread::spawn;
}

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------
pub(crate) mod barrier {
    #[cfg(not(loom))]
    pub(crate) use std::sync::Barrier;

    /// loom ships no Barrier of its own. This countdown latch is enough
    /// for the tests: every thread bumps the counter, then spins (yielding
    /// to the model scheduler) until the last arrival.
    #[cfg(loom)]
    #[allow(dead_code)]
    pub(crate) struct Barrier {
        total: usize,
        arrived: super::atomic::AtomicUsize,
    }

    #[cfg(loom)]
    #[allow(dead_code)]
    impl Barrier {
        pub(crate) fn new(total: usize) -> Self {
            Self {
                total,
                arrived: super::atomic::AtomicUsize::new(0),
            }
        }

        pub(crate) fn wait(&self) {
            use super::atomic::Ordering;
            if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 < self.total {
                while self.arrived.load(Ordering::Acquire) < self.total {
                    loom::thread::yield_now();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OnceLock
//
// loom has no OnceLock either. The replacement below leans on a plain std
// Mutex on purpose: OnceLock only guards one-shot initialisation from a
// `static`, which is not an interleaving loom needs to enumerate, and
// loom's own Mutex cannot be constructed in a const context anyway.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    slot: std::sync::Mutex<Option<T>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, init: F) -> &T {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(init());
        }
        let ptr: *const T = slot.as_ref().unwrap();
        // Safety: the value sits behind &self for the static's whole life;
        // nothing moves or drops it while a reference is out.
        unsafe { &*ptr }
    }
}

#[cfg(loom)]
// Safety: every access funnels through the inner Mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

/// Declare a `static` whose initialiser is only `const` under std. Normal
/// builds emit the plain static; loom builds route through
/// `loom::lazy_static!` so each model run starts from a fresh value.
///
/// Usage: `sync_static! { [pub] static NAME: Type = init_expr; }`
#[allow(unused_macro_rules)]
macro_rules! sync_static {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use sync_static;
