//! Global variables, initialized exactly once per process.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// A process wide boolean flag.
pub struct Flag {
    inner: AtomicBool,
}

impl Flag {
    /// Creates a new `Flag`, initially unset.
    pub const fn new() -> Self {
        Self {
            inner: AtomicBool::new(false),
        }
    }

    /// Tests if the flag is set.
    pub fn test(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.inner.store(true, Ordering::Release);
    }

    /// Unsets the flag.
    pub fn unset(&self) {
        self.inner.store(false, Ordering::Release);
    }
}

/// A global value of type `T`, set during the init process
/// of the library.
///
/// Reads of an unset `Global` yield `None`. Callers are in charge
/// of guaranteeing no set or drop operation races other accesses,
/// hence the `unsafe` markers; in practice this is upheld by only
/// mutating globals from `hermod::init` and `InitGuard::drop`.
pub struct Global<T> {
    initialized: Flag,
    value: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send + Sync> Sync for Global<T> {}

impl<T> Global<T> {
    /// Creates a new, unset `Global`.
    pub const fn new() -> Self {
        Self {
            initialized: Flag::new(),
            value: UnsafeCell::new(None),
        }
    }

    /// Installs a value in this `Global`.
    pub unsafe fn set(&self, value: T) {
        *self.value.get() = Some(value);
        self.initialized.set();
    }

    /// Drops the value stored in this `Global`, if any.
    pub unsafe fn unset(&self) {
        self.initialized.unset();
        *self.value.get() = None;
    }

    /// Returns a reference to the stored value, if the
    /// init process has completed.
    pub fn get(&self) -> Option<&T> {
        if !self.initialized.test() {
            return None;
        }
        unsafe { (*self.value.get()).as_ref() }
    }
}
