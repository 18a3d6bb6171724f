//! Process-wide state cells, initialized once during library init.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// A process-wide boolean flag.
pub struct Flag(AtomicBool);

impl Flag {
    /// Creates a new, unset flag.
    pub const fn new() -> Self {
        Flag(AtomicBool::new(false))
    }

    /// Tests whether the flag is set.
    pub fn test(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release)
    }

    /// Sets the flag, reporting whether this call was the one that
    /// set it.
    pub fn test_and_set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Unsets the flag.
    pub fn unset(&self) {
        self.0.store(false, Ordering::Release)
    }
}

/// A global value, installed exactly once during `init`.
///
/// Reads are only valid while the value is installed. The `init`/`drop`
/// contract is upheld by the caller, hence the unsafe mutators.
pub struct Global<T> {
    installed: Flag,
    value: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send + Sync> Sync for Global<T> {}

impl<T> Global<T> {
    /// Creates a new, empty global cell.
    pub const fn new() -> Self {
        Global {
            installed: Flag::new(),
            value: UnsafeCell::new(None),
        }
    }

    /// Installs a value in this cell.
    ///
    /// Only sound before any other thread may call `get()`.
    pub unsafe fn set(&self, value: T) {
        *self.value.get() = Some(value);
        self.installed.set();
    }

    /// Drops the installed value.
    ///
    /// Only sound once no thread holds a reference into the cell.
    pub unsafe fn unset(&self) {
        self.installed.unset();
        *self.value.get() = None;
    }

    /// Returns a reference to the installed value, if any.
    pub fn get(&self) -> Option<&T> {
        if self.installed.test() {
            unsafe { (*self.value.get()).as_ref() }
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_set_get_unset() {
        let cell: Global<u32> = Global::new();
        assert!(cell.get().is_none());
        unsafe { cell.set(42) };
        assert_eq!(cell.get().copied(), Some(42));
        unsafe { cell.unset() };
        assert!(cell.get().is_none());
    }
}
