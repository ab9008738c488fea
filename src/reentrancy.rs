//! Debug-only reentrancy guard.
//!
//! Host hash and equality callbacks run while the entry table is being
//! probed. A callback that re-enters the same map (for example a host
//! `__eq__` that mutates the container) would observe or corrupt a
//! half-updated table. Debug builds panic on such nesting and name the
//! operation that was interrupted; release builds compile the guard away.

use core::cell::Cell;
use core::marker::PhantomData;

#[derive(Debug)]
pub struct DebugReentrancy {
    #[cfg(debug_assertions)]
    active: Cell<Option<&'static str>>,
    // Maps are confined to the host's single calling context.
    _nosend: PhantomData<*mut ()>,
}

impl DebugReentrancy {
    pub const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            active: Cell::new(None),
            _nosend: PhantomData,
        }
    }

    /// Mark `op` as in progress until the returned guard drops.
    #[inline]
    pub fn enter(&self, op: &'static str) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            if let Some(outer) = self.active.get() {
                panic!("reentrant call into map: `{op}` while `{outer}` is in progress");
            }
            self.active.set(Some(op));
            ReentrancyGuard { owner: self }
        }

        #[cfg(not(debug_assertions))]
        {
            let _ = op;
            ReentrancyGuard { _z: PhantomData }
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
}

impl<'a> Drop for ReentrancyGuard<'a> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.owner.active.set(None);
    }
}
