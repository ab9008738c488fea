//! Scoped owning references.
//!
//! `Owned<O>` is the proof that its holder is responsible for exactly one
//! `release` of the wrapped object. Dropping it releases; `into_raw` moves
//! the responsibility out to whoever receives the handle. Every early
//! return or `?` in the crate therefore gives references back
//! automatically, which is what keeps partially failed operations from
//! leaking.

use crate::host::HostObject;
use core::fmt;
use core::ops::Deref;

pub struct Owned<O: HostObject> {
    // Only `None` after `into_raw` has moved the reference out.
    obj: Option<O>,
}

impl<O: HostObject> Owned<O> {
    /// Acquire a new reference to `obj`.
    #[inline]
    pub fn acquire(obj: &O) -> Self {
        obj.acquire();
        Self {
            obj: Some(obj.clone()),
        }
    }

    /// Take over a reference the caller already owns. No count changes.
    #[inline]
    pub fn adopt(obj: O) -> Self {
        Self { obj: Some(obj) }
    }

    /// Give up responsibility for the reference without releasing it.
    #[inline]
    pub fn into_raw(mut self) -> O {
        match self.obj.take() {
            Some(o) => o,
            None => unreachable!("Owned emptied before into_raw"),
        }
    }

    #[inline]
    pub fn get(&self) -> &O {
        match &self.obj {
            Some(o) => o,
            None => unreachable!("Owned accessed after into_raw"),
        }
    }

    /// Identity comparison with a borrowed handle.
    #[inline]
    pub fn is(&self, other: &O) -> bool {
        self.get().is(other)
    }
}

impl<O: HostObject> Deref for Owned<O> {
    type Target = O;

    fn deref(&self) -> &O {
        self.get()
    }
}

impl<O: HostObject> Clone for Owned<O> {
    fn clone(&self) -> Self {
        Owned::acquire(self.get())
    }
}

impl<O: HostObject> Drop for Owned<O> {
    fn drop(&mut self) {
        if let Some(o) = self.obj.take() {
            o.release();
        }
    }
}

impl<O: HostObject + fmt::Debug> fmt::Debug for Owned<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.obj).finish()
    }
}
