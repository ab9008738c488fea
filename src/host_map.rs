//! HostMap: the owning associative container.
//!
//! Every operation states how references move between the caller and the
//! map. Unless noted, keys and values are *borrowed* from the caller and the
//! map acquires its own references (duplicate-on-insert); results are
//! returned as `Owned`, i.e. with one reference the caller must give back
//! (dropping the `Owned` does that).
//!
//! | operation | caller gets | map effect |
//! |---|---|---|
//! | `get` | +1 on value | none |
//! | `get_or` | +1 on value or default | none |
//! | `set` (insert) | nothing | +1 key, +1 value |
//! | `set` (replace) | nothing | +1 new value, -1 old value, key reused |
//! | `delete` | nothing | -1 key, -1 value |
//! | `pop` (present) | the map's value reference | -1 key |
//! | `pop` (absent) | +1 on default | none |
//! | `pop_item` | the map's key and value references | none |
//! | `clear` | nothing | -1 per key and value |
//! | `copy` | a new map | +1 per key and value, in the copy |
//!
//! Failures leave every count exactly as it was: references are only
//! acquired after the table has room for them, and anything acquired is
//! held in an `Owned` that releases itself if the operation bails out.

use crate::entry_table::EntryTable;
use crate::error::MapError;
use crate::host::HostObject;
use crate::owned::Owned;
use core::fmt;
use core::hash::BuildHasher;
use std::collections::hash_map::RandomState;

pub struct HostMap<O: HostObject, S = RandomState> {
    table: EntryTable<O, S>,
}

/// An `insert` that could not be performed; the references are handed back
/// untouched.
#[derive(Debug)]
pub struct Rejected<O: HostObject> {
    pub error: MapError,
    pub key: Owned<O>,
    pub value: Owned<O>,
}

impl<O: HostObject> HostMap<O> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// An empty map with room for `capacity` entries. Aborts if that
    /// allocation fails; sizes that come from the host go through
    /// `try_reserve` instead.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }

    /// A new map where every key in `keys` maps to `value`.
    pub fn from_keys<'a, I>(keys: I, value: &O) -> Result<Self, MapError>
    where
        I: IntoIterator<Item = &'a O>,
        O: 'a,
    {
        let mut map = Self::new();
        for key in keys {
            map.set(key, value)?;
        }
        Ok(map)
    }
}

impl<O: HostObject> Default for HostMap<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: HostObject, S> HostMap<O, S> {
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Make room for `additional` entries up front.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), MapError> {
        self.table.reserve(additional)
    }

    /// Remove and return the most recently placed entry, handing both of
    /// the map's references to the caller.
    pub fn pop_item(&mut self) -> Result<(Owned<O>, Owned<O>), MapError> {
        let h = self.table.last().ok_or(MapError::EmptyContainer)?;
        let pair = self.table.remove(h).ok_or(MapError::EmptyContainer)?;
        tracing::trace!(remaining = self.table.len(), "popitem");
        Ok(pair)
    }

    /// The entry `pop_item` would remove next, borrowed.
    pub fn peek_item(&self) -> Option<(&O, &O)> {
        let h = self.table.last()?;
        Some((self.table.key(h)?, self.table.value(h)?))
    }

    /// Release every key and value reference. The table is emptied before
    /// the first release runs.
    pub fn clear(&mut self) {
        let n = self.table.len();
        if n == 0 {
            return;
        }
        tracing::trace!(entries = n, "clear");
        for (key, value) in self.table.take_all() {
            drop(value);
            drop(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&O, &O)> {
        self.table.iter().map(|(_, k, v)| (k, v))
    }

    /// Snapshot of the keys, one acquired reference each.
    pub fn keys(&self) -> Vec<Owned<O>> {
        self.iter().map(|(k, _)| Owned::acquire(k)).collect()
    }

    /// Snapshot of the values, one acquired reference each.
    pub fn values(&self) -> Vec<Owned<O>> {
        self.iter().map(|(_, v)| Owned::acquire(v)).collect()
    }

    /// Snapshot of the entries, one acquired reference per key and value.
    pub fn items(&self) -> Vec<(Owned<O>, Owned<O>)> {
        self.iter()
            .map(|(k, v)| (Owned::acquire(k), Owned::acquire(v)))
            .collect()
    }
}

impl<O: HostObject, S: BuildHasher> HostMap<O, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            table: EntryTable::with_capacity_and_hasher(capacity, hasher),
        }
    }

    pub fn contains_key(&self, key: &O) -> bool {
        self.table.find(key).is_some()
    }

    /// The value stored for `key`, with a new reference for the caller.
    pub fn get(&self, key: &O) -> Result<Owned<O>, MapError> {
        let h = self.table.find(key).ok_or(MapError::KeyNotFound)?;
        let value = self.table.value(h).ok_or(MapError::KeyNotFound)?;
        Ok(Owned::acquire(value))
    }

    /// Like `get`, but an absent key yields `default` (with a new reference).
    pub fn get_or(&self, key: &O, default: &O) -> Owned<O> {
        match self.table.find(key).and_then(|h| self.table.value(h)) {
            Some(value) => Owned::acquire(value),
            None => Owned::acquire(default),
        }
    }

    /// Insert or replace. The map takes its own references; on replace the
    /// stored key reference is kept and the old value reference released.
    pub fn set(&mut self, key: &O, value: &O) -> Result<(), MapError> {
        let hash = self.table.hash_of(key);
        if let Some(slot) = self
            .table
            .find_hashed(hash, key)
            .and_then(|h| self.table.value_mut(h))
        {
            // The new reference is taken before the old one goes, so
            // re-setting the same object never drops it to zero.
            let old = core::mem::replace(slot, Owned::acquire(value));
            drop(old);
            return Ok(());
        }
        self.table.reserve(1)?;
        self.table
            .insert_hashed(hash, Owned::acquire(key), Owned::acquire(value));
        Ok(())
    }

    /// Insert with transfer: the caller hands over its references.
    ///
    /// If the key is already present, the stored key reference is kept, the
    /// passed-in key reference is released, and the displaced value
    /// reference is returned to the caller.
    pub fn insert(
        &mut self,
        key: Owned<O>,
        value: Owned<O>,
    ) -> Result<Option<Owned<O>>, Rejected<O>> {
        self.insert_reserving(key, value, 1)
    }

    fn insert_reserving(
        &mut self,
        key: Owned<O>,
        value: Owned<O>,
        additional: usize,
    ) -> Result<Option<Owned<O>>, Rejected<O>> {
        let hash = self.table.hash_of(&key);
        if let Some(slot) = self
            .table
            .find_hashed(hash, &key)
            .and_then(|h| self.table.value_mut(h))
        {
            let old = core::mem::replace(slot, value);
            drop(key);
            return Ok(Some(old));
        }
        if let Err(error) = self.table.reserve(additional) {
            return Err(Rejected { error, key, value });
        }
        self.table.insert_hashed(hash, key, value);
        Ok(None)
    }

    /// Remove `key`, releasing the map's key and value references.
    pub fn delete(&mut self, key: &O) -> Result<(), MapError> {
        let h = self.table.find(key).ok_or(MapError::KeyNotFound)?;
        let (key, value) = self.table.remove(h).ok_or(MapError::KeyNotFound)?;
        drop(value);
        drop(key);
        Ok(())
    }

    /// Remove `key` and hand its value reference to the caller. An absent
    /// key yields `default` with a new reference, or `KeyNotFound` when no
    /// default is given.
    pub fn pop(&mut self, key: &O, default: Option<&O>) -> Result<Owned<O>, MapError> {
        match self.table.find(key) {
            Some(h) => {
                let (key, value) = self.table.remove(h).ok_or(MapError::KeyNotFound)?;
                drop(key);
                Ok(value)
            }
            None => default.map(Owned::acquire).ok_or(MapError::KeyNotFound),
        }
    }

    /// `get(key)` if present; otherwise store `default` and return it.
    pub fn set_default(&mut self, key: &O, default: &O) -> Result<Owned<O>, MapError> {
        let hash = self.table.hash_of(key);
        if let Some(value) = self
            .table
            .find_hashed(hash, key)
            .and_then(|h| self.table.value(h))
        {
            return Ok(Owned::acquire(value));
        }
        self.table.reserve(1)?;
        self.table
            .insert_hashed(hash, Owned::acquire(key), Owned::acquire(default));
        Ok(Owned::acquire(default))
    }
}

impl<O: HostObject, S: BuildHasher + Clone> HostMap<O, S> {
    /// An independent map holding its own references to the same pairs.
    pub fn copy(&self) -> Result<Self, MapError> {
        let mut out = Self::with_capacity_and_hasher(0, self.table.hasher().clone());
        out.table.reserve(self.table.len())?;
        // Same hasher, so the stored hashes are valid in the copy.
        for (hash, key, value) in self.table.iter_hashed() {
            out.table
                .insert_hashed(hash, Owned::acquire(key), Owned::acquire(value));
        }
        tracing::trace!(entries = out.len(), "copy");
        Ok(out)
    }
}

impl<O: HostObject, S> Drop for HostMap<O, S> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<O: HostObject + fmt::Debug, S> fmt::Debug for HostMap<O, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracked::{Obj, TrackedHost};

    fn int_map(host: &TrackedHost, n: i64) -> (HostMap<Obj>, Vec<(Obj, Obj)>) {
        let mut m = HostMap::new();
        let pairs: Vec<_> = (0..n).map(|i| (host.int(i), host.int(i * 10))).collect();
        for (k, v) in &pairs {
            m.set(k, v).unwrap();
        }
        (m, pairs)
    }

    #[test]
    fn construct_is_empty_and_touches_nothing() {
        let host = TrackedHost::new();
        let m: HostMap<Obj> = HostMap::with_capacity(16);
        assert!(m.is_empty());
        assert!(m.capacity() >= 16);
        assert_eq!(host.outstanding(), 0);
    }

    #[test]
    fn set_then_get_returns_same_object_with_extra_reference() {
        let host = TrackedHost::new();
        let mut m = HostMap::new();
        let (k, v) = (host.str("k"), host.int(1));
        m.set(&k, &v).unwrap();
        assert_eq!(v.refcount(), 2);
        assert_eq!(k.refcount(), 2);

        let got = m.get(&k).unwrap();
        assert!(got.is(&v));
        assert_eq!(v.refcount(), 3);
        drop(got);
        assert_eq!(v.refcount(), 2);
    }

    #[test]
    fn get_absent_fails_without_touching_counts() {
        let host = TrackedHost::new();
        let (m, _pairs) = int_map(&host, 3);
        let before = (host.total_acquires(), host.total_releases());
        assert_eq!(m.get(&host.int(99)).err(), Some(MapError::KeyNotFound));
        assert_eq!((host.total_acquires(), host.total_releases()), before);
    }

    #[test]
    fn get_or_acquires_either_value_or_default() {
        let host = TrackedHost::new();
        let (m, pairs) = int_map(&host, 2);
        let d = host.str("default");
        let hit = m.get_or(&pairs[0].0, &d);
        assert!(hit.is(&pairs[0].1));
        let miss = m.get_or(&host.int(42), &d);
        assert!(miss.is(&d));
        assert_eq!(d.refcount(), 2);
        assert_eq!(d.acquires(), 1);
    }

    #[test]
    fn replace_releases_old_value_once_and_reuses_key() {
        let host = TrackedHost::new();
        let mut m = HostMap::new();
        let k = host.str("k");
        let (v1, v2) = (host.int(1), host.int(2));
        m.set(&k, &v1).unwrap();
        m.set(&host.str("k"), &v2).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(v1.refcount(), 1);
        assert_eq!(v1.releases(), 1);
        assert_eq!(v2.refcount(), 2);
        // Stored key is still the original object, acquired once.
        assert_eq!(k.acquires(), 1);
        assert!(m.keys()[0].is(&k));
    }

    #[test]
    fn resetting_same_value_keeps_it_alive() {
        let host = TrackedHost::new();
        let mut m = HostMap::new();
        let (k, v) = (host.str("k"), host.int(1));
        m.set(&k, &v).unwrap();
        // Hand the creator's reference to the map, so only the map owns v.
        drop(Owned::adopt(v.clone()));
        assert_eq!(v.refcount(), 1);
        m.set(&k, &v).unwrap();
        assert!(!v.is_freed());
        assert_eq!(v.refcount(), 1);
    }

    #[test]
    fn delete_releases_key_and_value() {
        let host = TrackedHost::new();
        let (mut m, pairs) = int_map(&host, 3);
        let (k, v) = &pairs[1];
        m.delete(&host.int(1)).unwrap();
        assert_eq!(k.refcount(), 1);
        assert_eq!(v.refcount(), 1);
        assert_eq!(m.len(), 2);

        let before = (host.total_acquires(), host.total_releases());
        assert_eq!(m.delete(k), Err(MapError::KeyNotFound));
        assert_eq!((host.total_acquires(), host.total_releases()), before);
    }

    #[test]
    fn pop_present_transfers_value_and_releases_key() {
        let host = TrackedHost::new();
        let (mut m, pairs) = int_map(&host, 2);
        let (k, v) = &pairs[0];
        let (va, vr) = (v.acquires(), v.releases());
        let popped = m.pop(k, None).unwrap();
        assert!(popped.is(v));
        assert_eq!((v.acquires(), v.releases()), (va, vr));
        assert_eq!(k.releases(), 1);
        assert_eq!(m.len(), 1);
        drop(popped);
        assert_eq!(v.refcount(), 1);
    }

    #[test]
    fn pop_absent_yields_default_or_error() {
        let host = TrackedHost::new();
        let (mut m, _pairs) = int_map(&host, 2);
        let d = host.str("d");
        let got = m.pop(&host.int(7), Some(&d)).unwrap();
        assert!(got.is(&d));
        assert_eq!(d.acquires(), 1);
        assert_eq!(m.len(), 2);
        assert_eq!(m.pop(&host.int(7), None).err(), Some(MapError::KeyNotFound));
    }

    #[test]
    fn pop_item_drains_every_entry_once() {
        let host = TrackedHost::new();
        let (mut m, pairs) = int_map(&host, 5);
        let mut seen = Vec::new();
        while let Ok((k, v)) = m.pop_item() {
            assert_eq!(v.as_int(), k.as_int().map(|i| i * 10));
            seen.push(k.as_int().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(m.pop_item().err(), Some(MapError::EmptyContainer));
        for (k, v) in &pairs {
            assert_eq!(k.refcount(), 1);
            assert_eq!(v.refcount(), 1);
        }
    }

    #[test]
    fn peek_item_peeks_what_pop_item_removes() {
        let host = TrackedHost::new();
        let (mut m, _pairs) = int_map(&host, 3);
        let (pk, pv) = {
            let (k, v) = m.peek_item().unwrap();
            (k.clone(), v.clone())
        };
        let (k, v) = m.pop_item().unwrap();
        assert!(k.is(&pk));
        assert!(v.is(&pv));
    }

    #[test]
    fn clear_releases_everything_and_is_idempotent() {
        let host = TrackedHost::new();
        let (mut m, _pairs) = int_map(&host, 4);
        m.clear();
        assert!(m.is_empty());
        assert_eq!(host.outstanding(), 0);
        m.clear();
        assert_eq!(host.outstanding(), 0);
    }

    #[test]
    fn drop_releases_everything() {
        let host = TrackedHost::new();
        let (m, pairs) = int_map(&host, 4);
        assert_eq!(host.outstanding(), 8);
        drop(m);
        assert_eq!(host.outstanding(), 0);
        assert!(pairs.iter().all(|(k, v)| k.refcount() == 1 && v.refcount() == 1));
    }

    #[test]
    fn copy_is_an_independent_owner() {
        let host = TrackedHost::new();
        let (m, pairs) = int_map(&host, 3);
        let mut c = m.copy().unwrap();
        let (k, v) = &pairs[0];
        assert_eq!(k.refcount(), 3);
        assert_eq!(v.refcount(), 3);

        c.delete(k).unwrap();
        assert!(m.get(k).unwrap().is(v));
        assert_eq!(k.refcount(), 2);
        assert_eq!(v.refcount(), 2);
        assert_eq!(c.len(), 2);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn insert_transfers_and_returns_displaced_value() {
        let host = TrackedHost::new();
        let mut m = HostMap::new();
        let k = host.str("k");
        let (v1, v2) = (host.int(1), host.int(2));
        let out = m
            .insert(Owned::acquire(&k), Owned::acquire(&v1))
            .unwrap();
        assert!(out.is_none());
        assert_eq!(k.refcount(), 2);

        let dup_key = host.str("k");
        let old = m
            .insert(Owned::acquire(&dup_key), Owned::acquire(&v2))
            .unwrap()
            .unwrap();
        assert!(old.is(&v1));
        // The duplicate key reference was released; the original is kept.
        assert_eq!(dup_key.refcount(), 1);
        assert_eq!(k.refcount(), 2);
    }

    #[test]
    fn set_default_inserts_only_when_absent() {
        let host = TrackedHost::new();
        let mut m = HostMap::new();
        let (k, d1, d2) = (host.str("k"), host.int(1), host.int(2));
        let first = m.set_default(&k, &d1).unwrap();
        assert!(first.is(&d1));
        // One for the map, one for the caller.
        assert_eq!(d1.refcount(), 3);
        let second = m.set_default(&k, &d2).unwrap();
        assert!(second.is(&d1));
        assert_eq!(d2.acquires(), 0);
    }

    #[test]
    fn from_keys_shares_one_value() {
        let host = TrackedHost::new();
        let keys: Vec<_> = (0..3).map(|i| host.int(i)).collect();
        let v = host.none_obj();
        let m = HostMap::from_keys(&keys, &v).unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(v.acquires(), 3);
        drop(m);
        assert_eq!(host.outstanding(), 0);
    }

    #[test]
    fn snapshots_acquire_for_the_caller() {
        let host = TrackedHost::new();
        let (m, _pairs) = int_map(&host, 3);
        let keys = m.keys();
        let values = m.values();
        let items = m.items();
        assert_eq!(keys.len(), 3);
        assert_eq!(values.len(), 3);
        assert_eq!(items.len(), 3);
        assert_eq!(host.outstanding(), 6 + 3 + 3 + 6);
        drop((keys, values, items));
        assert_eq!(host.outstanding(), 6);
    }

    #[test]
    fn failed_reserve_leaves_counts_untouched() {
        let host = TrackedHost::new();
        let (mut m, _pairs) = int_map(&host, 2);
        let before = (host.total_acquires(), host.total_releases());
        assert!(matches!(
            m.try_reserve(usize::MAX),
            Err(MapError::ResourceExhausted { .. })
        ));
        assert_eq!((host.total_acquires(), host.total_releases()), before);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn rejected_insert_hands_both_references_back() {
        let host = TrackedHost::new();
        let (mut m, _pairs) = int_map(&host, 2);
        let (k, v) = (host.str("k"), host.int(1));
        let before = (host.total_acquires(), host.total_releases());
        let rejected = m
            .insert_reserving(Owned::acquire(&k), Owned::acquire(&v), 1 << 60)
            .unwrap_err();
        assert!(matches!(rejected.error, MapError::ResourceExhausted { .. }));
        assert!(rejected.key.is(&k));
        assert!(rejected.value.is(&v));
        // Only the two acquires made for the call; the map took nothing.
        assert_eq!(
            (host.total_acquires(), host.total_releases()),
            (before.0 + 2, before.1)
        );
        assert_eq!(m.len(), 2);
        assert!(!m.contains_key(&k));
        drop(rejected);
        assert_eq!((k.refcount(), v.refcount()), (1, 1));
    }

    #[test]
    fn pop_item_takes_the_newest_entry() {
        let host = TrackedHost::new();
        let (mut m, pairs) = int_map(&host, 4);
        let (k, v) = m.pop_item().unwrap();
        assert!(k.is(&pairs[3].0));
        assert!(v.is(&pairs[3].1));
    }
}
