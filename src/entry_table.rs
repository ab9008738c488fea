//! EntryTable: structural layer with stable handles over host-owned entries.
//!
//! Entries live in a `DenseSlotMap`; a hashbrown `HashTable` indexes them by the
//! (re-mixed) host hash. Each entry owns one reference to its key and one to
//! its value, so the ownership ledger is simply "one `Entry` per live pair".
//! The table never calls into host code while it is structurally
//! inconsistent: only `host_hash`/`host_eq` run during probing, under the
//! reentrancy guard. References leaving the table are handed back to the
//! caller as `Owned` values and are released after the table is
//! consistent again.

use crate::error::MapError;
use crate::host::HostObject;
use crate::owned::Owned;
use crate::reentrancy::DebugReentrancy;
use core::hash::BuildHasher;
use hashbrown::HashTable;
use slotmap::{DefaultKey, DenseSlotMap};
use std::collections::hash_map::RandomState;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(DefaultKey);

struct Entry<O: HostObject> {
    key: Owned<O>,
    value: Owned<O>,
    hash: u64,
}

pub struct EntryTable<O: HostObject, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    // Dense, so the newest live entry is always at the end.
    slots: DenseSlotMap<DefaultKey, Entry<O>>,
    reentrancy: DebugReentrancy,
}

impl<O: HostObject, S> EntryTable<O, S> {
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            hasher,
            index: HashTable::with_capacity(capacity),
            slots: DenseSlotMap::with_capacity_and_key(capacity),
            reentrancy: DebugReentrancy::new(),
        }
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.index.capacity().min(self.slots.capacity())
    }

    /// Make room for `additional` more entries without touching any
    /// reference count. After success, that many inserts will not allocate.
    /// Either allocation failing is reported, never aborted on.
    pub fn reserve(&mut self, additional: usize) -> Result<(), MapError> {
        let _g = self.reentrancy.enter("reserve");
        self.slots
            .try_reserve(additional)
            .map_err(|_| MapError::ResourceExhausted { additional })?;
        let slots = &self.slots;
        self.index
            .try_reserve(additional, |&k| slots.get(k).map(|e| e.hash).unwrap_or(0))
            .map_err(|_| MapError::ResourceExhausted { additional })?;
        Ok(())
    }

    pub fn find_hashed(&self, hash: u64, key: &O) -> Option<Handle> {
        let _g = self.reentrancy.enter("find");
        self.index
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.hash == hash && e.key.host_eq(key))
                    .unwrap_or(false)
            })
            .map(|&k| Handle(k))
    }

    /// Link a new entry. The caller guarantees that no equal key is present.
    pub fn insert_hashed(&mut self, hash: u64, key: Owned<O>, value: Owned<O>) -> Handle {
        let _g = self.reentrancy.enter("insert");
        let k = self.slots.insert(Entry { key, value, hash });
        let slots = &self.slots;
        self.index
            .insert_unique(hash, k, |&kk| slots.get(kk).map(|e| e.hash).unwrap_or(0));
        Handle(k)
    }

    pub fn key(&self, h: Handle) -> Option<&O> {
        self.slots.get(h.0).map(|e| e.key.get())
    }

    pub fn value(&self, h: Handle) -> Option<&O> {
        self.slots.get(h.0).map(|e| e.value.get())
    }

    /// The owning reference stored for an entry's value.
    pub fn value_mut(&mut self, h: Handle) -> Option<&mut Owned<O>> {
        self.slots.get_mut(h.0).map(|e| &mut e.value)
    }

    /// Unlink an entry and return its references to the caller.
    pub fn remove(&mut self, h: Handle) -> Option<(Owned<O>, Owned<O>)> {
        let _g = self.reentrancy.enter("remove");
        let entry = self.slots.remove(h.0)?;
        if let Ok(occupied) = self.index.find_entry(entry.hash, |&kk| kk == h.0) {
            occupied.remove();
        }
        Some((entry.key, entry.value))
    }

    /// The most recently placed live entry, if any. Constant time, so
    /// draining the table one entry at a time stays linear.
    pub fn last(&self) -> Option<Handle> {
        self.slots.keys_as_slice().last().copied().map(Handle)
    }

    /// Unlink every entry at once. The returned iterator owns the
    /// references; releasing happens as it is consumed or dropped, after
    /// the table is already empty.
    pub fn take_all(&mut self) -> impl Iterator<Item = (Owned<O>, Owned<O>)> {
        let _g = self.reentrancy.enter("take_all");
        self.index.clear();
        let slots = core::mem::take(&mut self.slots);
        slots.into_iter().map(|(_, e)| (e.key, e.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &O, &O)> {
        self.slots
            .iter()
            .map(|(k, e)| (Handle(k), e.key.get(), e.value.get()))
    }

    /// Entries with their stored hashes, for rebuilding a table with the
    /// same hasher without calling back into the host.
    pub(crate) fn iter_hashed(&self) -> impl Iterator<Item = (u64, &O, &O)> {
        self.slots
            .values()
            .map(|e| (e.hash, e.key.get(), e.value.get()))
    }
}

impl<O: HostObject, S: BuildHasher> EntryTable<O, S> {
    /// Host hash spread through `S`, computed once per lookup.
    pub fn hash_of(&self, key: &O) -> u64 {
        let _g = self.reentrancy.enter("hash");
        self.hasher.hash_one(key.host_hash())
    }

    pub fn find(&self, key: &O) -> Option<Handle> {
        let hash = self.hash_of(key);
        self.find_hashed(hash, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracked::TrackedHost;
    use std::collections::BTreeSet;

    fn table() -> EntryTable<crate::tracked::Obj> {
        EntryTable::with_capacity_and_hasher(0, RandomState::new())
    }

    /// Entries own their references; removing hands them back.
    #[test]
    fn insert_and_remove_move_references() {
        let host = TrackedHost::new();
        let (k, v) = (host.str("k"), host.int(1));
        let mut t = table();
        let hash = t.hash_of(&k);
        let h = t.insert_hashed(hash, Owned::acquire(&k), Owned::acquire(&v));
        assert_eq!(k.refcount(), 2);
        assert_eq!(v.refcount(), 2);
        assert!(t.key(h).unwrap().is(&k));
        assert!(t.value(h).unwrap().is(&v));

        let (rk, rv) = t.remove(h).unwrap();
        assert!(t.is_empty());
        assert!(t.key(h).is_none());
        // Still owned by the returned guards.
        assert_eq!(k.refcount(), 2);
        drop((rk, rv));
        assert_eq!(k.refcount(), 1);
        assert_eq!(v.refcount(), 1);
    }

    /// Lookup uses host equality, not identity.
    #[test]
    fn find_matches_equal_but_distinct_keys() {
        let host = TrackedHost::new();
        let mut t = table();
        let k1 = host.str("same");
        let k2 = host.str("same");
        assert!(!k1.is(&k2));
        let hash = t.hash_of(&k1);
        let h = t.insert_hashed(hash, Owned::acquire(&k1), Owned::acquire(&host.int(0)));
        assert_eq!(t.find(&k2), Some(h));
        assert_eq!(t.find(&host.str("other")), None);
    }

    /// Colliding host hashes are resolved by equality.
    #[test]
    fn hash_collisions_are_disambiguated() {
        let host = TrackedHost::new();
        let mut t = table();
        let a = host.colliding("a", 7);
        let b = host.colliding("b", 7);
        let ha = t.hash_of(&a);
        let hb = t.hash_of(&b);
        assert_eq!(ha, hb);
        let va = host.int(1);
        let vb = host.int(2);
        let h1 = t.insert_hashed(ha, Owned::acquire(&a), Owned::acquire(&va));
        let h2 = t.insert_hashed(hb, Owned::acquire(&b), Owned::acquire(&vb));
        assert_ne!(h1, h2);
        assert!(t.value(t.find(&a).unwrap()).unwrap().is(&va));
        assert!(t.value(t.find(&b).unwrap()).unwrap().is(&vb));
    }

    /// Swapping the stored value reference hands the displaced one back.
    #[test]
    fn value_mut_swaps_stored_reference() {
        let host = TrackedHost::new();
        let mut t = table();
        let k = host.str("k");
        let (v1, v2) = (host.int(1), host.int(2));
        let hash = t.hash_of(&k);
        let h = t.insert_hashed(hash, Owned::acquire(&k), Owned::acquire(&v1));
        let slot = t.value_mut(h).unwrap();
        let old = core::mem::replace(slot, Owned::acquire(&v2));
        assert!(old.is(&v1));
        drop(old);
        assert_eq!(v1.refcount(), 1);
        assert_eq!(v2.refcount(), 2);

        t.remove(h);
        assert!(t.value_mut(h).is_none());
    }

    #[test]
    fn failed_reserve_reports_exhaustion() {
        let mut t = table();
        assert_eq!(
            t.reserve(usize::MAX),
            Err(MapError::ResourceExhausted {
                additional: usize::MAX
            })
        );
        assert!(t.is_empty());
    }

    /// `take_all` empties the table before any reference is released.
    #[test]
    fn take_all_unlinks_then_releases() {
        let host = TrackedHost::new();
        let mut t = table();
        let keys: Vec<_> = (0..4).map(|i| host.int(i)).collect();
        for k in &keys {
            let hash = t.hash_of(k);
            t.insert_hashed(hash, Owned::acquire(k), Owned::acquire(k));
        }
        assert_eq!(keys[0].refcount(), 3);
        let drained = t.take_all();
        let mut seen = BTreeSet::new();
        for (k, _v) in drained {
            seen.insert(k.as_int().unwrap());
        }
        assert!(t.is_empty());
        assert_eq!(seen, (0..4).collect());
        for k in &keys {
            assert_eq!(k.refcount(), 1);
        }
    }

    #[test]
    fn reserve_keeps_counts_untouched() {
        let host = TrackedHost::new();
        let mut t = table();
        t.reserve(64).unwrap();
        assert!(t.capacity() >= 64);
        let k = host.int(1);
        let hash = t.hash_of(&k);
        t.insert_hashed(hash, Owned::acquire(&k), Owned::acquire(&k));
        assert_eq!(t.last().and_then(|h| t.key(h)).map(|o| o.is(&k)), Some(true));
        assert_eq!(k.acquires(), 2);
        assert_eq!(k.releases(), 0);
    }

    /// A slot reservation the index could satisfy but the entry storage
    /// cannot is still reported, with nothing linked or acquired.
    #[test]
    fn oversized_slot_reservation_reports_exhaustion() {
        let host = TrackedHost::new();
        let mut t = table();
        let k = host.int(1);
        let hash = t.hash_of(&k);
        t.insert_hashed(hash, Owned::acquire(&k), Owned::acquire(&k));
        let before = t.capacity();
        let additional = 1usize << 60;
        assert_eq!(
            t.reserve(additional),
            Err(MapError::ResourceExhausted { additional })
        );
        assert_eq!(t.len(), 1);
        assert_eq!(t.capacity(), before);
        assert_eq!(k.acquires(), 2);
        assert_eq!(k.releases(), 0);
    }

    /// `last` tracks removals so popping one by one visits every entry.
    #[test]
    fn last_follows_removals() {
        let host = TrackedHost::new();
        let mut t = table();
        let keys: Vec<_> = (0..5).map(|i| host.int(i)).collect();
        for k in &keys {
            let hash = t.hash_of(k);
            t.insert_hashed(hash, Owned::acquire(k), Owned::acquire(k));
        }
        let newest = t.last().unwrap();
        assert!(t.key(newest).unwrap().is(&keys[4]));

        let middle = t.find(&keys[2]).unwrap();
        drop(t.remove(middle));
        let mut seen = BTreeSet::new();
        while let Some(h) = t.last() {
            let (k, _v) = t.remove(h).unwrap();
            assert!(seen.insert(k.as_int().unwrap()));
        }
        assert_eq!(seen, [0, 1, 3, 4].into_iter().collect());
    }
}
