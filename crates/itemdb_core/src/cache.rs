//! The per-store identity cache.
//!
//! A weak map from store id to live item state. It guarantees at most one
//! live in-memory instance per id within one store: lookups upgrade the
//! weak entry, and inserting over a live entry with a different instance is
//! an inconsistency. Entries whose instance has died surface as a cache
//! fault, which the store resolves by evicting and reloading - the fault
//! never escapes the public API.
//!
//! There are no destructor side-effects here; dead entries are collected at
//! the next lookup of their id or by an explicit sweep.

use crate::error::{EngineError, EngineResult};
use crate::types::StoreId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A weak identity map keyed by [`StoreId`].
pub(crate) struct WeakCache<T> {
    entries: RefCell<HashMap<StoreId, Weak<T>>>,
}

/// The identity cache over item state cells.
pub(crate) type ItemCache = WeakCache<RefCell<crate::item::ItemState>>;

impl<T> WeakCache<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
        }
    }

    /// Looks up a live instance.
    ///
    /// Returns `Ok(None)` when no entry exists, and a [`EngineError::CacheFault`]
    /// when an entry exists but its instance has died (the dead entry is
    /// evicted before returning).
    pub(crate) fn get(&self, id: StoreId) -> EngineResult<Option<Rc<T>>> {
        let mut entries = self.entries.borrow_mut();
        match entries.get(&id) {
            None => Ok(None),
            Some(weak) => match weak.upgrade() {
                Some(strong) => Ok(Some(strong)),
                None => {
                    entries.remove(&id);
                    Err(EngineError::CacheFault { store_id: id })
                }
            },
        }
    }

    /// Inserts an instance under its id.
    ///
    /// Refuses to replace a live entry with a different instance; replacing
    /// a dead entry or re-inserting the same instance is fine.
    pub(crate) fn insert(&self, id: StoreId, instance: &Rc<T>) -> EngineResult<()> {
        let mut entries = self.entries.borrow_mut();
        if let Some(existing) = entries.get(&id).and_then(Weak::upgrade) {
            if !Rc::ptr_eq(&existing, instance) {
                return Err(EngineError::CacheInconsistency { store_id: id });
            }
            return Ok(());
        }
        entries.insert(id, Rc::downgrade(instance));
        Ok(())
    }

    /// Removes an entry regardless of liveness.
    pub(crate) fn evict(&self, id: StoreId) {
        self.entries.borrow_mut().remove(&id);
    }

    /// Drops every dead entry, returning how many were removed.
    pub(crate) fn sweep(&self) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|_, weak| weak.strong_count() > 0);
        before - entries.len()
    }

    /// Returns the number of entries, live or dead.
    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestCache = WeakCache<RefCell<i32>>;

    #[test]
    fn miss_is_none() {
        let cache = TestCache::new();
        assert!(cache.get(StoreId::new(1)).unwrap().is_none());
    }

    #[test]
    fn insert_then_hit() {
        let cache = TestCache::new();
        let cell = Rc::new(RefCell::new(42));
        cache.insert(StoreId::new(1), &cell).unwrap();

        let hit = cache.get(StoreId::new(1)).unwrap().unwrap();
        assert!(Rc::ptr_eq(&hit, &cell));
    }

    #[test]
    fn dead_entry_is_a_fault_then_a_miss() {
        let cache = TestCache::new();
        {
            let cell = Rc::new(RefCell::new(1));
            cache.insert(StoreId::new(7), &cell).unwrap();
        }
        let err = cache.get(StoreId::new(7)).unwrap_err();
        assert!(matches!(err, EngineError::CacheFault { store_id } if store_id == StoreId::new(7)));
        // The fault evicted the entry; the next lookup is a clean miss.
        assert!(cache.get(StoreId::new(7)).unwrap().is_none());
    }

    #[test]
    fn live_entry_cannot_be_replaced() {
        let cache = TestCache::new();
        let first = Rc::new(RefCell::new(1));
        let second = Rc::new(RefCell::new(2));
        cache.insert(StoreId::new(3), &first).unwrap();

        let err = cache.insert(StoreId::new(3), &second).unwrap_err();
        assert!(matches!(err, EngineError::CacheInconsistency { .. }));

        // Re-inserting the same instance is a no-op.
        cache.insert(StoreId::new(3), &first).unwrap();
    }

    #[test]
    fn dead_entry_can_be_replaced() {
        let cache = TestCache::new();
        {
            let old = Rc::new(RefCell::new(1));
            cache.insert(StoreId::new(3), &old).unwrap();
        }
        let new = Rc::new(RefCell::new(2));
        cache.insert(StoreId::new(3), &new).unwrap();
        let hit = cache.get(StoreId::new(3)).unwrap().unwrap();
        assert!(Rc::ptr_eq(&hit, &new));
    }

    #[test]
    fn evict_removes() {
        let cache = TestCache::new();
        let cell = Rc::new(RefCell::new(1));
        cache.insert(StoreId::new(3), &cell).unwrap();
        cache.evict(StoreId::new(3));
        assert!(cache.get(StoreId::new(3)).unwrap().is_none());
    }

    #[test]
    fn sweep_collects_dead_entries() {
        let cache = TestCache::new();
        let live = Rc::new(RefCell::new(1));
        cache.insert(StoreId::new(1), &live).unwrap();
        {
            let dead = Rc::new(RefCell::new(2));
            cache.insert(StoreId::new(2), &dead).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }
}
