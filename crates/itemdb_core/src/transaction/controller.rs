//! The transaction controller: BEGIN IMMEDIATE / COMMIT / ROLLBACK.

use crate::error::EngineResult;
use crate::item::ItemRef;
use crate::store::{Store, StoreInner};
use crate::transaction::TxnState;
use std::rc::Rc;

impl StoreInner {
    /// Runs `f` inside the connection's transaction.
    ///
    /// Re-entry is a no-op: when a transaction is already open (here or on
    /// the attachment root), `f` runs directly under it. Otherwise a fresh
    /// `BEGIN IMMEDIATE` transaction wraps the call: on success every
    /// touched item is flushed in id order, the transaction commits, and
    /// post-commit hooks run; on failure the transaction rolls back, every
    /// touched item reverts in memory, tables provisioned during the
    /// transaction are forgotten, and the error is re-raised.
    pub(crate) fn transact_inner<T>(
        &self,
        f: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let root = self.root();
        if root.txn.borrow().is_some() {
            return f();
        }
        root.ensure_mutable()?;
        root.conn().execute("BEGIN IMMEDIATE TRANSACTION", &[])?;
        for store in root.family() {
            *store.txn.borrow_mut() = Some(TxnState::new());
        }

        let run = f().and_then(|value| {
            root.flush_touched()?;
            Ok(value)
        });
        match run {
            Ok(value) => match root.conn().execute("COMMIT", &[]) {
                Ok(_) => {
                    root.finish_commit()?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = root.conn().execute("ROLLBACK", &[]);
                    root.finish_rollback();
                    Err(err.into())
                }
            },
            Err(err) => {
                let _ = root.conn().execute("ROLLBACK", &[]);
                root.finish_rollback();
                Err(err)
            }
        }
    }

    /// Post-COMMIT phase: detach deleted items, clear creation flags, and
    /// run per-item hooks in store-id order. Hooks observe a store where
    /// every touched item is fully persisted or fully deleted; mutations
    /// from inside a hook are rejected.
    fn finish_commit(&self) -> EngineResult<()> {
        let mut finished: Vec<(Rc<StoreInner>, ItemRef)> = Vec::new();
        for store in self.family() {
            let state = store.txn.borrow_mut().take();
            if let Some(state) = state {
                for item in state.touched.values() {
                    finished.push((Rc::clone(&store), item.clone()));
                }
            }
        }

        self.in_post_commit.set(true);
        let mut result = Ok(());
        for (store, item) in &finished {
            if let Some(hook) = item.commit_hook() {
                if let Err(err) = hook(&Store::from_inner(Rc::clone(store)), item) {
                    result = Err(err);
                    break;
                }
            }
        }
        self.in_post_commit.set(false);

        // Deleted items leave the cache and detach only once their hooks
        // have observed the committed state.
        for (store, item) in &finished {
            item.finalize_commit(store);
        }
        result
    }

    /// Post-ROLLBACK phase: revert touched items in memory, drop cache
    /// entries swapped in by upgrade steps, and evict tables provisioned
    /// during the transaction from the in-memory type maps.
    fn finish_rollback(&self) {
        for store in self.family() {
            let state = store.txn.borrow_mut().take();
            let Some(state) = state else { continue };
            for item in state.touched.values() {
                if let Err(err) = item.revert(&store) {
                    tracing::warn!(
                        store_id = item.store_id().as_i64(),
                        error = %err,
                        "in-memory revert failed"
                    );
                }
            }
            for id in &state.upgraded {
                if let Ok(Some(cell)) = store.cache.get(*id) {
                    cell.borrow_mut().detached = true;
                }
                store.cache_evict(*id);
            }
            store.forget_tables(&state.tables_created);
        }
    }
}

impl Store {
    /// Runs `f` inside a transaction.
    ///
    /// Nested calls run directly under the open transaction; the outermost
    /// call owns BEGIN/COMMIT/ROLLBACK. See [`Store`] docs for the full
    /// ordering guarantees.
    pub fn transact<T>(&self, f: impl FnOnce(&Store) -> EngineResult<T>) -> EngineResult<T> {
        let handle = self.clone();
        self.inner.transact_inner(move || f(&handle))
    }
}

#[cfg(test)]
mod tests {
    use crate::attribute::{AttributeDescriptor, AttributeKind};
    use crate::error::EngineError;
    use crate::schema::{SchemaRegistry, TypeBuilder};
    use crate::store::Store;
    use crate::types::StoreId;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        registry
            .declare(
                TypeBuilder::new("txn.note", 1)
                    .attribute(AttributeDescriptor::new("body", AttributeKind::text()))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn store() -> Store {
        Store::open_in_memory(registry()).unwrap()
    }

    #[test]
    fn commit_makes_changes_durable() {
        let store = store();
        let id = store
            .transact(|s| {
                let item = s.create("txn.note", &[("body", Value::from("hello"))])?;
                Ok(item.store_id())
            })
            .unwrap();
        let item = store.load(id).unwrap();
        assert_eq!(item.get("body").unwrap(), Value::from("hello"));
    }

    #[test]
    fn nested_transact_is_reentrant() {
        let store = store();
        store
            .transact(|s| {
                assert!(s.in_transaction());
                s.transact(|inner| {
                    inner.create("txn.note", &[("body", Value::from("nested"))])?;
                    Ok(())
                })
            })
            .unwrap();
        assert!(!store.in_transaction());
        assert_eq!(store.query("txn.note").count().unwrap(), 1);
    }

    #[test]
    fn rollback_removes_created_items() {
        let store = store();
        let mut created = None;
        let result: Result<(), EngineError> = store.transact(|s| {
            let item = s.create("txn.note", &[("body", Value::from("doomed"))])?;
            created = Some((item.store_id(), item.clone()));
            Err(EngineError::misuse("abort"))
        });
        assert!(result.is_err());

        let (id, item) = created.unwrap();
        assert!(item.is_detached());
        assert!(matches!(store.load(id), Err(EngineError::ItemNotFound)));
        assert_eq!(store.query("txn.note").count().unwrap(), 0);
    }

    #[test]
    fn rollback_reverts_in_memory_state() {
        let store = store();
        let item = store
            .create("txn.note", &[("body", Value::from("original"))])
            .unwrap();

        let result: Result<(), EngineError> = store.transact(|_| {
            item.set("body", Value::from("changed"))?;
            assert_eq!(item.get("body").unwrap(), Value::from("changed"));
            Err(EngineError::misuse("abort"))
        });
        assert!(result.is_err());
        assert_eq!(item.get("body").unwrap(), Value::from("original"));
    }

    #[test]
    fn rollback_undoes_pending_delete() {
        let store = store();
        let item = store
            .create("txn.note", &[("body", Value::from("keep"))])
            .unwrap();

        let result: Result<(), EngineError> = store.transact(|_| {
            item.delete()?;
            Err(EngineError::misuse("abort"))
        });
        assert!(result.is_err());
        assert!(!item.is_detached());
        assert_eq!(item.get("body").unwrap(), Value::from("keep"));
    }

    #[test]
    fn writes_are_flushed_before_queries_in_transaction() {
        let store = store();
        store
            .transact(|s| {
                s.create("txn.note", &[("body", Value::from("a"))])?;
                // The SELECT must observe the flush of the touched set.
                assert_eq!(s.query("txn.note").count()?, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn committed_hooks_run_in_id_order_after_commit() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);

        let registry = SchemaRegistry::new();
        registry
            .declare(
                TypeBuilder::new("txn.hooked", 1)
                    .attribute(AttributeDescriptor::new("n", AttributeKind::Integer))
                    .on_committed(move |_, item| {
                        seen.lock().unwrap().push(item.store_id().as_i64());
                        Ok(())
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let store = Store::open_in_memory(Arc::new(registry)).unwrap();

        store
            .transact(|s| {
                // Create out of order; hooks still fire in id order.
                let a = s.create("txn.hooked", &[("n", Value::Integer(1))])?;
                let b = s.create("txn.hooked", &[("n", Value::Integer(2))])?;
                b.set("n", Value::Integer(20))?;
                a.set("n", Value::Integer(10))?;
                Ok(())
            })
            .unwrap();

        let calls = order.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[0] < calls[1]);
    }

    #[test]
    fn hooks_cannot_mutate_the_store() {
        let registry = SchemaRegistry::new();
        registry
            .declare(
                TypeBuilder::new("txn.hooked", 1)
                    .attribute(AttributeDescriptor::new("n", AttributeKind::Integer))
                    .on_committed(|_, item| item.set("n", Value::Integer(99)))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let store = Store::open_in_memory(Arc::new(registry)).unwrap();

        let result = store.transact(|s| {
            s.create("txn.hooked", &[("n", Value::Integer(1))])?;
            Ok(())
        });
        assert!(matches!(result, Err(EngineError::ChangeRejected)));
    }

    #[test]
    fn deleted_hook_runs_after_deletion_commits() {
        static DELETED: AtomicUsize = AtomicUsize::new(0);

        let registry = SchemaRegistry::new();
        registry
            .declare(
                TypeBuilder::new("txn.hooked", 1)
                    .attribute(AttributeDescriptor::new("n", AttributeKind::Integer))
                    .on_deleted(|_, _| {
                        DELETED.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let store = Store::open_in_memory(Arc::new(registry)).unwrap();

        let item = store.create("txn.hooked", &[("n", Value::Integer(1))]).unwrap();
        let id = item.store_id();
        store.transact(|_| item.delete()).unwrap();

        assert_eq!(DELETED.load(Ordering::SeqCst), 1);
        assert!(item.is_detached());
        assert!(matches!(store.load(id), Err(EngineError::ItemNotFound)));
    }

    #[test]
    fn attached_children_share_the_transaction() {
        let store = store();
        let child = store.attach_child("side").unwrap();

        let result: Result<(), EngineError> = store.transact(|s| {
            s.create("txn.note", &[("body", Value::from("parent"))])?;
            child.create("txn.note", &[("body", Value::from("child"))])?;
            assert!(child.in_transaction());
            Err(EngineError::misuse("abort"))
        });
        assert!(result.is_err());

        assert_eq!(store.query("txn.note").count().unwrap(), 0);
        assert_eq!(child.query("txn.note").count().unwrap(), 0);

        store
            .transact(|s| {
                s.create("txn.note", &[("body", Value::from("parent"))])?;
                child.create("txn.note", &[("body", Value::from("child"))])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.query("txn.note").count().unwrap(), 1);
        assert_eq!(child.query("txn.note").count().unwrap(), 1);
    }

    #[test]
    fn rolled_back_ids_are_not_left_in_objects() {
        let store = store();
        let _ = store.transact(|s| {
            s.create("txn.note", &[("body", Value::from("gone"))])?;
            Err::<(), _>(EngineError::misuse("abort"))
        });
        // The id allocated in the rolled-back transaction is absent.
        assert!(matches!(
            store.load(StoreId::new(1)),
            Err(EngineError::ItemNotFound)
        ));
    }
}
