//! The powerup registry: interface-keyed extension of host items.
//!
//! Powerups are ordinary items bound to a host through the built-in link
//! type, one row per `(host, interface, powerup, priority)`. Adaptation
//! walks the links in descending priority, resolving indirectors along
//! the way.

use crate::error::{EngineError, EngineResult};
use crate::item::ItemRef;
use crate::query::{and, column, store_id_column, SortDirection};
use crate::schema::{INDIRECTOR_INTERFACE, POWERUP_LINK_TYPE};
use crate::store::Store;
use crate::value::Value;
use std::rc::Rc;

impl Store {
    fn ensure_mine(&self, item: &ItemRef) -> EngineResult<()> {
        let owner = item.owning_store()?;
        if Rc::ptr_eq(&owner, &self.inner) {
            Ok(())
        } else {
            Err(EngineError::NoCrossStoreReferences)
        }
    }

    /// Installs (or re-prioritizes) a powerup on a host for an interface.
    ///
    /// Upserts the link row: powering up twice with a new priority moves
    /// the existing link rather than adding a second one.
    ///
    /// # Errors
    ///
    /// The indirector interface is a forbidden target (resolving it would
    /// recurse); host and powerup must live in this store.
    pub fn power_up(
        &self,
        host: &ItemRef,
        interface: &str,
        powerup: &ItemRef,
        priority: i64,
    ) -> EngineResult<ItemRef> {
        if interface == INDIRECTOR_INTERFACE {
            return Err(EngineError::misuse(
                "cannot power up for the indirector interface",
            ));
        }
        self.ensure_mine(host)?;
        self.ensure_mine(powerup)?;

        let existing = self.find_first(
            POWERUP_LINK_TYPE,
            Some(and(vec![
                column(POWERUP_LINK_TYPE, "host").eq(Value::Reference(host.store_id())),
                column(POWERUP_LINK_TYPE, "interface").eq(interface),
                column(POWERUP_LINK_TYPE, "powerup").eq(Value::Reference(powerup.store_id())),
            ])),
        )?;
        match existing {
            Some(link) => {
                link.set("priority", Value::Integer(priority))?;
                Ok(link)
            }
            None => self.create(
                POWERUP_LINK_TYPE,
                &[
                    ("host", Value::Reference(host.store_id())),
                    ("interface", Value::from(interface)),
                    ("powerup", Value::Reference(powerup.store_id())),
                    ("priority", Value::Integer(priority)),
                ],
            ),
        }
    }

    /// Removes a powerup from a host for an interface.
    ///
    /// Returns whether a link existed.
    pub fn power_down(
        &self,
        host: &ItemRef,
        interface: &str,
        powerup: &ItemRef,
    ) -> EngineResult<bool> {
        let existing = self.find_first(
            POWERUP_LINK_TYPE,
            Some(and(vec![
                column(POWERUP_LINK_TYPE, "host").eq(Value::Reference(host.store_id())),
                column(POWERUP_LINK_TYPE, "interface").eq(interface),
                column(POWERUP_LINK_TYPE, "powerup").eq(Value::Reference(powerup.store_id())),
            ])),
        )?;
        match existing {
            Some(link) => {
                link.delete()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Yields the host's powerups for an interface, strongest first.
    ///
    /// Priority descends; ties break by insertion order. A powerup whose
    /// type has a registered indirector is not yielded directly - its
    /// indirection for the interface is yielded instead.
    pub fn powerups_for(&self, host: &ItemRef, interface: &str) -> EngineResult<Vec<ItemRef>> {
        self.ensure_mine(host)?;
        let links = self
            .query(POWERUP_LINK_TYPE)
            .filter(and(vec![
                column(POWERUP_LINK_TYPE, "host").eq(Value::Reference(host.store_id())),
                column(POWERUP_LINK_TYPE, "interface").eq(interface),
            ]))
            .sort(
                column(POWERUP_LINK_TYPE, "priority"),
                SortDirection::Descending,
            )
            .sort(store_id_column(POWERUP_LINK_TYPE), SortDirection::Ascending)
            .fetch()?;

        let mut out = Vec::with_capacity(links.len());
        for link in links {
            let powerup = link
                .reference("powerup")?
                .ok_or_else(|| EngineError::misuse("powerup link without a powerup"))?;
            match self.registry().indirector(&powerup.type_name()) {
                Some(indirect) => out.push(indirect(self, &powerup, interface)?),
                None => out.push(powerup),
            }
        }
        Ok(out)
    }

    /// Adapts a host to an interface, returning the strongest powerup.
    ///
    /// # Errors
    ///
    /// [`EngineError::ItemNotFound`] when no powerup matches. Interfaces
    /// flagged aggregate must go through [`Store::adapt_all`].
    pub fn adapt(&self, host: &ItemRef, interface: &str) -> EngineResult<ItemRef> {
        if self.registry().is_aggregate_interface(interface) {
            return Err(EngineError::misuse(format!(
                "{interface} is an aggregate interface; adapt_all returns the composite"
            )));
        }
        self.powerups_for(host, interface)?
            .into_iter()
            .next()
            .ok_or(EngineError::ItemNotFound)
    }

    /// Adapts a host to an aggregate interface: the composite of every
    /// matching powerup, strongest first.
    pub fn adapt_all(&self, host: &ItemRef, interface: &str) -> EngineResult<Vec<ItemRef>> {
        self.powerups_for(host, interface)
    }
}
