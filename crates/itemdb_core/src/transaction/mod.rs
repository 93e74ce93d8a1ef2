//! Transaction control: the autocommit/explicit-transaction boundary.
//!
//! One explicit transaction can be open per connection at a time, owned by
//! the root store and shared by its attached children. Outside a
//! transaction the store runs in autocommit mode: every mutating operation
//! is checkpointed the moment it happens.

mod controller;
mod state;

pub(crate) use state::TxnState;
