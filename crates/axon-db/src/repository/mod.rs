//! Table-level persistence. One module per table, schema constant at the
//! top, plain functions below. Write paths take a transaction connection
//! so callers compose multi-table mutations atomically; read paths take
//! the pool directly.

pub mod blobs;
pub mod ledger;
pub mod queue;
