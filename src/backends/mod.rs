//! Store backends for instance coordination.

mod base;
mod memory;
mod postgres;

pub use base::{
    ActivityBackend, BackendError, BackendResult, ChartBackend, CoordinationBackend,
    DeferredEventBackend, InstanceBackend, OverthrowBackend,
};
pub use memory::{InstanceRow, MemoryBackend};
pub use postgres::PostgresBackend;
