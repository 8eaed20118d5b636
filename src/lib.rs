//! Chartfleet - ownership, deferred-event scheduling and activity tracking
//! for statechart instances that share one Postgres store.

pub mod activities;
pub mod backends;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod host;
pub mod instance;
pub mod lifecycle;
pub mod model;
pub mod observability;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use activities::ActivityRegistry;
pub use backends::{BackendError, BackendResult, MemoryBackend, PostgresBackend};
pub use config::{Config, ConfigError, DeferredEventsConfig, EngineConfig, StartupConfig};
pub use coordinator::{
    DeathNote, OwnershipCoordinator, StartupError, StartupSummary, watch_death_note,
};
pub use host::{Activity, ActivityError, ChartRuntime, DeliveryError};
pub use instance::Instance;
pub use lifecycle::DyingFlag;
pub use model::{
    ChartRecord, ChartRef, DeferredEvent, DeferredEventId, InstanceId, NewChart, NewDeferredEvent,
};
pub use scheduler::DeferredEventScheduler;
