//! Ownership coordination across instances sharing one store.

mod death_note;
mod ownership;

pub use death_note::{DeathNote, watch_death_note};
pub use ownership::{OwnershipCoordinator, StartupError, StartupSummary};
