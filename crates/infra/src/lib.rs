//! Infrastructure layer: storage, scheduling, the pipeline stages and the
//! tenant worker fleet.

pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod fanout;
pub mod fleet;
pub mod scheduler;
pub mod store;
pub mod watcher;
pub mod workers;

mod integration_tests;
