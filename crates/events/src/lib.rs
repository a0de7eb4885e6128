//! Watch events and the notifier seam used to deliver them.

pub mod event;
pub mod notifier;

pub use event::{WatchEnvelope, WatchEvent};
pub use notifier::{InMemoryNotifier, NoopNotifier, NotifyError, StatusNotifier};
