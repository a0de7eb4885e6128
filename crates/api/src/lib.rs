//! Service layer: the watcher HTTP surface, the HTTP watcher client and the
//! wiring behind each pipeline binary.

pub mod app;
pub mod client;
pub mod services;
