use std::path::PathBuf;

use async_trait::async_trait;

use super::FleetError;

/// Everything needed to (re)create a named process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created but never started.
    Created,
    Running,
    /// `code` is `None` when the process was killed by a signal.
    Exited { code: Option<i32> },
    /// The runtime does not know the process.
    Missing,
}

impl ProcessState {
    pub fn is_running(self) -> bool {
        matches!(self, ProcessState::Running)
    }

    /// Exited on its own with status 0.
    pub fn is_clean_exit(self) -> bool {
        matches!(self, ProcessState::Exited { code: Some(0) })
    }
}

/// Lifecycle operations on named processes.
#[async_trait]
pub trait ProcessRuntime: Send + Sync + 'static {
    /// Create the process, tearing down any previous one with the same name.
    async fn create_or_replace(&self, spec: &ProcessSpec) -> Result<ProcessHandle, FleetError>;

    async fn start(&self, handle: &ProcessHandle) -> Result<(), FleetError>;

    async fn inspect(&self, handle: &ProcessHandle) -> Result<ProcessState, FleetError>;

    /// Stop (if running) and start again with the same spec.
    async fn restart(&self, handle: &ProcessHandle) -> Result<(), FleetError>;

    /// Stop (if running) and forget the process.
    async fn remove(&self, handle: &ProcessHandle) -> Result<(), FleetError>;
}
