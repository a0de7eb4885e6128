//! Process runtime backed by local OS child processes.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::FleetError;
use super::runtime::{ProcessHandle, ProcessRuntime, ProcessSpec, ProcessState};

struct LocalProcess {
    spec: ProcessSpec,
    child: Option<Child>,
}

/// Runs workers as children of the current process. Children are killed when
/// the runtime is dropped.
#[derive(Default)]
pub struct LocalProcessRuntime {
    processes: Mutex<HashMap<String, LocalProcess>>,
}

impl LocalProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

fn spawn(spec: &ProcessSpec) -> Result<Child, FleetError> {
    let child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            FleetError::Runtime(format!("spawn {} ({}): {err}", spec.name, spec.program.display()))
        })?;
    debug!(process = %spec.name, pid = ?child.id(), "process spawned");
    Ok(child)
}

async fn stop(name: &str, child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(err) = child.kill().await {
        warn!(process = %name, error = %err, "failed to kill process");
    }
}

#[async_trait]
impl ProcessRuntime for LocalProcessRuntime {
    async fn create_or_replace(&self, spec: &ProcessSpec) -> Result<ProcessHandle, FleetError> {
        let mut processes = self.processes.lock().await;
        if let Some(mut previous) = processes.remove(&spec.name) {
            if let Some(child) = previous.child.as_mut() {
                stop(&spec.name, child).await;
            }
        }
        processes.insert(
            spec.name.clone(),
            LocalProcess {
                spec: spec.clone(),
                child: None,
            },
        );
        Ok(ProcessHandle {
            name: spec.name.clone(),
        })
    }

    async fn start(&self, handle: &ProcessHandle) -> Result<(), FleetError> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(&handle.name)
            .ok_or_else(|| FleetError::MissingProcess(handle.name.clone()))?;
        if let Some(child) = process.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }
        process.child = Some(spawn(&process.spec)?);
        Ok(())
    }

    async fn inspect(&self, handle: &ProcessHandle) -> Result<ProcessState, FleetError> {
        let mut processes = self.processes.lock().await;
        let Some(process) = processes.get_mut(&handle.name) else {
            return Ok(ProcessState::Missing);
        };
        let Some(child) = process.child.as_mut() else {
            return Ok(ProcessState::Created);
        };
        match child.try_wait()? {
            None => Ok(ProcessState::Running),
            Some(status) => Ok(ProcessState::Exited {
                code: status.code(),
            }),
        }
    }

    async fn restart(&self, handle: &ProcessHandle) -> Result<(), FleetError> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(&handle.name)
            .ok_or_else(|| FleetError::MissingProcess(handle.name.clone()))?;
        if let Some(child) = process.child.as_mut() {
            stop(&handle.name, child).await;
        }
        process.child = Some(spawn(&process.spec)?);
        Ok(())
    }

    async fn remove(&self, handle: &ProcessHandle) -> Result<(), FleetError> {
        let mut processes = self.processes.lock().await;
        if let Some(mut process) = processes.remove(&handle.name) {
            if let Some(child) = process.child.as_mut() {
                stop(&handle.name, child).await;
            }
        }
        Ok(())
    }
}
