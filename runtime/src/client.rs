/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The narrow surface of the low-level container runtime this crate drives.
//!
//! Nothing outside this module knows how containers, tasks or processes are
//! really created; the backend only ever talks to these traits.

use async_trait::async_trait;
use nix::sys::signal::Signal;
use oci_spec::runtime::{Process as ProcessSpec, Spec};
use std::{collections::HashMap, fmt, io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::sync::oneshot;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("{what} already exists")]
    AlreadyExists { what: String },
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ClientError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Exit information delivered once a task process has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
}

/// Receives the exit status of a process. Obtained *before* the process is
/// started or signalled so a fast exit cannot be missed.
pub type ExitReceiver = oneshot::Receiver<Result<ExitStatus>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
    Unknown,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ProcessStatus::Created => "created",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Paused => "paused",
            ProcessStatus::Pausing => "pausing",
            ProcessStatus::Unknown => "unknown",
        };
        write!(f, "{status}")
    }
}

/// A process as reported by [Task::pids]. Only processes created through
/// [Task::exec] carry an `exec_id`; the task's init process does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub exec_id: Option<String>,
}

/// Locations of the named pipes backing one process' stdio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FifoSet {
    pub id: String,
    pub dir: Option<PathBuf>,
    pub terminal: bool,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// An attached set of stdio streams.
#[async_trait]
pub trait Io: Send + Sync {
    fn config(&self) -> FifoSet;
    /// Stops copying data without waiting for the streams to drain.
    fn cancel(&self);
    /// Resolves once stdout and stderr have been fully copied.
    async fn wait(&self);
    /// Releases the pipes backing the streams.
    fn close(&self) -> io::Result<()>;
}

/// Creates fresh stdio for a new task or process, given its id.
pub type IoCreator =
    Box<dyn FnOnce(&str) -> Result<Arc<dyn Io>> + Send + 'static>;

/// Attaches to the already existing stdio of a running process.
pub type IoAttach =
    Box<dyn FnOnce(&FifoSet) -> Result<Arc<dyn Io>> + Send + 'static>;

#[async_trait]
pub trait Client: Send + Sync {
    /// Establishes the connection to the runtime.
    async fn init(&self) -> Result<()>;
    async fn version(&self) -> Result<String>;
    /// Closes the connection; containers are left alone.
    async fn stop(&self) -> Result<()>;
    async fn new_container(
        &self,
        handle: &str,
        labels: HashMap<String, String>,
        spec: Spec,
    ) -> Result<Arc<dyn RuntimeContainer>>;
    async fn get_container(
        &self,
        handle: &str,
    ) -> Result<Arc<dyn RuntimeContainer>>;
    /// Lists containers matching every filter (`labels.<key>==<value>`).
    async fn containers(
        &self,
        filters: &[String],
    ) -> Result<Vec<Arc<dyn RuntimeContainer>>>;
}

#[async_trait]
pub trait RuntimeContainer: Send + Sync {
    fn id(&self) -> String;
    async fn spec(&self) -> Result<Spec>;
    async fn labels(&self) -> Result<HashMap<String, String>>;
    /// Merges `labels` into the container's labels, returning the result.
    async fn set_labels(
        &self,
        labels: HashMap<String, String>,
    ) -> Result<HashMap<String, String>>;
    /// Loads the container's task, reattaching its stdio through `attach`
    /// when given. Fails with [ClientError::NotFound] if there is none.
    async fn task(&self, attach: Option<IoAttach>) -> Result<Arc<dyn Task>>;
    async fn new_task(&self, creator: IoCreator) -> Result<Arc<dyn Task>>;
    async fn delete(&self) -> Result<()>;
}

#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> String;
    fn pid(&self) -> u32;
    async fn start(&self) -> Result<()>;
    async fn exec(
        &self,
        id: &str,
        spec: ProcessSpec,
        creator: IoCreator,
    ) -> Result<Arc<dyn TaskProcess>>;
    async fn load_process(
        &self,
        id: &str,
        attach: Option<IoAttach>,
    ) -> Result<Arc<dyn TaskProcess>>;
    async fn pids(&self) -> Result<Vec<ProcessInfo>>;
    /// Deletes the task, killing whatever is still running in it.
    async fn delete(&self) -> Result<ExitStatus>;
}

#[async_trait]
pub trait TaskProcess: Send + Sync {
    fn id(&self) -> String;
    fn pid(&self) -> u32;
    async fn start(&self) -> Result<()>;
    async fn wait(&self) -> Result<ExitReceiver>;
    async fn kill(&self, signal: Signal) -> Result<()>;
    async fn status(&self) -> Result<ProcessStatus>;
    /// Closes the stdin side of the process' stdio.
    async fn close_io(&self) -> Result<()>;
    async fn resize(&self, width: u32, height: u32) -> Result<()>;
    async fn delete(&self) -> Result<ExitStatus>;
    fn io(&self) -> Option<Arc<dyn Io>>;
}
