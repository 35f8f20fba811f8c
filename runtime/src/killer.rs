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

//! Terminates the processes exec'd into a task.
//!
//! A kill runs as a small saga: signal every process gracefully and wait for
//! it, and only if one of them outlives the grace period do it all again with
//! `SIGKILL`. The task's init process is never signalled here; it goes away
//! when the task is deleted.

use crate::client::{ClientError, Task, TaskProcess};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KillerError>;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum KillerError {
    /// The process did not exit in time. Only [TaskKiller] ever sees this.
    #[error("process '{id}' did not exit within {period:?}")]
    GracePeriodTimeout { id: String, period: Duration },
    #[error("process '{id}' did not exit within {period:?} of SIGKILL")]
    Unresponsive { id: String, period: Duration },
    #[error("listing task processes: {source}")]
    ListProcesses { source: ClientError },
    #[error("loading process '{id}': {source}")]
    LoadProcess { id: String, source: ClientError },
    #[error("waiting on process '{id}': {source}")]
    Wait { id: String, source: ClientError },
    #[error("sending {signal} to process '{id}': {source}")]
    Signal { id: String, signal: Signal, source: ClientError },
    #[error("exit status of process '{id}': {source}")]
    ExitStatus { id: String, source: ClientError },
    #[error("exit status of process '{id}' was never delivered")]
    ExitChannelClosed { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillBehaviour {
    Gracefully,
    Ungracefully,
}

#[async_trait]
pub trait Killer: Send + Sync {
    async fn kill(&self, task: &dyn Task, behaviour: KillBehaviour)
        -> Result<()>;
}

#[async_trait]
pub trait ProcessKiller: Send + Sync {
    /// Sends `signal` to `process` and waits up to `wait` for it to exit.
    async fn kill(
        &self,
        process: &dyn TaskProcess,
        signal: Signal,
        wait: Duration,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProcessKiller;

#[async_trait]
impl ProcessKiller for SignalProcessKiller {
    async fn kill(
        &self,
        process: &dyn TaskProcess,
        signal: Signal,
        wait: Duration,
    ) -> Result<()> {
        let id = process.id();

        // subscribe before signalling so a fast exit is not lost
        let exit = process
            .wait()
            .await
            .map_err(|source| KillerError::Wait { id: id.clone(), source })?;

        process.kill(signal).await.map_err(|source| KillerError::Signal {
            id: id.clone(),
            signal,
            source,
        })?;

        match tokio::time::timeout(wait, exit).await {
            Err(_) => Err(KillerError::GracePeriodTimeout { id, period: wait }),
            Ok(Err(_)) => Err(KillerError::ExitChannelClosed { id }),
            Ok(Ok(Err(source))) => Err(KillerError::ExitStatus { id, source }),
            Ok(Ok(Ok(_))) => Ok(()),
        }
    }
}

#[derive(Debug)]
enum KillState {
    Idle,
    GracefulWait,
    UngracefulWait,
    Done,
    Failed(KillerError),
}

/// Kills every exec'd process of a task, escalating from `SIGTERM` to
/// `SIGKILL`.
pub struct TaskKiller {
    process_killer: Arc<dyn ProcessKiller>,
    grace_period: Duration,
}

impl TaskKiller {
    pub fn new(
        process_killer: Arc<dyn ProcessKiller>,
        grace_period: Duration,
    ) -> Self {
        Self { process_killer, grace_period }
    }

    async fn exec_processes(
        task: &dyn Task,
    ) -> Result<Vec<Arc<dyn TaskProcess>>> {
        let infos = task
            .pids()
            .await
            .map_err(|source| KillerError::ListProcesses { source })?;

        let mut processes = Vec::new();
        for id in infos.into_iter().filter_map(|info| info.exec_id) {
            match task.load_process(&id, None).await {
                Ok(process) => processes.push(process),
                // exited since it was listed
                Err(e) if e.is_not_found() => continue,
                Err(source) => {
                    return Err(KillerError::LoadProcess { id, source })
                }
            }
        }
        Ok(processes)
    }

    async fn signal_all(&self, task: &dyn Task, signal: Signal) -> Result<()> {
        for process in Self::exec_processes(task).await? {
            self.process_killer
                .kill(process.as_ref(), signal, self.grace_period)
                .await?;
        }
        Ok(())
    }
}

impl Default for TaskKiller {
    fn default() -> Self {
        Self::new(Arc::new(SignalProcessKiller), DEFAULT_GRACE_PERIOD)
    }
}

#[async_trait]
impl Killer for TaskKiller {
    async fn kill(
        &self,
        task: &dyn Task,
        behaviour: KillBehaviour,
    ) -> Result<()> {
        let mut state = KillState::Idle;
        loop {
            state = match state {
                KillState::Idle => match behaviour {
                    KillBehaviour::Gracefully => KillState::GracefulWait,
                    KillBehaviour::Ungracefully => KillState::UngracefulWait,
                },
                KillState::GracefulWait => {
                    match self.signal_all(task, Signal::SIGTERM).await {
                        Ok(()) => KillState::Done,
                        Err(KillerError::GracePeriodTimeout { .. }) => {
                            KillState::UngracefulWait
                        }
                        Err(e) => KillState::Failed(e),
                    }
                }
                KillState::UngracefulWait => {
                    match self.signal_all(task, Signal::SIGKILL).await {
                        Ok(()) => KillState::Done,
                        Err(KillerError::GracePeriodTimeout { id, period }) => {
                            KillState::Failed(KillerError::Unresponsive {
                                id,
                                period,
                            })
                        }
                        Err(e) => KillState::Failed(e),
                    }
                }
                KillState::Done => return Ok(()),
                KillState::Failed(e) => return Err(e),
            };
        }
    }
}
