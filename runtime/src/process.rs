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

use crate::{
    client::{ClientError, ExitReceiver, RuntimeContainer, TaskProcess},
    container::properties_to_labels,
    error::{Result, RuntimeError},
    garden::{self, Properties, Signal, TtySpec},
    io_manager::IoManager,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Container property holding the exit code of the last process waited on.
pub const EXIT_STATUS_KEY: &str = "concourse:exit-status";

enum ExitState {
    Pending(ExitReceiver),
    Exited(i32),
    // the runtime dropped the exit channel without a status
    Lost,
}

/// A process exec'd into a container's task.
pub struct Process {
    process: Arc<dyn TaskProcess>,
    container: Arc<dyn RuntimeContainer>,
    io_manager: Arc<IoManager>,
    exit: Mutex<ExitState>,
}

impl Process {
    /// `exit` must have been obtained before the process was started.
    pub fn new(
        process: Arc<dyn TaskProcess>,
        container: Arc<dyn RuntimeContainer>,
        io_manager: Arc<IoManager>,
        exit: ExitReceiver,
    ) -> Self {
        Self {
            process,
            container,
            io_manager,
            exit: Mutex::new(ExitState::Pending(exit)),
        }
    }

    async fn store_exit_status(&self, code: i32) -> Result<()> {
        let properties =
            Properties::from([(EXIT_STATUS_KEY.to_string(), code.to_string())]);
        let labels = properties_to_labels(&properties)?;
        let _ = self
            .container
            .set_labels(labels)
            .await
            .map_err(RuntimeError::client("set exit status label"))?;
        Ok(())
    }
}

#[async_trait]
impl garden::Process for Process {
    fn id(&self) -> String {
        self.process.id()
    }

    async fn wait(&self) -> Result<i32> {
        let mut state = self.exit.lock().await;
        let receiver = match &mut *state {
            ExitState::Exited(code) => return Ok(*code),
            ExitState::Lost => {
                return Err(RuntimeError::client("proc wait")(ClientError::Other(
                    "exit status never delivered".into(),
                )))
            }
            ExitState::Pending(receiver) => receiver,
        };

        let status = match receiver.await {
            Ok(status) => status,
            Err(_) => {
                *state = ExitState::Lost;
                Err(ClientError::Other("exit status never delivered".into()))
            }
        }
        .map_err(RuntimeError::client("proc wait"))?;

        // the receiver is spent from here on
        let code = status.code as i32;
        *state = ExitState::Exited(code);

        match self.process.delete().await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(RuntimeError::client("proc delete")(e)),
        }

        let id = self.process.id();
        if let Some(io) = self.process.io().or_else(|| self.io_manager.get(&id))
        {
            io.wait().await;
        }
        self.io_manager.delete(&id);

        if let Err(e) = self.store_exit_status(code).await {
            warn!(process = %id, error = %e, "failed to record exit status");
        }

        Ok(code)
    }

    async fn set_tty(&self, tty: TtySpec) -> Result<()> {
        let Some(window_size) = tty.window_size else {
            return Ok(());
        };

        self.process
            .resize(
                u32::from(window_size.columns),
                u32::from(window_size.rows),
            )
            .await
            .map_err(RuntimeError::client("proc resize"))
    }

    async fn signal(&self, _signal: Signal) -> Result<()> {
        Err(RuntimeError::NotImplemented)
    }
}

/// A process that exited before anyone attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedProcess {
    id: String,
    exit_code: i32,
}

impl FinishedProcess {
    pub fn new(id: impl Into<String>, exit_code: i32) -> Self {
        Self { id: id.into(), exit_code }
    }
}

#[async_trait]
impl garden::Process for FinishedProcess {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn wait(&self) -> Result<i32> {
        Ok(self.exit_code)
    }

    async fn set_tty(&self, _tty: TtySpec) -> Result<()> {
        Ok(())
    }

    async fn signal(&self, _signal: Signal) -> Result<()> {
        Err(RuntimeError::NotImplemented)
    }
}
