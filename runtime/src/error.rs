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
    client::{ClientError, ProcessStatus},
    killer::KillerError,
    lock::LockError,
    network::NetworkError,
    rootfs::RootfsError,
    spec::SpecError,
    userns::UserNamespaceError,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("acquiring create container lock: {0}")]
    CreateLock(LockError),
    #[error("max containers reached ({max})")]
    MaxContainersReached { max: usize },
    #[error("property '{name}' not found")]
    PropertyNotFound { name: String },
    #[error("property '{name}' too long")]
    PropertyTooLong { name: String },
    #[error("user '{user}' not found: no matching entries in /etc/passwd")]
    UserNotFound { user: String },
    #[error("proc not running: status = {status}")]
    ProcessNotRunning { status: ProcessStatus },
    #[error("{message}")]
    ExecutableNotFound { message: String },
    #[error("not implemented")]
    NotImplemented,
    #[error("{stage}: {source}")]
    Client { stage: &'static str, source: ClientError },
    #[error("{stage}: {source}")]
    Network { stage: &'static str, source: NetworkError },
    #[error("{stage}: {source}")]
    Kill { stage: &'static str, source: KillerError },
    #[error("{stage}: {source}")]
    Rootfs { stage: &'static str, source: RootfsError },
    #[error("oci spec: {0}")]
    Spec(#[from] SpecError),
    #[error("getting max valid ids: {0}")]
    UserNamespace(#[from] UserNamespaceError),
}

impl RuntimeError {
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub(crate) fn client(stage: &'static str) -> impl FnOnce(ClientError) -> Self {
        move |source| Self::Client { stage, source }
    }

    pub(crate) fn network(
        stage: &'static str,
    ) -> impl FnOnce(NetworkError) -> Self {
        move |source| Self::Network { stage, source }
    }

    pub(crate) fn kill(stage: &'static str) -> impl FnOnce(KillerError) -> Self {
        move |source| Self::Kill { stage, source }
    }

    pub(crate) fn rootfs(stage: &'static str) -> impl FnOnce(RootfsError) -> Self {
        move |source| Self::Rootfs { stage, source }
    }

    /// True for the errors produced by admission control on creation.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::CreateLock(_) | Self::MaxContainersReached { .. }
        )
    }
}
