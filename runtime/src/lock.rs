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

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("lock closed")]
    Closed,
}

/// Serializes container creation, one at a time, giving up after `timeout`.
///
/// A disabled lock hands out guards immediately and never blocks.
#[derive(Debug)]
pub struct TimeoutWithByPassLock {
    semaphore: Semaphore,
    timeout: Duration,
    enabled: bool,
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    _permit: Option<SemaphorePermit<'a>>,
}

impl TimeoutWithByPassLock {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self { semaphore: Semaphore::new(1), timeout, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn acquire(&self) -> Result<LockGuard<'_>> {
        if !self.enabled {
            return Ok(LockGuard { _permit: None });
        }

        let permit =
            tokio::time::timeout(self.timeout, self.semaphore.acquire())
                .await
                .map_err(|_| LockError::Timeout { timeout: self.timeout })?
                .map_err(|_| LockError::Closed)?;

        Ok(LockGuard { _permit: Some(permit) })
    }
}
