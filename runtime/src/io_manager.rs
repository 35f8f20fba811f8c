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

use crate::client::{Io, IoAttach, IoCreator};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// Keeps at most one reader attached to each task or process' stdio.
///
/// Streams are recorded by id when created. Attaching to an id replaces the
/// recorded stream: the new stream is attached first and only then is the old
/// one cancelled and closed, as closing removes the pipes the new reader needs.
#[derive(Default)]
pub struct IoManager {
    streams: Mutex<HashMap<String, Arc<dyn Io>>>,
}

impl IoManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Io>>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wraps `inner` so the created stream is recorded under its id.
    pub fn creator(self: &Arc<Self>, inner: IoCreator) -> IoCreator {
        let manager = Arc::clone(self);
        Box::new(move |id: &str| {
            let io = inner(id)?;
            let _ = manager.streams().insert(id.to_string(), Arc::clone(&io));
            Ok(io)
        })
    }

    /// Wraps `inner` so attaching to `id` replaces the previous stream.
    pub fn attach(self: &Arc<Self>, id: &str, inner: IoAttach) -> IoAttach {
        let manager = Arc::clone(self);
        let id = id.to_string();
        Box::new(move |fifos| {
            let mut streams = manager.streams();
            let io = inner(fifos)?;
            if let Some(previous) = streams.insert(id, Arc::clone(&io)) {
                previous.cancel();
                let _ = previous.close();
            }
            Ok(io)
        })
    }

    /// Forgets the stream of a process that is known to be gone.
    pub fn delete(&self, id: &str) {
        let _ = self.streams().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Io>> {
        self.streams().get(id).cloned()
    }
}
