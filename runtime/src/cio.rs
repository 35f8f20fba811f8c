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

//! Named-pipe stdio for task processes.
//!
//! The runtime writes a process' output into FIFOs under a per-process
//! directory; the copies spawned here move that output into the caller's
//! [ProcessIo] streams and feed its stdin the other way.

use crate::{
    client::{ClientError, FifoSet, Io, IoAttach, IoCreator},
    garden::{InputStream, OutputStream, ProcessIo},
};
use async_trait::async_trait;
use nix::{sys::stat::Mode, unistd::mkfifo};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{
    fs::OpenOptions,
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::unix::pipe,
    task::JoinHandle,
};

const FIFO_MODE: u32 = 0o700;

/// Returns a creator making fresh FIFOs under `fifo_dir/<id>` and copying
/// them to and from `io`.
pub fn creator(
    fifo_dir: impl Into<PathBuf>,
    io: ProcessIo,
    terminal: bool,
) -> IoCreator {
    let fifo_dir = fifo_dir.into();
    Box::new(move |id: &str| {
        let fifos = create_fifos(&fifo_dir, id, terminal, &io)
            .map_err(ClientError::Io)?;
        Ok(Arc::new(FifoIo::copy(fifos, io)) as Arc<dyn Io>)
    })
}

/// Returns an attacher copying the existing FIFOs of a process to and from
/// `io`.
///
/// The FIFOs are opened before the attacher returns, so the stream it
/// replaces may remove their directory right after.
pub fn attacher(io: ProcessIo) -> IoAttach {
    Box::new(move |fifos: &FifoSet| {
        let io = FifoIo::attach(fifos.clone(), io).map_err(ClientError::Io)?;
        Ok(Arc::new(io) as Arc<dyn Io>)
    })
}

/// Returns a creator for processes whose output nobody reads.
pub fn null_io() -> IoCreator {
    Box::new(|id: &str| {
        let config = FifoSet { id: id.to_string(), ..FifoSet::default() };
        Ok(Arc::new(NullIo { config }) as Arc<dyn Io>)
    })
}

fn create_fifos(
    fifo_dir: &Path,
    id: &str,
    terminal: bool,
    io: &ProcessIo,
) -> io::Result<FifoSet> {
    let dir = fifo_dir.join(id);
    fs::create_dir_all(&dir)?;

    let fifo = |stream: &str, wanted: bool| -> io::Result<Option<PathBuf>> {
        if !wanted {
            return Ok(None);
        }
        let path = dir.join(format!("{id}-{stream}"));
        mkfifo(&path, Mode::from_bits_truncate(FIFO_MODE))?;
        Ok(Some(path))
    };

    Ok(FifoSet {
        id: id.to_string(),
        terminal,
        stdin: fifo("stdin", io.stdin.is_some())?,
        stdout: fifo("stdout", io.stdout.is_some())?,
        // a terminal merges stderr into stdout
        stderr: fifo("stderr", io.stderr.is_some() && !terminal)?,
        dir: Some(dir),
    })
}

/// Streams copied between FIFOs and caller-provided readers and writers.
pub struct FifoIo {
    config: FifoSet,
    stdin: Mutex<Option<JoinHandle<()>>>,
    outputs: Mutex<Vec<JoinHandle<()>>>,
}

impl FifoIo {
    fn copy(config: FifoSet, io: ProcessIo) -> Self {
        let ProcessIo { stdin, stdout, stderr } = io;

        let stdin = match (config.stdin.clone(), stdin) {
            (Some(path), Some(reader)) => Some(copy_stdin(path, reader)),
            _ => None,
        };

        let outputs = [
            (config.stdout.clone(), stdout),
            (config.stderr.clone(), stderr),
        ]
        .into_iter()
        .filter_map(|(path, writer)| Some(copy_output(path?, writer?)))
        .collect();

        Self {
            config,
            stdin: Mutex::new(stdin),
            outputs: Mutex::new(outputs),
        }
    }
}

impl FifoIo {
    /// Opens the FIFOs of a running process without blocking. The runtime
    /// already holds their other ends.
    fn attach(config: FifoSet, io: ProcessIo) -> io::Result<Self> {
        let ProcessIo { stdin, stdout, stderr } = io;

        let stdin = match (&config.stdin, stdin) {
            (Some(path), Some(reader)) => {
                let fifo = pipe::OpenOptions::new().open_sender(path)?;
                Some(pump(reader, fifo))
            }
            _ => None,
        };

        let mut outputs = Vec::new();
        for (path, writer) in [(&config.stdout, stdout), (&config.stderr, stderr)]
        {
            if let (Some(path), Some(writer)) = (path, writer) {
                let fifo = pipe::OpenOptions::new().open_receiver(path)?;
                outputs.push(pump(fifo, writer));
            }
        }

        Ok(Self {
            config,
            stdin: Mutex::new(stdin),
            outputs: Mutex::new(outputs),
        })
    }
}

fn pump<R, W>(mut from: R, mut to: W) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut from, &mut to).await;
        let _ = to.flush().await;
    })
}

// The blocking open waits for the runtime to connect the other end. Copies
// then go through the reactor so that aborting them stops reads at once.
fn copy_stdin(path: PathBuf, mut reader: InputStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(file) = OpenOptions::new().write(true).open(&path).await else {
            return;
        };
        let Ok(mut fifo) = pipe::Sender::from_file(file.into_std().await) else {
            return;
        };
        let _ = tokio::io::copy(&mut reader, &mut fifo).await;
        // dropping the fifo is what signals EOF to the process
    })
}

fn copy_output(path: PathBuf, mut writer: OutputStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(file) = OpenOptions::new().read(true).open(&path).await else {
            return;
        };
        let Ok(mut fifo) = pipe::Receiver::from_file(file.into_std().await)
        else {
            return;
        };
        let _ = tokio::io::copy(&mut fifo, &mut writer).await;
        let _ = writer.flush().await;
    })
}

#[async_trait]
impl Io for FifoIo {
    fn config(&self) -> FifoSet {
        self.config.clone()
    }

    fn cancel(&self) {
        if let Ok(stdin) = self.stdin.lock() {
            if let Some(handle) = stdin.as_ref() {
                handle.abort();
            }
        }
        if let Ok(outputs) = self.outputs.lock() {
            outputs.iter().for_each(JoinHandle::abort);
        }
    }

    async fn wait(&self) {
        let outputs: Vec<JoinHandle<()>> = match self.outputs.lock() {
            Ok(mut outputs) => outputs.drain(..).collect(),
            Err(_) => return,
        };
        let _ = futures::future::join_all(outputs).await;
    }

    fn close(&self) -> io::Result<()> {
        let Some(dir) = &self.config.dir else {
            return Ok(());
        };
        match fs::remove_dir_all(dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }
}

struct NullIo {
    config: FifoSet,
}

#[async_trait]
impl Io for NullIo {
    fn config(&self) -> FifoSet {
        self.config.clone()
    }

    fn cancel(&self) {}

    async fn wait(&self) {}

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
