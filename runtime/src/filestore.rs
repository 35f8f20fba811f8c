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

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FileStoreError>;

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("{action} '{path}': {source}")]
    Io { action: &'static str, path: PathBuf, source: io::Error },
    #[error("no ip found for container '{handle}'")]
    IpNotFound { handle: String },
}

/// Per-container scratch files (`hosts`, `hostname`, `resolv.conf`) that get
/// bind-mounted into containers.
pub trait FileStore: Send + Sync {
    /// Writes `content` to `name`, creating parent directories, and returns
    /// the absolute path of the file.
    fn create(&self, name: &Path, content: &[u8]) -> Result<PathBuf>;
    fn append(&self, name: &Path, content: &[u8]) -> Result<()>;
    /// Removes `name` and everything below it.
    fn delete(&self, name: &Path) -> Result<()>;
    /// Recovers the IPv4 address recorded for `handle` in its hosts file.
    fn container_ip_lookup(&self, handle: &str) -> Result<Ipv4Addr>;
}

#[derive(Debug, Clone)]
pub struct HostFileStore {
    root: PathBuf,
}

impl HostFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &Path) -> PathBuf {
        self.root.join(name.strip_prefix("/").unwrap_or(name))
    }
}

fn io_error<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> FileStoreError + 'a {
    move |source| FileStoreError::Io { action, path: path.to_path_buf(), source }
}

impl FileStore for HostFileStore {
    fn create(&self, name: &Path, content: &[u8]) -> Result<PathBuf> {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error("creating", parent))?;
        }
        fs::write(&path, content).map_err(io_error("writing", &path))?;
        Ok(path)
    }

    fn append(&self, name: &Path, content: &[u8]) -> Result<()> {
        let path = self.path(name);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(io_error("opening", &path))?;
        file.write_all(content).map_err(io_error("appending to", &path))
    }

    fn delete(&self, name: &Path) -> Result<()> {
        let path = self.path(name);
        match fs::remove_dir_all(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res.map_err(io_error("removing", &path)),
        }
    }

    fn container_ip_lookup(&self, handle: &str) -> Result<Ipv4Addr> {
        let path = self.path(&Path::new(handle).join("hosts"));
        let not_found = || FileStoreError::IpNotFound { handle: handle.into() };

        let hosts = match fs::read_to_string(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(not_found())
            }
            res => res.map_err(io_error("reading", &path))?,
        };

        hosts
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let ip = fields.next()?;
                fields.any(|name| name == handle).then_some(ip)
            })
            .find_map(|ip| ip.parse::<Ipv4Addr>().ok())
            .ok_or_else(not_found)
    }
}
