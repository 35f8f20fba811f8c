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
    fs::{self, DirBuilder},
    io,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RootfsError>;

#[derive(Error, Debug)]
pub enum RootfsError {
    #[error("creating '{path}': {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("reading '{path}': {source}")]
    ReadPasswd { path: PathBuf, source: io::Error },
    #[error("malformed passwd entry '{line}'")]
    MalformedPasswd { line: String },
}

const CWD_MODE: u32 = 0o777;

/// An entry of a container's `/etc/passwd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// Mutations and lookups against a container's root filesystem.
pub trait RootfsManager: Send + Sync {
    /// Makes sure `cwd` exists under `rootfs`.
    fn setup_cwd(&self, rootfs: &Path, cwd: &Path) -> Result<()>;
    /// Finds `user`, by name or numeric uid, in the rootfs' `/etc/passwd`.
    fn lookup_user(&self, rootfs: &Path, user: &str)
        -> Result<Option<PasswdUser>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostRootfsManager;

impl RootfsManager for HostRootfsManager {
    fn setup_cwd(&self, rootfs: &Path, cwd: &Path) -> Result<()> {
        let path = rootfs.join(cwd.strip_prefix("/").unwrap_or(cwd));
        if path.exists() {
            return Ok(());
        }

        DirBuilder::new()
            .recursive(true)
            .mode(CWD_MODE)
            .create(&path)
            .map_err(|source| RootfsError::CreateDir { path, source })
    }

    fn lookup_user(
        &self,
        rootfs: &Path,
        user: &str,
    ) -> Result<Option<PasswdUser>> {
        let path = rootfs.join("etc/passwd");
        let content = fs::read_to_string(&path)
            .map_err(|source| RootfsError::ReadPasswd { path, source })?;

        let uid = user.parse::<u32>().ok();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let entry = parse_passwd_line(line)?;
            if entry.name == user || Some(entry.uid) == uid {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }
}

fn parse_passwd_line(line: &str) -> Result<PasswdUser> {
    let malformed = || RootfsError::MalformedPasswd { line: line.to_string() };

    // name:password:uid:gid:gecos:home:shell
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 4 {
        return Err(malformed());
    }

    Ok(PasswdUser {
        name: fields[0].to_string(),
        uid: fields[2].parse().map_err(|_| malformed())?,
        gid: fields[3].parse().map_err(|_| malformed())?,
        home: fields.get(5).map(|home| home.to_string()).unwrap_or_default(),
    })
}
