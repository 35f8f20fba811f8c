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

use std::{fs, io, path::PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UserNamespaceError>;

#[derive(Error, Debug)]
pub enum UserNamespaceError {
    #[error("reading '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("empty id mapping")]
    EmptyMapping,
    #[error("malformed id mapping line '{line}'")]
    MalformedLine { line: String },
}

/// Answers which host ids are usable for files created inside containers.
pub trait UserNamespace: Send + Sync {
    /// Highest valid (uid, gid).
    fn max_valid_ids(&self) -> Result<(u32, u32)>;
}

/// Reads the id mappings of the current process' user namespace.
#[derive(Debug, Clone)]
pub struct HostUserNamespace {
    uid_map: PathBuf,
    gid_map: PathBuf,
}

impl Default for HostUserNamespace {
    fn default() -> Self {
        Self {
            uid_map: PathBuf::from("/proc/self/uid_map"),
            gid_map: PathBuf::from("/proc/self/gid_map"),
        }
    }
}

impl HostUserNamespace {
    pub fn new(uid_map: impl Into<PathBuf>, gid_map: impl Into<PathBuf>) -> Self {
        Self { uid_map: uid_map.into(), gid_map: gid_map.into() }
    }

    fn read(path: &PathBuf) -> Result<u32> {
        let content = fs::read_to_string(path).map_err(|source| {
            UserNamespaceError::Read { path: path.clone(), source }
        })?;
        max_valid_id(&content)
    }
}

impl UserNamespace for HostUserNamespace {
    fn max_valid_ids(&self) -> Result<(u32, u32)> {
        let uid = Self::read(&self.uid_map)?;
        let gid = Self::read(&self.gid_map)?;
        Ok((uid, gid))
    }
}

/// Computes the highest id covered by an `inside outside size` mapping.
pub fn max_valid_id(mapping: &str) -> Result<u32> {
    let mut max: Option<u64> = None;

    for line in mapping.lines().filter(|line| !line.trim().is_empty()) {
        let malformed =
            || UserNamespaceError::MalformedLine { line: line.to_string() };

        let fields = line
            .split_whitespace()
            .map(|field| field.parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| malformed())?;

        let &[inside, _outside, size] = fields.as_slice() else {
            return Err(malformed());
        };
        if size == 0 {
            return Err(malformed());
        }

        let id = inside.checked_add(size - 1).ok_or_else(malformed)?;
        max = Some(max.map_or(id, |max| max.max(id)));
    }

    let max = max.ok_or(UserNamespaceError::EmptyMapping)?;
    Ok(u32::try_from(max).unwrap_or(u32::MAX))
}
