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

//! OCI lifecycle hooks configured through a directory of JSON hook files.

use fancy_regex::Regex;
use oci_spec::runtime::{Hook, Hooks};
use serde::Deserialize;
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HookError>;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("reading hooks dir '{path}': {source}")]
    ReadDir { path: PathBuf, source: io::Error },
    #[error("reading hook file '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("parsing hook file '{path}': {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("invalid command pattern '{pattern}' in '{path}': {message}")]
    InvalidPattern { path: PathBuf, pattern: String, message: String },
}

/// A hook file, e.g. `/etc/containers/oci/hooks.d/*.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HookFile {
    pub version: String,
    pub hook: Hook,
    #[serde(default)]
    pub when: When,
    pub stages: Vec<HookStage>,
}

/// Conditions under which a hook is installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct When {
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Regular expressions matched against the container's command.
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookStage {
    Prestart,
    CreateRuntime,
    CreateContainer,
    StartContainer,
    Poststart,
    Poststop,
}

impl HookFile {
    fn applies_to(&self, path: &Path, command: &str) -> Result<bool> {
        if self.when.always {
            return Ok(true);
        }
        for pattern in &self.when.commands {
            let regex =
                Regex::new(pattern).map_err(|e| HookError::InvalidPattern {
                    path: path.to_path_buf(),
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
            if regex.is_match(command).unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Loads every `*.json` hook file in `dir`, in file name order, and collects
/// the hooks applying to `command` by stage.
pub fn load_hooks(dir: &Path, command: &str) -> Result<Hooks> {
    let entries = fs::read_dir(dir)
        .map_err(|source| HookError::ReadDir { path: dir.into(), source })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|source| HookError::ReadDir { path: dir.into(), source })?;
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut stages: HashMap<HookStage, Vec<Hook>> = HashMap::new();
    for path in paths {
        let content = fs::read_to_string(&path)
            .map_err(|source| HookError::Read { path: path.clone(), source })?;
        let file: HookFile = serde_json::from_str(&content)
            .map_err(|source| HookError::Parse { path: path.clone(), source })?;

        if !file.applies_to(&path, command)? {
            continue;
        }
        for stage in &file.stages {
            stages.entry(*stage).or_default().push(file.hook.clone());
        }
    }

    let mut hooks = Hooks::default();
    let mut take = |stage| stages.remove(&stage);
    let _ = hooks
        .set_prestart(take(HookStage::Prestart))
        .set_create_runtime(take(HookStage::CreateRuntime))
        .set_create_container(take(HookStage::CreateContainer))
        .set_start_container(take(HookStage::StartContainer))
        .set_poststart(take(HookStage::Poststart))
        .set_poststop(take(HookStage::Poststop));
    Ok(hooks)
}
