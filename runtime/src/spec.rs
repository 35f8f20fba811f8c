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

//! Translation of a [`ContainerSpec`] into the OCI runtime spec handed to
//! the runtime client.

use crate::{
    garden::{BindMount, BindMountMode, BindMountOrigin, ContainerSpec, Limits},
    hooks::HookError,
};
use oci_spec::{
    runtime::{
        Hooks, Linux, LinuxBuilder, LinuxCpuBuilder, LinuxDeviceCgroup,
        LinuxDeviceCgroupBuilder, LinuxDeviceType, LinuxIdMapping,
        LinuxIdMappingBuilder, LinuxMemoryBuilder, LinuxNamespace,
        LinuxNamespaceBuilder, LinuxNamespaceType, LinuxPidsBuilder,
        LinuxResources, LinuxResourcesBuilder, LinuxSeccomp, Mount,
        MountBuilder, ProcessBuilder, RootBuilder, Spec, SpecBuilder,
    },
    OciSpecError,
};
use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use url::Url;

pub const DEFAULT_INIT_BIN_PATH: &str = "/usr/local/concourse/bin/init";
/// Where the init binary is mounted inside every container.
pub const INIT_BIN_MOUNT: &str = "/tmp/gdn-init";
pub const CGROUPS_BASE_PATH: &str = "garden";

pub const SUPERUSER_PATH: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const USER_PATH: &str = "PATH=/usr/local/bin:/usr/bin:/bin";

const RAW_SCHEME: &str = "raw";

pub type Result<T> = std::result::Result<T, SpecError>;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("invalid rootfs '{uri}': {reason}")]
    InvalidRootfs { uri: String, reason: String },
    #[error("invalid bind mount {src} -> {dst}: {reason}")]
    InvalidBindMount { src: String, dst: String, reason: &'static str },
    #[error("reading seccomp profile '{path}': {source}")]
    ReadSeccomp { path: PathBuf, source: io::Error },
    #[error("parsing seccomp profile '{path}': {source}")]
    ParseSeccomp { path: PathBuf, source: serde_json::Error },
    #[error(transparent)]
    Oci(#[from] OciSpecError),
    #[error(transparent)]
    Hook(#[from] HookError),
}

/// How the `privileged` flag of a container request is honoured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrivilegedMode {
    /// Privileged containers run as real root with every host privilege.
    #[default]
    Full,
    /// Privileged containers stay in a user namespace but may use FUSE.
    FuseOnly,
    /// The flag is ignored.
    Ignore,
}

impl PrivilegedMode {
    fn is_privileged(self, privileged: bool) -> bool {
        privileged && self == PrivilegedMode::Full
    }
}

/// Backend-wide settings applied to every container spec.
#[derive(Debug, Clone)]
pub struct SpecOptions {
    pub init_bin_path: PathBuf,
    pub seccomp: Option<LinuxSeccomp>,
    pub hooks: Option<Hooks>,
    pub privileged_mode: PrivilegedMode,
    /// Whether the host accounts swap, in which case the memory limit also
    /// caps memory + swap.
    pub swap_limit: bool,
}

impl Default for SpecOptions {
    fn default() -> Self {
        Self {
            init_bin_path: DEFAULT_INIT_BIN_PATH.into(),
            seccomp: None,
            hooks: None,
            privileged_mode: PrivilegedMode::default(),
            swap_limit: true,
        }
    }
}

/// Builds the runtime spec for `spec`, mapping container root to the
/// highest valid host ids when the container is unprivileged.
pub fn oci_spec(
    options: &SpecOptions,
    spec: &ContainerSpec,
    max_uid: u32,
    max_gid: u32,
) -> Result<Spec> {
    if spec.handle.is_empty() {
        return Err(SpecError::InvalidInput("handle must be specified".into()));
    }

    let rootfs = rootfs_dir(spec)?;
    let privileged = options.privileged_mode.is_privileged(spec.privileged);

    let mut mounts = container_mounts(privileged, &options.init_bin_path)?;
    mounts.extend(oci_bind_mounts(&spec.bind_mounts)?);

    let process = ProcessBuilder::default()
        .args(vec![INIT_BIN_MOUNT.to_string()])
        .env(env_with_default_path(0, &spec.env))
        .cwd("/")
        .build()?;

    let mut resources =
        oci_resources(&spec.limits, options.swap_limit)?.unwrap_or_default();
    resources.set_devices(Some(container_devices(
        options.privileged_mode == PrivilegedMode::FuseOnly && spec.privileged,
    )?));

    let defaults = Linux::default();
    let mut linux = LinuxBuilder::default()
        .namespaces(oci_namespaces(privileged)?)
        .resources(resources)
        .build()?;

    let cgroups_path = oci_cgroups_path(
        CGROUPS_BASE_PATH,
        &spec.handle,
        options.privileged_mode,
        spec.privileged,
    );
    if !cgroups_path.is_empty() {
        let _ = linux.set_cgroups_path(Some(cgroups_path.into()));
    }

    if !privileged {
        let _ = linux
            .set_uid_mappings(Some(id_mappings(max_uid)?))
            .set_gid_mappings(Some(id_mappings(max_gid)?))
            .set_masked_paths(defaults.masked_paths().clone())
            .set_readonly_paths(defaults.readonly_paths().clone())
            .set_seccomp(options.seccomp.clone());
    }

    let mut oci = SpecBuilder::default()
        .version("1.0.2")
        .root(RootBuilder::default().path(rootfs).readonly(false).build()?)
        .hostname(spec.handle.clone())
        .mounts(mounts)
        .process(process)
        .linux(linux)
        .build()?;

    if let Some(hooks) = &options.hooks {
        let _ = oci.set_hooks(Some(hooks.clone()));
    }

    Ok(oci)
}

/// Appends the default `PATH` for `uid` unless `env` already carries one.
pub fn env_with_default_path(uid: u32, env: &[String]) -> Vec<String> {
    let mut env = env.to_vec();
    if !env.iter().any(|var| var.starts_with("PATH=")) {
        let path = if uid == 0 { SUPERUSER_PATH } else { USER_PATH };
        env.push(path.to_string());
    }
    env
}

fn rootfs_dir(spec: &ContainerSpec) -> Result<String> {
    let uri = match (spec.rootfs_path.is_empty(), spec.image.uri.is_empty()) {
        (true, true) => {
            return Err(SpecError::InvalidInput(
                "rootfs path or image uri must be specified".into(),
            ))
        }
        (false, false) => {
            return Err(SpecError::InvalidInput(
                "rootfs path and image uri are mutually exclusive".into(),
            ))
        }
        (false, true) => &spec.rootfs_path,
        (true, false) => &spec.image.uri,
    };

    let invalid = |reason: &str| SpecError::InvalidRootfs {
        uri: uri.clone(),
        reason: reason.to_string(),
    };

    let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != RAW_SCHEME {
        return Err(invalid("unsupported scheme"));
    }
    if url.host_str().map_or(false, |host| !host.is_empty()) {
        return Err(invalid("raw rootfs must not have a host"));
    }
    if !url.path().starts_with('/') {
        return Err(invalid("raw rootfs must be an absolute path"));
    }

    Ok(url.path().to_string())
}

/// Mounts every container gets. The init binary comes last.
fn container_mounts(privileged: bool, init_bin_path: &Path) -> Result<Vec<Mount>> {
    let options = |opts: &[&str]| -> Vec<String> {
        opts.iter().map(|opt| opt.to_string()).collect()
    };
    let sys_options = if privileged {
        options(&["nosuid", "noexec", "nodev"])
    } else {
        options(&["nosuid", "noexec", "nodev", "ro"])
    };

    Ok(vec![
        MountBuilder::default()
            .destination("/proc")
            .typ("proc")
            .source("proc")
            .options(options(&["nosuid", "noexec", "nodev"]))
            .build()?,
        MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(options(&["nosuid", "strictatime", "mode=755", "size=65536k"]))
            .build()?,
        MountBuilder::default()
            .destination("/dev/pts")
            .typ("devpts")
            .source("devpts")
            .options(options(&[
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
            ]))
            .build()?,
        MountBuilder::default()
            .destination("/dev/shm")
            .typ("tmpfs")
            .source("shm")
            .options(options(&[
                "nosuid",
                "noexec",
                "nodev",
                "mode=1777",
                "size=65536k",
            ]))
            .build()?,
        MountBuilder::default()
            .destination("/dev/mqueue")
            .typ("mqueue")
            .source("mqueue")
            .options(options(&["nosuid", "noexec", "nodev"]))
            .build()?,
        MountBuilder::default()
            .destination("/sys")
            .typ("sysfs")
            .source("sysfs")
            .options(sys_options.clone())
            .build()?,
        MountBuilder::default()
            .destination("/sys/fs/cgroup")
            .typ("cgroup2")
            .source("cgroup2")
            .options(sys_options)
            .build()?,
        MountBuilder::default()
            .destination(INIT_BIN_MOUNT)
            .typ("bind")
            .source(init_bin_path)
            .options(options(&["bind", "ro"]))
            .build()?,
    ])
}

/// Bind mounts requested by the caller. Only host-origin mounts between
/// absolute paths are supported.
pub fn oci_bind_mounts(bind_mounts: &[BindMount]) -> Result<Vec<Mount>> {
    bind_mounts
        .iter()
        .map(|mount| {
            let invalid = |reason| SpecError::InvalidBindMount {
                src: mount.src_path.clone(),
                dst: mount.dst_path.clone(),
                reason,
            };

            if mount.src_path.is_empty() {
                return Err(invalid("source path not specified"));
            }
            if mount.dst_path.is_empty() {
                return Err(invalid("destination path not specified"));
            }
            if !mount.src_path.starts_with('/') {
                return Err(invalid("source path must be absolute"));
            }
            if !mount.dst_path.starts_with('/') {
                return Err(invalid("destination path must be absolute"));
            }
            if mount.origin != BindMountOrigin::Host {
                return Err(invalid("only host origin is supported"));
            }

            let mode = match mount.mode {
                BindMountMode::ReadOnly => "ro",
                BindMountMode::ReadWrite => "rw",
            };
            Ok(MountBuilder::default()
                .destination(&mount.dst_path)
                .typ("bind")
                .source(&mount.src_path)
                .options(vec!["bind".to_string(), mode.to_string()])
                .build()?)
        })
        .collect()
}

/// Cgroup resource limits, or `None` when no limit is set.
pub fn oci_resources(
    limits: &Limits,
    swap_limit: bool,
) -> Result<Option<LinuxResources>> {
    let shares = if limits.cpu.weight > 0 {
        limits.cpu.weight
    } else {
        limits.cpu.limit_in_shares
    };
    let memory = limits.memory.limit_in_bytes;
    let pids = limits.pid.max;

    if shares == 0 && memory == 0 && pids == 0 {
        return Ok(None);
    }

    let mut builder = LinuxResourcesBuilder::default();
    if shares > 0 {
        builder = builder.cpu(LinuxCpuBuilder::default().shares(shares).build()?);
    }
    if memory > 0 {
        let limit = i64::try_from(memory).map_err(|_| {
            SpecError::InvalidInput(format!("memory limit {memory} is too large"))
        })?;
        let mut memory = LinuxMemoryBuilder::default().limit(limit);
        if swap_limit {
            memory = memory.swap(limit);
        }
        builder = builder.memory(memory.build()?);
    }
    if pids > 0 {
        let limit = i64::try_from(pids).map_err(|_| {
            SpecError::InvalidInput(format!("pid limit {pids} is too large"))
        })?;
        builder = builder.pids(LinuxPidsBuilder::default().limit(limit).build()?);
    }

    Ok(Some(builder.build()?))
}

/// `<base>/<handle>`, or empty for fully privileged containers which stay
/// in the runtime's cgroup.
pub fn oci_cgroups_path(
    base: &str,
    handle: &str,
    mode: PrivilegedMode,
    privileged: bool,
) -> String {
    if mode.is_privileged(privileged) {
        return String::new();
    }
    format!("{base}/{handle}")
}

pub fn oci_namespaces(privileged: bool) -> Result<Vec<LinuxNamespace>> {
    let mut types = vec![
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Network,
    ];
    if !privileged {
        types.push(LinuxNamespaceType::User);
    }

    types
        .into_iter()
        .map(|typ| Ok(LinuxNamespaceBuilder::default().typ(typ).build()?))
        .collect()
}

/// Maps container root to `max_id` and the rest of the container's ids
/// onto `1..max_id`.
fn id_mappings(max_id: u32) -> Result<Vec<LinuxIdMapping>> {
    Ok(vec![
        LinuxIdMappingBuilder::default()
            .container_id(0u32)
            .host_id(max_id)
            .size(1u32)
            .build()?,
        LinuxIdMappingBuilder::default()
            .container_id(1u32)
            .host_id(1u32)
            .size(max_id.saturating_sub(1))
            .build()?,
    ])
}

/// Denies every device but the ones a regular userland needs.
fn container_devices(fuse: bool) -> Result<Vec<LinuxDeviceCgroup>> {
    let mut devices = vec![LinuxDeviceCgroupBuilder::default()
        .allow(false)
        .access("rwm")
        .build()?];

    let mut allowed: Vec<(i64, Option<i64>)> = vec![
        (1, Some(3)),  // null
        (1, Some(5)),  // zero
        (1, Some(7)),  // full
        (1, Some(8)),  // random
        (1, Some(9)),  // urandom
        (5, Some(0)),  // tty
        (5, Some(1)),  // console
        (5, Some(2)),  // ptmx
        (136, None),   // pts
    ];
    if fuse {
        allowed.push((10, Some(229)));
    }

    for (major, minor) in allowed {
        let builder = LinuxDeviceCgroupBuilder::default()
            .allow(true)
            .typ(LinuxDeviceType::C)
            .major(major)
            .access("rwm");
        let builder = match minor {
            Some(minor) => builder.minor(minor),
            None => builder,
        };
        devices.push(builder.build()?);
    }

    Ok(devices)
}

/// Reads an OCI seccomp profile from a JSON file.
pub fn load_seccomp_profile(path: &Path) -> Result<LinuxSeccomp> {
    let content = fs::read_to_string(path).map_err(|source| {
        SpecError::ReadSeccomp { path: path.to_path_buf(), source }
    })?;
    serde_json::from_str(&content).map_err(|source| SpecError::ParseSeccomp {
        path: path.to_path_buf(),
        source,
    })
}
