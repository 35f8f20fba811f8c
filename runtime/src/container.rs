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

//! The [garden::Container] façade over one runtime container.
//!
//! Properties are kept as runtime labels. Label values are limited in size,
//! so a property is split into ordered chunks stored as `<name>.<n>`.

use crate::{
    cio,
    client::{ClientError, ProcessStatus, RuntimeContainer},
    error::{Result, RuntimeError},
    garden::{
        self, BandwidthLimits, Container as _, ContainerInfo, CpuLimits,
        DiskLimits, InputStream, MemoryLimits, Metrics, NetOutRule,
        ProcessIo, ProcessSpec, Properties, StreamInSpec, StreamOutSpec,
    },
    io_manager::IoManager,
    killer::{KillBehaviour, Killer},
    process::{FinishedProcess, Process, EXIT_STATUS_KEY},
    rootfs::RootfsManager,
    spec::{env_with_default_path, SpecError},
};
use async_trait::async_trait;
use fancy_regex::Regex;
use lazy_static::lazy_static;
use oci_spec::runtime::{BoxBuilder, Process as OciProcess, Spec};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use uuid::Uuid;

/// Property holding a container's grace time, in nanoseconds.
pub const GRACE_TIME_KEY: &str = "garden.grace-time";

/// Maximum size of a label, key and value included.
pub const MAX_LABEL_LEN: usize = 4096;

lazy_static! {
    static ref EXECUTABLE_NOT_FOUND: Vec<Regex> = vec![
        Regex::new(
            r"starting container process caused: exec: .*: stat .*: no such file or directory"
        )
        .expect("regex construction"),
        Regex::new(
            r"starting container process caused: exec: .*: executable file not found in \$PATH"
        )
        .expect("regex construction"),
    ];
}

fn is_executable_not_found(message: &str) -> bool {
    EXECUTABLE_NOT_FOUND
        .iter()
        .any(|regex| regex.is_match(message).unwrap_or(false))
}

/// Splits `value` into chunks fitting a label named `<name>.<n>`.
fn chunks<'a>(name: &str, value: &'a str) -> Result<Vec<&'a str>> {
    let mut chunks = Vec::new();
    let mut rest = value;

    while !rest.is_empty() {
        let key_len = name.len() + 1 + chunks.len().to_string().len();
        let mut end = MAX_LABEL_LEN.saturating_sub(key_len).min(rest.len());
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            return Err(RuntimeError::PropertyTooLong { name: name.into() });
        }

        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }

    Ok(chunks)
}

/// Stores properties as chunked labels. Empty values produce no label.
pub fn properties_to_labels(
    properties: &Properties,
) -> Result<HashMap<String, String>> {
    let mut labels = HashMap::new();
    for (name, value) in properties {
        for (i, chunk) in chunks(name, value)?.into_iter().enumerate() {
            let _ = labels.insert(format!("{name}.{i}"), chunk.to_string());
        }
    }
    Ok(labels)
}

/// Reassembles properties from chunked labels, ignoring other labels.
pub fn labels_to_properties(labels: &HashMap<String, String>) -> Properties {
    let mut chunked: HashMap<&str, BTreeMap<usize, &str>> = HashMap::new();
    for (key, value) in labels {
        let Some((name, index)) = key.rsplit_once('.') else {
            continue;
        };
        let Ok(index) = index.parse::<usize>() else {
            continue;
        };
        let _ = chunked.entry(name).or_default().insert(index, value);
    }

    chunked
        .into_iter()
        .map(|(name, chunks)| {
            (name.to_string(), chunks.into_values().collect::<String>())
        })
        .filter(|(_, value)| !value.is_empty())
        .collect()
}

/// Runtime container filters matching every property in `properties`.
pub fn property_filters(properties: &Properties) -> Result<Vec<String>> {
    let mut filters = Vec::new();
    for (name, value) in properties {
        for (i, chunk) in chunks(name, value)?.into_iter().enumerate() {
            filters.push(format!("labels.{name}.{i}=={chunk}"));
        }
    }
    Ok(filters)
}

pub struct Container {
    container: Arc<dyn RuntimeContainer>,
    killer: Arc<dyn Killer>,
    rootfs_manager: Arc<dyn RootfsManager>,
    io_manager: Arc<IoManager>,
    fifo_dir: PathBuf,
}

impl Container {
    pub fn new(
        container: Arc<dyn RuntimeContainer>,
        killer: Arc<dyn Killer>,
        rootfs_manager: Arc<dyn RootfsManager>,
        io_manager: Arc<IoManager>,
        fifo_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            container,
            killer,
            rootfs_manager,
            io_manager,
            fifo_dir: fifo_dir.into(),
        }
    }

    async fn labels(&self) -> Result<HashMap<String, String>> {
        self.container.labels().await.map_err(RuntimeError::client("labels"))
    }

    async fn spec(&self) -> Result<Spec> {
        self.container
            .spec()
            .await
            .map_err(RuntimeError::client("container spec"))
    }

    /// Derives the spec of a process to exec from the container's init
    /// process.
    fn process_spec(
        &self,
        rootfs: &Path,
        base: OciProcess,
        spec: &ProcessSpec,
    ) -> Result<OciProcess> {
        let mut args = vec![spec.path.clone()];
        args.extend(spec.args.iter().cloned());

        let mut env = base.env().clone().unwrap_or_default();
        env.extend(spec.env.iter().cloned());

        let mut user = base.user().clone();
        let mut uid = user.uid();
        if !spec.user.is_empty() {
            let Some(passwd) = self
                .rootfs_manager
                .lookup_user(rootfs, &spec.user)
                .map_err(RuntimeError::rootfs("user lookup"))?
            else {
                return Err(RuntimeError::UserNotFound {
                    user: spec.user.clone(),
                });
            };

            let _ = user.set_uid(passwd.uid).set_gid(passwd.gid);
            env.push(format!("USER={}", spec.user));
            uid = passwd.uid;
        }

        let cwd = if spec.dir.is_empty() { "/" } else { spec.dir.as_str() };

        let mut process = base;
        let _ = process
            .set_args(Some(args))
            .set_env(Some(env_with_default_path(uid, &env)))
            .set_cwd(cwd.into())
            .set_user(user)
            .set_terminal(Some(spec.tty.is_some()));

        if let Some(window_size) =
            spec.tty.as_ref().and_then(|tty| tty.window_size)
        {
            let console_size = BoxBuilder::default()
                .width(u64::from(window_size.columns))
                .height(u64::from(window_size.rows))
                .build()
                .map_err(SpecError::from)?;
            let _ = process.set_console_size(Some(console_size));
        }

        Ok(process)
    }

    async fn stored_exit_status(&self) -> Result<Option<i32>> {
        let properties = labels_to_properties(&self.labels().await?);
        Ok(properties
            .get(EXIT_STATUS_KEY)
            .and_then(|code| code.parse::<i32>().ok()))
    }

    fn start_error(e: ClientError) -> RuntimeError {
        let message = e.to_string();
        if is_executable_not_found(&message) {
            return RuntimeError::ExecutableNotFound { message };
        }
        RuntimeError::client("proc start")(e)
    }
}

#[async_trait]
impl garden::Container for Container {
    fn handle(&self) -> String {
        self.container.id()
    }

    async fn stop(&self, kill: bool) -> Result<()> {
        let task = self
            .container
            .task(None)
            .await
            .map_err(RuntimeError::client("task lookup"))?;

        let behaviour = if kill {
            KillBehaviour::Ungracefully
        } else {
            KillBehaviour::Gracefully
        };
        self.killer
            .kill(task.as_ref(), behaviour)
            .await
            .map_err(RuntimeError::kill("kill"))
    }

    async fn info(&self) -> Result<ContainerInfo> {
        Err(RuntimeError::NotImplemented)
    }

    async fn stream_in(
        &self,
        _spec: StreamInSpec,
        _stream: InputStream,
    ) -> Result<()> {
        Err(RuntimeError::NotImplemented)
    }

    async fn stream_out(&self, _spec: StreamOutSpec) -> Result<InputStream> {
        Err(RuntimeError::NotImplemented)
    }

    async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits> {
        Err(RuntimeError::NotImplemented)
    }

    async fn current_cpu_limits(&self) -> Result<CpuLimits> {
        let spec = self.spec().await?;
        let shares = spec
            .linux()
            .as_ref()
            .and_then(|linux| linux.resources().as_ref())
            .and_then(|resources| resources.cpu().as_ref())
            .and_then(|cpu| cpu.shares());

        Ok(shares
            .map(|shares| CpuLimits { limit_in_shares: shares, weight: shares })
            .unwrap_or_default())
    }

    async fn current_disk_limits(&self) -> Result<DiskLimits> {
        Err(RuntimeError::NotImplemented)
    }

    async fn current_memory_limits(&self) -> Result<MemoryLimits> {
        let spec = self.spec().await?;
        let limit = spec
            .linux()
            .as_ref()
            .and_then(|linux| linux.resources().as_ref())
            .and_then(|resources| resources.memory().as_ref())
            .and_then(|memory| memory.limit())
            .and_then(|limit| u64::try_from(limit).ok());

        Ok(limit
            .map(|limit_in_bytes| MemoryLimits { limit_in_bytes })
            .unwrap_or_default())
    }

    async fn net_in(
        &self,
        _host_port: u32,
        _container_port: u32,
    ) -> Result<(u32, u32)> {
        Err(RuntimeError::NotImplemented)
    }

    async fn net_out(&self, _rule: NetOutRule) -> Result<()> {
        Err(RuntimeError::NotImplemented)
    }

    async fn bulk_net_out(&self, _rules: Vec<NetOutRule>) -> Result<()> {
        Err(RuntimeError::NotImplemented)
    }

    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn garden::Process>> {
        let container_spec = self.spec().await?;
        let rootfs = container_spec
            .root()
            .as_ref()
            .map(|root| root.path().clone())
            .unwrap_or_default();
        let base = container_spec.process().clone().unwrap_or_default();

        let process_spec = self.process_spec(&rootfs, base, &spec)?;
        self.rootfs_manager
            .setup_cwd(&rootfs, process_spec.cwd())
            .map_err(RuntimeError::rootfs("setup cwd"))?;

        let task = self
            .container
            .task(None)
            .await
            .map_err(RuntimeError::client("task retrieval"))?;

        let id = if spec.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            spec.id.clone()
        };
        let tty = spec.tty.is_some();
        let creator = self.io_manager.creator(cio::creator(
            self.fifo_dir.clone(),
            io,
            tty,
        ));

        let process = task
            .exec(&id, process_spec, creator)
            .await
            .map_err(RuntimeError::client("task exec"))?;

        let exit = process
            .wait()
            .await
            .map_err(RuntimeError::client("proc wait"))?;

        if let Err(e) = process.start().await {
            return Err(Self::start_error(e));
        }

        if !tty {
            process
                .close_io()
                .await
                .map_err(RuntimeError::client("proc closeio"))?;
        }

        Ok(Box::new(Process::new(
            process,
            Arc::clone(&self.container),
            Arc::clone(&self.io_manager),
            exit,
        )))
    }

    async fn attach(
        &self,
        process_id: &str,
        io: ProcessIo,
    ) -> Result<Box<dyn garden::Process>> {
        if process_id.is_empty() {
            return Err(RuntimeError::invalid_input("empty pid"));
        }

        let task = self
            .container
            .task(None)
            .await
            .map_err(RuntimeError::client("task"))?;

        let attach = self.io_manager.attach(process_id, cio::attacher(io));
        let process = match task.load_process(process_id, Some(attach)).await {
            Ok(process) => process,
            Err(e) if e.is_not_found() => {
                if let Some(code) = self.stored_exit_status().await? {
                    return Ok(Box::new(FinishedProcess::new(process_id, code)));
                }
                return Err(RuntimeError::client("load proc")(e));
            }
            Err(e) => return Err(RuntimeError::client("load proc")(e)),
        };

        let status = process
            .status()
            .await
            .map_err(RuntimeError::client("proc status"))?;
        if status != ProcessStatus::Running {
            return Err(RuntimeError::ProcessNotRunning { status });
        }

        let exit = process
            .wait()
            .await
            .map_err(RuntimeError::client("proc wait"))?;

        Ok(Box::new(Process::new(
            process,
            Arc::clone(&self.container),
            Arc::clone(&self.io_manager),
            exit,
        )))
    }

    async fn metrics(&self) -> Result<Metrics> {
        Err(RuntimeError::NotImplemented)
    }

    async fn set_grace_time(&self, grace_time: Duration) -> Result<()> {
        self.set_property(GRACE_TIME_KEY, &grace_time.as_nanos().to_string())
            .await
    }

    async fn properties(&self) -> Result<Properties> {
        Ok(labels_to_properties(&self.labels().await?))
    }

    async fn property(&self, name: &str) -> Result<String> {
        self.properties()
            .await?
            .remove(name)
            .ok_or_else(|| RuntimeError::PropertyNotFound { name: name.into() })
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        let properties = Properties::from([(name.to_string(), value.to_string())]);
        let mut labels = properties_to_labels(&properties)?;

        // blank out chunks left over from a longer previous value
        let prefix = format!("{name}.");
        for key in self.labels().await?.into_keys() {
            let stale = key
                .strip_prefix(&prefix)
                .map_or(false, |index| index.parse::<usize>().is_ok());
            if stale && !labels.contains_key(&key) {
                let _ = labels.insert(key, String::new());
            }
        }

        let _ = self
            .container
            .set_labels(labels)
            .await
            .map_err(RuntimeError::client("set label"))?;
        Ok(())
    }

    async fn remove_property(&self, _name: &str) -> Result<()> {
        Err(RuntimeError::NotImplemented)
    }
}
