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

//! The handle-based container-management contract served to CI workers.

use crate::error::Result;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};

/// Free-form container metadata, stored as runtime labels.
pub type Properties = HashMap<String, String>;

pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Streams connected to a process' stdio. Missing streams are discarded.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<InputStream>,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRef {
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMountMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMountOrigin {
    Host,
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
    pub origin: BindMountOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetOutRule {
    pub protocol: Protocol,
    /// Destination CIDRs.
    pub networks: Vec<String>,
    /// Inclusive destination port ranges.
    pub ports: Vec<(u16, u16)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuLimits {
    pub limit_in_shares: u64,
    pub weight: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryLimits {
    pub limit_in_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PidLimits {
    pub max: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthLimits {
    pub rate_in_bytes_per_second: u64,
    pub burst_rate_in_bytes_per_second: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskLimits {
    pub inode_soft: u64,
    pub inode_hard: u64,
    pub byte_soft: u64,
    pub byte_hard: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub bandwidth: BandwidthLimits,
    pub cpu: CpuLimits,
    pub disk: DiskLimits,
    pub memory: MemoryLimits,
    pub pid: PidLimits,
}

/// A request to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub handle: String,
    pub grace_time: Option<Duration>,
    /// `raw:///absolute/path` of an already unpacked root filesystem.
    pub rootfs_path: String,
    pub image: ImageRef,
    pub properties: Properties,
    pub env: Vec<String>,
    pub privileged: bool,
    pub limits: Limits,
    pub bind_mounts: Vec<BindMount>,
    /// No rules means the container gets no outbound traffic at all.
    pub net_out: Vec<NetOutRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtySpec {
    pub window_size: Option<WindowSize>,
}

/// A request to run a process inside a container.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Generated when empty.
    pub id: String,
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    /// Defaults to `/`.
    pub dir: String,
    pub user: String,
    pub tty: Option<TtySpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacity {
    pub memory_in_bytes: u64,
    pub disk_in_bytes: u64,
    pub max_containers: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub state: String,
    pub container_ip: String,
    pub external_ip: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub memory_usage_in_bytes: u64,
    pub cpu_usage_in_ns: u64,
    pub age: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInSpec {
    pub path: String,
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutSpec {
    pub path: String,
    pub user: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
    async fn ping(&self) -> Result<()>;
    async fn capacity(&self) -> Result<Capacity>;
    async fn create(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>>;
    async fn destroy(&self, handle: &str) -> Result<()>;
    async fn containers(
        &self,
        filter: Properties,
    ) -> Result<Vec<Arc<dyn Container>>>;
    async fn bulk_info(
        &self,
        handles: &[String],
    ) -> Result<HashMap<String, ContainerInfo>>;
    async fn bulk_metrics(
        &self,
        handles: &[String],
    ) -> Result<HashMap<String, Metrics>>;
    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>>;
    async fn grace_time(&self, container: &dyn Container) -> Duration;
}

#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> String;
    async fn stop(&self, kill: bool) -> Result<()>;
    async fn info(&self) -> Result<ContainerInfo>;
    async fn stream_in(
        &self,
        spec: StreamInSpec,
        stream: InputStream,
    ) -> Result<()>;
    async fn stream_out(&self, spec: StreamOutSpec) -> Result<InputStream>;
    async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits>;
    async fn current_cpu_limits(&self) -> Result<CpuLimits>;
    async fn current_disk_limits(&self) -> Result<DiskLimits>;
    async fn current_memory_limits(&self) -> Result<MemoryLimits>;
    async fn net_in(
        &self,
        host_port: u32,
        container_port: u32,
    ) -> Result<(u32, u32)>;
    async fn net_out(&self, rule: NetOutRule) -> Result<()>;
    async fn bulk_net_out(&self, rules: Vec<NetOutRule>) -> Result<()>;
    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>>;
    async fn attach(
        &self,
        process_id: &str,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>>;
    async fn metrics(&self) -> Result<Metrics>;
    async fn set_grace_time(&self, grace_time: Duration) -> Result<()>;
    async fn properties(&self) -> Result<Properties>;
    async fn property(&self, name: &str) -> Result<String>;
    async fn set_property(&self, name: &str, value: &str) -> Result<()>;
    async fn remove_property(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait Process: Send + Sync {
    fn id(&self) -> String;
    /// Blocks until the process exits and its output is drained.
    async fn wait(&self) -> Result<i32>;
    async fn set_tty(&self, tty: TtySpec) -> Result<()>;
    async fn signal(&self, signal: Signal) -> Result<()>;
}
