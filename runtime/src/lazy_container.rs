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

use crate::{
    error::Result,
    garden::{
        Backend, BandwidthLimits, Container, ContainerInfo, CpuLimits,
        DiskLimits, InputStream, MemoryLimits, Metrics, NetOutRule, Process,
        ProcessIo, ProcessSpec, Properties, StreamInSpec, StreamOutSpec,
    },
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;

enum Resolution {
    Unresolved,
    Resolved(Arc<dyn Container>),
}

/// A container known only by its handle, looked up on first use.
pub struct LazyContainer {
    handle: String,
    backend: Arc<dyn Backend>,
    state: Mutex<Resolution>,
}

impl LazyContainer {
    pub fn new(handle: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            handle: handle.into(),
            backend,
            state: Mutex::new(Resolution::Unresolved),
        }
    }

    /// Wraps an already resolved container.
    pub fn resolved(
        container: Arc<dyn Container>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            handle: container.handle(),
            backend,
            state: Mutex::new(Resolution::Resolved(container)),
        }
    }

    async fn container(&self) -> Result<Arc<dyn Container>> {
        let mut state = self.state.lock().await;
        if let Resolution::Resolved(container) = &*state {
            return Ok(Arc::clone(container));
        }

        let container = self.backend.lookup(&self.handle).await?;
        *state = Resolution::Resolved(Arc::clone(&container));
        Ok(container)
    }
}

#[async_trait]
impl Container for LazyContainer {
    fn handle(&self) -> String {
        self.handle.clone()
    }

    async fn stop(&self, kill: bool) -> Result<()> {
        self.container().await?.stop(kill).await
    }

    async fn info(&self) -> Result<ContainerInfo> {
        self.container().await?.info().await
    }

    async fn stream_in(
        &self,
        spec: StreamInSpec,
        stream: InputStream,
    ) -> Result<()> {
        self.container().await?.stream_in(spec, stream).await
    }

    async fn stream_out(&self, spec: StreamOutSpec) -> Result<InputStream> {
        self.container().await?.stream_out(spec).await
    }

    async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits> {
        self.container().await?.current_bandwidth_limits().await
    }

    async fn current_cpu_limits(&self) -> Result<CpuLimits> {
        self.container().await?.current_cpu_limits().await
    }

    async fn current_disk_limits(&self) -> Result<DiskLimits> {
        self.container().await?.current_disk_limits().await
    }

    async fn current_memory_limits(&self) -> Result<MemoryLimits> {
        self.container().await?.current_memory_limits().await
    }

    async fn net_in(
        &self,
        host_port: u32,
        container_port: u32,
    ) -> Result<(u32, u32)> {
        self.container().await?.net_in(host_port, container_port).await
    }

    async fn net_out(&self, rule: NetOutRule) -> Result<()> {
        self.container().await?.net_out(rule).await
    }

    async fn bulk_net_out(&self, rules: Vec<NetOutRule>) -> Result<()> {
        self.container().await?.bulk_net_out(rules).await
    }

    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        self.container().await?.run(spec, io).await
    }

    async fn attach(
        &self,
        process_id: &str,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>> {
        self.container().await?.attach(process_id, io).await
    }

    async fn metrics(&self) -> Result<Metrics> {
        self.container().await?.metrics().await
    }

    async fn set_grace_time(&self, grace_time: Duration) -> Result<()> {
        self.container().await?.set_grace_time(grace_time).await
    }

    async fn properties(&self) -> Result<Properties> {
        self.container().await?.properties().await
    }

    async fn property(&self, name: &str) -> Result<String> {
        self.container().await?.property(name).await
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.container().await?.set_property(name, value).await
    }

    async fn remove_property(&self, name: &str) -> Result<()> {
        self.container().await?.remove_property(name).await
    }
}
