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

//! The [garden::Backend] creating and destroying containers on the runtime.

use crate::{
    cio,
    client::{Client, RuntimeContainer},
    container::{properties_to_labels, property_filters, Container, GRACE_TIME_KEY},
    error::{Result, RuntimeError},
    garden::{
        self, Capacity, ContainerInfo, ContainerSpec, Metrics, Properties,
    },
    hooks::load_hooks,
    io_manager::IoManager,
    killer::{KillBehaviour, Killer, SignalProcessKiller, TaskKiller},
    lock::TimeoutWithByPassLock,
    network::Network,
    rootfs::{HostRootfsManager, RootfsManager},
    spec::{
        load_seccomp_profile, oci_spec, PrivilegedMode, SpecError, SpecOptions,
        DEFAULT_INIT_BIN_PATH, INIT_BIN_MOUNT,
    },
    userns::{HostUserNamespace, UserNamespace},
};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Containers allowed at once. 0 means unlimited, which also disables
    /// the creation lock.
    pub max_containers: usize,
    /// Seconds a creation waits for the creation lock.
    #[serde(deserialize_with = "seconds")]
    pub request_timeout: Duration,
    pub init_bin_path: PathBuf,
    pub privileged_mode: PrivilegedMode,
    pub seccomp_profile: Option<PathBuf>,
    pub oci_hooks_dir: Option<PathBuf>,
    /// Seconds the killer waits for each signalled process.
    #[serde(deserialize_with = "seconds")]
    pub grace_period: Duration,
    pub fifo_dir: PathBuf,
    /// Whether memory limits also apply to swap.
    pub swap_limit: bool,
}

fn seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_containers: 0,
            request_timeout: Duration::from_secs(60),
            init_bin_path: DEFAULT_INIT_BIN_PATH.into(),
            privileged_mode: PrivilegedMode::default(),
            seccomp_profile: None,
            oci_hooks_dir: None,
            grace_period: crate::killer::DEFAULT_GRACE_PERIOD,
            fifo_dir: PathBuf::from("/run/concourse/io"),
            swap_limit: true,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(RuntimeError::invalid_input(
                "request timeout must be positive",
            ));
        }
        if self.grace_period.is_zero() {
            return Err(RuntimeError::invalid_input(
                "grace period must be positive",
            ));
        }
        if !self.init_bin_path.is_absolute() {
            return Err(RuntimeError::invalid_input(format!(
                "init binary path {} must be absolute",
                self.init_bin_path.display()
            )));
        }
        if !self.fifo_dir.is_absolute() {
            return Err(RuntimeError::invalid_input(format!(
                "fifo dir {} must be absolute",
                self.fifo_dir.display()
            )));
        }
        Ok(())
    }
}

/// Everything the backend delegates to besides the runtime client.
pub struct Collaborators {
    pub network: Arc<dyn Network>,
    pub killer: Arc<dyn Killer>,
    pub rootfs_manager: Arc<dyn RootfsManager>,
    pub user_namespace: Arc<dyn UserNamespace>,
    pub io_manager: Arc<IoManager>,
}

impl Collaborators {
    /// The host implementations, around the given network.
    pub fn default_for(config: &BackendConfig, network: Arc<dyn Network>) -> Self {
        Self {
            network,
            killer: Arc::new(TaskKiller::new(
                Arc::new(SignalProcessKiller),
                config.grace_period,
            )),
            rootfs_manager: Arc::new(HostRootfsManager),
            user_namespace: Arc::new(HostUserNamespace::default()),
            io_manager: Arc::new(IoManager::new()),
        }
    }
}

pub struct GardenBackend {
    client: Arc<dyn Client>,
    config: BackendConfig,
    spec_options: SpecOptions,
    network: Arc<dyn Network>,
    killer: Arc<dyn Killer>,
    rootfs_manager: Arc<dyn RootfsManager>,
    user_namespace: Arc<dyn UserNamespace>,
    io_manager: Arc<IoManager>,
    create_lock: TimeoutWithByPassLock,
}

impl GardenBackend {
    pub fn new(
        client: Arc<dyn Client>,
        config: BackendConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let seccomp = config
            .seccomp_profile
            .as_deref()
            .map(load_seccomp_profile)
            .transpose()?;
        let hooks = config
            .oci_hooks_dir
            .as_deref()
            .map(|dir| load_hooks(dir, INIT_BIN_MOUNT))
            .transpose()
            .map_err(SpecError::from)?;

        let spec_options = SpecOptions {
            init_bin_path: config.init_bin_path.clone(),
            seccomp,
            hooks,
            privileged_mode: config.privileged_mode,
            swap_limit: config.swap_limit,
        };

        let create_lock = TimeoutWithByPassLock::new(
            config.max_containers > 0,
            config.request_timeout,
        );

        let Collaborators {
            network,
            killer,
            rootfs_manager,
            user_namespace,
            io_manager,
        } = collaborators;

        Ok(Self {
            client,
            config,
            spec_options,
            network,
            killer,
            rootfs_manager,
            user_namespace,
            io_manager,
            create_lock,
        })
    }

    fn wrap(&self, container: Arc<dyn RuntimeContainer>) -> Arc<dyn garden::Container> {
        Arc::new(Container::new(
            container,
            Arc::clone(&self.killer),
            Arc::clone(&self.rootfs_manager),
            Arc::clone(&self.io_manager),
            self.config.fifo_dir.clone(),
        ))
    }

    async fn check_capacity(&self) -> Result<()> {
        let max = self.config.max_containers;
        if max == 0 {
            return Ok(());
        }

        let containers = self
            .client
            .containers(&[])
            .await
            .map_err(RuntimeError::client("list containers"))?;
        if containers.len() >= max {
            return Err(RuntimeError::MaxContainersReached { max });
        }
        Ok(())
    }
}

#[async_trait]
impl garden::Backend for GardenBackend {
    #[tracing::instrument(skip(self))]
    async fn start(&self) -> Result<()> {
        self.client
            .init()
            .await
            .map_err(RuntimeError::client("client init"))?;
        self.network
            .setup_host_network()
            .await
            .map_err(RuntimeError::network("setup host network"))?;

        info!("GardenBackend: start()");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn stop(&self) {
        if let Err(e) = self.client.stop().await {
            warn!("failed to stop runtime client: {e}");
        }
    }

    async fn ping(&self) -> Result<()> {
        let _ = self
            .client
            .version()
            .await
            .map_err(RuntimeError::client("version"))?;
        Ok(())
    }

    async fn capacity(&self) -> Result<Capacity> {
        Err(RuntimeError::NotImplemented)
    }

    #[tracing::instrument(skip(self, spec), fields(handle = %spec.handle))]
    async fn create(
        &self,
        spec: ContainerSpec,
    ) -> Result<Arc<dyn garden::Container>> {
        let _guard =
            self.create_lock.acquire().await.map_err(RuntimeError::CreateLock)?;
        self.check_capacity().await?;

        let (max_uid, max_gid) = self.user_namespace.max_valid_ids()?;
        let mut oci = oci_spec(&self.spec_options, &spec, max_uid, max_gid)?;

        let network_mounts = self
            .network
            .setup_mounts(&spec.handle)
            .await
            .map_err(RuntimeError::network("network setup mounts"))?;
        let mut mounts = oci.mounts().clone().unwrap_or_default();
        mounts.extend(network_mounts);
        let _ = oci.set_mounts(Some(mounts));

        let mut properties = spec.properties.clone();
        if let Some(grace_time) = spec.grace_time {
            let _ = properties.insert(
                GRACE_TIME_KEY.to_string(),
                grace_time.as_nanos().to_string(),
            );
        }
        let labels = properties_to_labels(&properties)?;

        let container = self
            .client
            .new_container(&spec.handle, labels, oci)
            .await
            .map_err(RuntimeError::client("new container"))?;

        let task = container
            .new_task(self.io_manager.creator(cio::null_io()))
            .await
            .map_err(RuntimeError::client("new task"))?;

        self.network
            .add(task.as_ref(), &spec.handle)
            .await
            .map_err(RuntimeError::network("network add"))?;

        task.start().await.map_err(RuntimeError::client("task start"))?;

        if spec.net_out.is_empty() {
            self.network
                .drop_container_traffic(&spec.handle)
                .await
                .map_err(RuntimeError::network("drop container traffic"))?;
        }

        info!("GardenBackend: create() handle={}", spec.handle);
        Ok(self.wrap(container))
    }

    #[tracing::instrument(skip(self))]
    async fn destroy(&self, handle: &str) -> Result<()> {
        if handle.is_empty() {
            return Err(RuntimeError::invalid_input("empty handle"));
        }

        let container = self
            .client
            .get_container(handle)
            .await
            .map_err(RuntimeError::client("get container"))?;

        let task = match container.task(None).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                info!("GardenBackend: destroy() handle={handle} without task");
                return container
                    .delete()
                    .await
                    .map_err(RuntimeError::client("delete container"));
            }
            Err(e) => return Err(RuntimeError::client("task lookup")(e)),
        };

        self.killer
            .kill(task.as_ref(), KillBehaviour::Gracefully)
            .await
            .map_err(RuntimeError::kill("kill task"))?;

        match self.network.resume_container_traffic(handle).await {
            Ok(()) => {}
            Err(e) if e.is_ip_not_found() => {}
            Err(e) => {
                return Err(RuntimeError::network("resume container traffic")(e))
            }
        }

        self.network
            .remove(task.as_ref(), handle)
            .await
            .map_err(RuntimeError::network("network remove"))?;

        let _ = task
            .delete()
            .await
            .map_err(RuntimeError::client("task delete"))?;

        container
            .delete()
            .await
            .map_err(RuntimeError::client("delete container"))?;

        info!("GardenBackend: destroy() handle={handle}");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn containers(
        &self,
        filter: Properties,
    ) -> Result<Vec<Arc<dyn garden::Container>>> {
        for (key, value) in &filter {
            if key.is_empty() || value.is_empty() {
                return Err(RuntimeError::invalid_input(format!(
                    "invalid property filter '{key}={value}': key and value must not be empty"
                )));
            }
        }

        let filters = property_filters(&filter)?;
        let containers = self
            .client
            .containers(&filters)
            .await
            .map_err(RuntimeError::client("list containers"))?;

        Ok(containers.into_iter().map(|c| self.wrap(c)).collect())
    }

    async fn bulk_info(
        &self,
        _handles: &[String],
    ) -> Result<HashMap<String, ContainerInfo>> {
        Err(RuntimeError::NotImplemented)
    }

    async fn bulk_metrics(
        &self,
        _handles: &[String],
    ) -> Result<HashMap<String, Metrics>> {
        Err(RuntimeError::NotImplemented)
    }

    #[tracing::instrument(skip(self))]
    async fn lookup(&self, handle: &str) -> Result<Arc<dyn garden::Container>> {
        if handle.is_empty() {
            return Err(RuntimeError::invalid_input("empty handle"));
        }

        let container = self
            .client
            .get_container(handle)
            .await
            .map_err(RuntimeError::client("get container"))?;
        Ok(self.wrap(container))
    }

    async fn grace_time(&self, container: &dyn garden::Container) -> Duration {
        container
            .property(GRACE_TIME_KEY)
            .await
            .ok()
            .and_then(|nanos| nanos.parse::<u64>().ok())
            .map(Duration::from_nanos)
            .unwrap_or_default()
    }
}
