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

//! Container networking: a CNI bridge plus iptables rules restricting where
//! containers may send traffic.

pub use self::{
    cni::{
        Cni, CniError, CniResult, InterfaceConfig, IpConfig, NetworkConfList,
        PluginCni, ADMIN_CHAIN_NAME,
    },
    firewall::{HostIptables, Iptables, IptablesError},
    resolv::ResolvConfError,
};
use crate::{
    client::Task,
    filestore::{FileStore, FileStoreError, HostFileStore},
};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use oci_spec::{
    runtime::{Mount, MountBuilder},
    OciSpecError,
};
use serde::{Deserialize, Serialize};
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

mod cni;
mod firewall;
pub mod resolv;

pub type Result<T> = std::result::Result<T, NetworkError>;

const FILTER_TABLE: &str = "filter";
const NETWORK_MOUNTS_DIR: &str = "networkmounts";

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("invalid network config: {0}")]
    InvalidConfig(String),
    #[error("{stage}: {source}")]
    FileStore { stage: &'static str, source: FileStoreError },
    #[error("{stage}: {source}")]
    Iptables { stage: String, source: IptablesError },
    #[error("{stage}: {source}")]
    Cni { stage: &'static str, source: CniError },
    #[error("cni net setup: no eth0 interface found")]
    NoInterface,
    #[error("generating resolv.conf: {0}")]
    ResolvConf(#[from] ResolvConfError),
    #[error("building mount: {0}")]
    Mount(#[from] OciSpecError),
}

impl NetworkError {
    /// The container never had an address assigned.
    pub fn is_ip_not_found(&self) -> bool {
        matches!(
            self,
            Self::FileStore { source: FileStoreError::IpNotFound { .. }, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Config {
    pub subnet: String,
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Self { subnet: "10.80.0.0/16".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Config {
    pub enabled: bool,
    pub subnet: String,
    /// Masquerade container traffic behind the host's address.
    pub ip_masq: bool,
}

impl Default for Ipv6Config {
    fn default() -> Self {
        Self { enabled: true, subnet: "fd9c:31a6:c759::/64".into(), ip_masq: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CniNetworkConfig {
    /// Bridge the containers' veths are connected to.
    pub bridge_name: String,
    pub network_name: String,
    pub mtu: Option<u32>,
    pub ipv4: Ipv4Config,
    pub ipv6: Ipv6Config,
    /// Where the CNI plugin binaries live.
    pub binaries_dir: PathBuf,
    /// Per-container network files go under `<work_dir>/networkmounts`.
    pub work_dir: PathBuf,
    /// Overrides the nameservers mirrored from the host.
    pub nameservers: Vec<String>,
    /// CIDRs containers must never reach.
    pub restricted_networks: Vec<String>,
    pub allow_host_access: bool,
    pub host_resolv_conf: PathBuf,
}

impl Default for CniNetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "concourse0".into(),
            network_name: "concourse".into(),
            mtu: None,
            ipv4: Ipv4Config::default(),
            ipv6: Ipv6Config::default(),
            binaries_dir: PathBuf::from("/usr/local/concourse/bin"),
            work_dir: PathBuf::from("/worker-state"),
            nameservers: Vec::new(),
            restricted_networks: Vec::new(),
            allow_host_access: false,
            host_resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

impl CniNetworkConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str, value: &str| {
            NetworkError::InvalidConfig(format!("{what} '{value}'"))
        };

        if self.bridge_name.is_empty() {
            return Err(invalid("bridge name", &self.bridge_name));
        }
        if self.binaries_dir.as_os_str().is_empty() {
            return Err(NetworkError::InvalidConfig(
                "missing binaries dir".into(),
            ));
        }

        let _: IpNetwork = self
            .ipv4
            .subnet
            .parse()
            .map_err(|_| invalid("ipv4 subnet", &self.ipv4.subnet))?;
        if self.ipv6.enabled {
            let _: IpNetwork = self
                .ipv6
                .subnet
                .parse()
                .map_err(|_| invalid("ipv6 subnet", &self.ipv6.subnet))?;
        }
        for network in &self.restricted_networks {
            let _: IpNetwork = network
                .parse()
                .map_err(|_| invalid("restricted network", network))?;
        }
        for nameserver in &self.nameservers {
            let _: IpAddr = nameserver
                .parse()
                .map_err(|_| invalid("nameserver", nameserver))?;
        }

        Ok(())
    }
}

/// Everything the backend needs from container networking.
#[async_trait]
pub trait Network: Send + Sync {
    /// Installs host-wide firewall rules. Safe to run on every start.
    async fn setup_host_network(&self) -> Result<()>;
    /// Creates the container's hosts, hostname and resolv.conf and returns
    /// bind mounts for them.
    async fn setup_mounts(&self, handle: &str) -> Result<Vec<Mount>>;
    /// Connects the task's network namespace to the bridge.
    async fn add(&self, task: &dyn Task, handle: &str) -> Result<()>;
    async fn remove(&self, task: &dyn Task, handle: &str) -> Result<()>;
    /// Drops all traffic originating from the container.
    async fn drop_container_traffic(&self, handle: &str) -> Result<()>;
    async fn resume_container_traffic(&self, handle: &str) -> Result<()>;
}

pub struct CniNetwork {
    cni: Arc<dyn Cni>,
    iptables: Arc<dyn Iptables>,
    store: Arc<dyn FileStore>,
    config: CniNetworkConfig,
}

impl CniNetwork {
    /// Wires the network to the host: CNI plugins from `binaries_dir`, the
    /// `iptables` binary and a file store under `work_dir`.
    pub fn new(config: CniNetworkConfig) -> Result<Self> {
        let iptables = HostIptables::new().map_err(|source| {
            NetworkError::Iptables { stage: "init".into(), source }
        })?;
        let store =
            HostFileStore::new(config.work_dir.join(NETWORK_MOUNTS_DIR));
        let cni = PluginCni::new(&config);

        Self::with_parts(
            config,
            Arc::new(cni),
            Arc::new(iptables),
            Arc::new(store),
        )
    }

    pub fn with_parts(
        config: CniNetworkConfig,
        cni: Arc<dyn Cni>,
        iptables: Arc<dyn Iptables>,
        store: Arc<dyn FileStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { cni, iptables, store, config })
    }

    fn iptables_error(
        stage: impl Into<String>,
    ) -> impl FnOnce(IptablesError) -> NetworkError {
        let stage = stage.into();
        move |source| NetworkError::Iptables { stage, source }
    }

    fn setup_restricted_networks(&self) -> Result<()> {
        self.iptables
            .create_chain_or_flush_if_exists(FILTER_TABLE, ADMIN_CHAIN_NAME)
            .map_err(Self::iptables_error("create chain or flush if exists"))?;

        // established connections skip the reject rules below
        self.iptables
            .append_rule(
                FILTER_TABLE,
                ADMIN_CHAIN_NAME,
                &[
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "RELATED,ESTABLISHED",
                    "-j",
                    "ACCEPT",
                ],
            )
            .map_err(Self::iptables_error(
                "appending accept rule for RELATED & ESTABLISHED connections",
            ))?;

        for network in &self.config.restricted_networks {
            self.iptables
                .append_rule(
                    FILTER_TABLE,
                    ADMIN_CHAIN_NAME,
                    &["-d", network.as_str(), "-j", "REJECT"],
                )
                .map_err(Self::iptables_error(format!(
                    "appending reject rule for restricted network {network}"
                )))?;
        }

        Ok(())
    }

    fn restrict_host_access(&self) -> Result<()> {
        self.iptables
            .append_unique_rule(
                FILTER_TABLE,
                "INPUT",
                &[
                    "-i",
                    self.config.bridge_name.as_str(),
                    "-j",
                    "REJECT",
                    "--reject-with",
                    "icmp-host-prohibited",
                ],
            )
            .map_err(Self::iptables_error("appending host access reject rule"))
    }

    fn store_error(
        stage: &'static str,
    ) -> impl FnOnce(FileStoreError) -> NetworkError {
        move |source| NetworkError::FileStore { stage, source }
    }

    fn bind_mount(destination: &str, source: PathBuf) -> Result<Mount> {
        Ok(MountBuilder::default()
            .destination(destination)
            .typ("bind")
            .source(source)
            .options(vec!["bind".to_string(), "rw".to_string()])
            .build()?)
    }
}

fn netns_path(task: &dyn Task) -> String {
    format!("/proc/{}/ns/net", task.pid())
}

fn check_handle(handle: &str) -> Result<()> {
    if handle.is_empty() {
        return Err(NetworkError::InvalidInput("empty handle".into()));
    }
    Ok(())
}

#[async_trait]
impl Network for CniNetwork {
    async fn setup_host_network(&self) -> Result<()> {
        self.setup_restricted_networks()?;
        if !self.config.allow_host_access {
            self.restrict_host_access()?;
        }
        Ok(())
    }

    async fn setup_mounts(&self, handle: &str) -> Result<Vec<Mount>> {
        check_handle(handle)?;
        let dir = Path::new(handle);

        let hosts = self
            .store
            .create(&dir.join("hosts"), b"127.0.0.1 localhost\n")
            .map_err(Self::store_error("creating /etc/hosts"))?;

        let hostname = self
            .store
            .create(&dir.join("hostname"), format!("{handle}\n").as_bytes())
            .map_err(Self::store_error("creating /etc/hostname"))?;

        let resolv_conf = resolv::contents(
            &self.config.nameservers,
            &self.config.host_resolv_conf,
        )?;
        let resolv_conf = self
            .store
            .create(&dir.join("resolv.conf"), resolv_conf.as_bytes())
            .map_err(Self::store_error("creating /etc/resolv.conf"))?;

        Ok(vec![
            Self::bind_mount("/etc/hosts", hosts)?,
            Self::bind_mount("/etc/hostname", hostname)?,
            Self::bind_mount("/etc/resolv.conf", resolv_conf)?,
        ])
    }

    async fn add(&self, task: &dyn Task, handle: &str) -> Result<()> {
        check_handle(handle)?;

        let result = self
            .cni
            .setup(&task.id(), &netns_path(task))
            .await
            .map_err(|source| NetworkError::Cni {
                stage: "cni net setup",
                source,
            })?;

        let Some(ip) = result
            .interfaces
            .get("eth0")
            .and_then(|eth0| eth0.ip_configs.first())
            .map(|config| config.ip)
        else {
            return Err(NetworkError::NoInterface);
        };

        // the address is only known once the task is attached
        self.store
            .append(
                &Path::new(handle).join("hosts"),
                format!("{ip} {handle}\n").as_bytes(),
            )
            .map_err(Self::store_error("updating /etc/hosts"))
    }

    async fn remove(&self, task: &dyn Task, handle: &str) -> Result<()> {
        check_handle(handle)?;

        self.cni
            .remove(&task.id(), &netns_path(task))
            .await
            .map_err(|source| NetworkError::Cni {
                stage: "cni net teardown",
                source,
            })?;

        self.store
            .delete(Path::new(handle))
            .map_err(Self::store_error("cni network mounts teardown"))
    }

    async fn drop_container_traffic(&self, handle: &str) -> Result<()> {
        let ip = self
            .store
            .container_ip_lookup(handle)
            .map_err(Self::store_error("getting container ip"))?
            .to_string();

        for chain in ["INPUT", "FORWARD"] {
            self.iptables
                .insert_rule(
                    FILTER_TABLE,
                    chain,
                    1,
                    &["-s", ip.as_str(), "-j", "DROP"],
                )
                .map_err(Self::iptables_error(format!(
                    "inserting drop rule into {chain}"
                )))?;
        }
        Ok(())
    }

    async fn resume_container_traffic(&self, handle: &str) -> Result<()> {
        let ip = self
            .store
            .container_ip_lookup(handle)
            .map_err(Self::store_error("getting container ip"))?
            .to_string();

        for chain in ["INPUT", "FORWARD"] {
            self.iptables
                .delete_rule(
                    FILTER_TABLE,
                    chain,
                    &["-s", ip.as_str(), "-j", "DROP"],
                )
                .map_err(Self::iptables_error(format!(
                    "deleting drop rule from {chain}"
                )))?;
        }
        Ok(())
    }
}
