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

//! Attaching containers to the bridge network through CNI plugins.

use super::CniNetworkConfig;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    io,
    net::IpAddr,
    path::PathBuf,
    process::Stdio,
};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

pub type Result<T> = std::result::Result<T, CniError>;

pub const CNI_VERSION: &str = "0.4.0";
pub const ADMIN_CHAIN_NAME: &str = "CONCOURSE-OPERATOR";

const LOOPBACK_NETWORK_NAME: &str = "cni-loopback";

#[derive(Error, Debug)]
pub enum CniError {
    #[error("plugin configuration without a type: {config}")]
    MissingPluginType { config: Value },
    #[error("running plugin '{plugin}': {source}")]
    Exec { plugin: String, source: io::Error },
    #[error("plugin '{plugin}' failed with code {code}: {message}")]
    Plugin { plugin: String, code: u32, message: String },
    #[error("plugin '{plugin}' returned an invalid result: {source}")]
    InvalidResult { plugin: String, source: serde_json::Error },
    #[error("invalid address '{address}' in result of plugin '{plugin}'")]
    InvalidAddress { plugin: String, address: String },
}

/// Interfaces created for a container, keyed by interface name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniResult {
    pub interfaces: HashMap<String, InterfaceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub mac: String,
    pub sandbox: String,
    pub ip_configs: Vec<IpConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    pub ip: IpAddr,
    pub gateway: Option<IpAddr>,
}

#[async_trait]
pub trait Cni: Send + Sync {
    /// Attaches the network namespace at `netns` to every network.
    async fn setup(&self, id: &str, netns: &str) -> Result<CniResult>;
    /// Detaches it again, in reverse order.
    async fn remove(&self, id: &str, netns: &str) -> Result<()>;
}

/// A CNI network configuration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfList {
    pub name: String,
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub plugins: Vec<Value>,
}

impl CniNetworkConfig {
    pub fn conflist_v4(&self) -> NetworkConfList {
        self.conflist(&self.ipv4.subnet, "0.0.0.0/0", true)
    }

    pub fn conflist_v6(&self) -> Option<NetworkConfList> {
        self.ipv6
            .enabled
            .then(|| self.conflist(&self.ipv6.subnet, "::/0", self.ipv6.ip_masq))
    }

    fn conflist(
        &self,
        subnet: &str,
        default_route: &str,
        ip_masq: bool,
    ) -> NetworkConfList {
        let mut bridge = json!({
            "type": "bridge",
            "bridge": self.bridge_name,
            "isGateway": true,
            "ipMasq": ip_masq,
            "ipam": {
                "type": "host-local",
                "ranges": [[{ "subnet": subnet }]],
                "routes": [{ "dst": subnet }, { "dst": default_route }],
            },
        });
        if let (Some(mtu), Some(bridge)) = (self.mtu, bridge.as_object_mut()) {
            let _ = bridge.insert("mtu".into(), json!(mtu));
        }

        NetworkConfList {
            name: self.network_name.clone(),
            cni_version: CNI_VERSION.into(),
            plugins: vec![
                bridge,
                json!({
                    "type": "firewall",
                    "iptablesAdminChainName": ADMIN_CHAIN_NAME,
                }),
            ],
        }
    }
}

pub fn loopback_conflist() -> NetworkConfList {
    NetworkConfList {
        name: LOOPBACK_NETWORK_NAME.into(),
        cni_version: CNI_VERSION.into(),
        plugins: vec![json!({ "type": "loopback" })],
    }
}

#[derive(Debug, Clone)]
struct Attachment {
    ifname: String,
    conflist: NetworkConfList,
}

/// [Cni] executing plugin binaries per the CNI protocol: parameters in
/// `CNI_*` environment variables, network configuration on stdin, result on
/// stdout.
#[derive(Debug, Clone)]
pub struct PluginCni {
    binaries_dir: PathBuf,
    attachments: Vec<Attachment>,
}

impl PluginCni {
    /// Loopback on `lo`, then the IPv4 network on `eth0` and, when enabled,
    /// the IPv6 network on `eth1`.
    pub fn new(config: &CniNetworkConfig) -> Self {
        let networks = [Some(config.conflist_v4()), config.conflist_v6()];
        let mut attachments = vec![Attachment {
            ifname: "lo".into(),
            conflist: loopback_conflist(),
        }];
        attachments.extend(networks.into_iter().flatten().enumerate().map(
            |(index, conflist)| Attachment {
                ifname: format!("eth{index}"),
                conflist,
            },
        ));

        Self { binaries_dir: config.binaries_dir.clone(), attachments }
    }

    async fn exec_plugin(
        &self,
        command: &str,
        plugin: &Value,
        attachment: &Attachment,
        id: &str,
        netns: &str,
        prev_result: Option<&Value>,
    ) -> Result<Value> {
        let Some(plugin_type) = plugin.get("type").and_then(Value::as_str)
        else {
            return Err(CniError::MissingPluginType { config: plugin.clone() });
        };
        let plugin_name = plugin_type.to_string();
        let exec_error =
            |source| CniError::Exec { plugin: plugin_name.clone(), source };

        let mut config = plugin.clone();
        if let Some(config) = config.as_object_mut() {
            let _ = config
                .insert("name".into(), json!(attachment.conflist.name));
            let _ = config.insert(
                "cniVersion".into(),
                json!(attachment.conflist.cni_version),
            );
            if let Some(prev_result) = prev_result {
                let _ = config.insert("prevResult".into(), prev_result.clone());
            }
        }
        let stdin = serde_json::to_vec(&config).map_err(|source| {
            CniError::InvalidResult { plugin: plugin_name.clone(), source }
        })?;

        let mut child = Command::new(self.binaries_dir.join(plugin_type))
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", &attachment.ifname)
            .env("CNI_PATH", &self.binaries_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(exec_error)?;

        if let Some(mut child_stdin) = child.stdin.take() {
            child_stdin.write_all(&stdin).await.map_err(exec_error)?;
        }
        let output = child.wait_with_output().await.map_err(exec_error)?;

        if !output.status.success() {
            return Err(plugin_failure(plugin_name, &output.stdout, &output.stderr));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|source| CniError::InvalidResult { plugin: plugin_name, source })
    }
}

#[derive(Deserialize)]
struct PluginErrorOutput {
    code: u32,
    msg: String,
    #[serde(default)]
    details: String,
}

fn plugin_failure(plugin: String, stdout: &[u8], stderr: &[u8]) -> CniError {
    match serde_json::from_slice::<PluginErrorOutput>(stdout) {
        Ok(PluginErrorOutput { code, msg, details }) if details.is_empty() => {
            CniError::Plugin { plugin, code, message: msg }
        }
        Ok(PluginErrorOutput { code, msg, details }) => CniError::Plugin {
            plugin,
            code,
            message: format!("{msg}; {details}"),
        },
        Err(_) => CniError::Plugin {
            plugin,
            code: 0,
            message: String::from_utf8_lossy(stderr).trim().to_string(),
        },
    }
}

#[derive(Deserialize)]
struct PluginResult {
    #[serde(default)]
    interfaces: Vec<ResultInterface>,
    #[serde(default)]
    ips: Vec<ResultIp>,
}

#[derive(Deserialize)]
struct ResultInterface {
    name: String,
    #[serde(default)]
    mac: String,
    #[serde(default)]
    sandbox: String,
}

#[derive(Deserialize)]
struct ResultIp {
    #[serde(default)]
    interface: Option<usize>,
    address: String,
    #[serde(default)]
    gateway: Option<String>,
}

/// Folds a final plugin result into `result`, keeping only interfaces that
/// live inside the container's namespace.
fn merge_result(
    result: &mut CniResult,
    plugin: &str,
    value: Value,
) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let parsed: PluginResult = serde_json::from_value(value).map_err(
        |source| CniError::InvalidResult { plugin: plugin.into(), source },
    )?;

    let invalid = |address: &str| CniError::InvalidAddress {
        plugin: plugin.into(),
        address: address.into(),
    };

    for (index, interface) in parsed.interfaces.iter().enumerate() {
        if interface.sandbox.is_empty() {
            continue;
        }

        let mut ip_configs = Vec::new();
        for ip in parsed.ips.iter().filter(|ip| ip.interface == Some(index)) {
            let network: IpNetwork =
                ip.address.parse().map_err(|_| invalid(&ip.address))?;
            let gateway = match &ip.gateway {
                Some(gateway) => {
                    Some(gateway.parse().map_err(|_| invalid(gateway))?)
                }
                None => None,
            };
            ip_configs.push(IpConfig { ip: network.ip(), gateway });
        }

        let _ = result.interfaces.insert(
            interface.name.clone(),
            InterfaceConfig {
                mac: interface.mac.clone(),
                sandbox: interface.sandbox.clone(),
                ip_configs,
            },
        );
    }

    Ok(())
}

#[async_trait]
impl Cni for PluginCni {
    async fn setup(&self, id: &str, netns: &str) -> Result<CniResult> {
        let mut result = CniResult::default();

        for attachment in &self.attachments {
            let mut prev_result: Option<Value> = None;
            let mut last_plugin = String::new();
            for plugin in &attachment.conflist.plugins {
                let value = self
                    .exec_plugin(
                        "ADD",
                        plugin,
                        attachment,
                        id,
                        netns,
                        prev_result.as_ref(),
                    )
                    .await?;
                last_plugin = plugin
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                // plugins printing nothing pass the previous result along
                if !value.is_null() {
                    prev_result = Some(value);
                }
            }
            if let Some(value) = prev_result {
                merge_result(&mut result, &last_plugin, value)?;
            }
        }

        Ok(result)
    }

    async fn remove(&self, id: &str, netns: &str) -> Result<()> {
        for attachment in self.attachments.iter().rev() {
            for plugin in attachment.conflist.plugins.iter().rev() {
                let _ = self
                    .exec_plugin("DEL", plugin, attachment, id, netns, None)
                    .await?;
            }
        }
        Ok(())
    }
}
