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

use nix::ifaddrs::getifaddrs;
use std::{
    fs, io,
    net::{IpAddr, Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolvConfError {
    #[error("reading '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },
}

/// Builds the content of a container's `/etc/resolv.conf`.
///
/// Configured nameservers win. Without any, the host's resolv.conf is
/// mirrored, with loopback resolvers swapped for the host's own address.
pub fn contents(
    nameservers: &[String],
    host_resolv_conf: &Path,
) -> Result<String, ResolvConfError> {
    let entries = if nameservers.is_empty() {
        let host = fs::read_to_string(host_resolv_conf).map_err(|source| {
            ResolvConfError::Read {
                path: host_resolv_conf.to_path_buf(),
                source,
            }
        })?;
        parse_host_resolv_conf(&host, host_ipv4())
    } else {
        nameservers.iter().map(|ns| format!("nameserver {ns}")).collect()
    };

    Ok(entries.join("\n") + "\n")
}

/// Keeps the meaningful lines of a resolv.conf. Loopback nameservers are
/// unreachable from inside a container: they are replaced by `host_ip`, or
/// dropped when the host has no usable address.
pub fn parse_host_resolv_conf(
    content: &str,
    host_ip: Option<Ipv4Addr>,
) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let is_loopback_nameserver = fields.next() == Some("nameserver")
            && fields
                .next()
                .and_then(|addr| addr.parse::<IpAddr>().ok())
                .map_or(false, |addr| addr.is_loopback());

        let entry = match (is_loopback_nameserver, host_ip) {
            (false, _) => line.to_string(),
            (true, Some(ip)) => format!("nameserver {ip}"),
            (true, None) => continue,
        };

        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    entries
}

/// First non-loopback IPv4 address of the host.
fn host_ipv4() -> Option<Ipv4Addr> {
    getifaddrs()
        .ok()?
        .filter_map(|ifaddr| {
            let sin = *ifaddr.address?.as_sockaddr_in()?;
            Some(*SocketAddrV4::from(sin).ip())
        })
        .find(|ip| !ip.is_loopback())
}
