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

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IptablesError>;

#[derive(Error, Debug)]
pub enum IptablesError {
    #[error("initializing iptables: {message}")]
    Init { message: String },
    #[error("iptables {action} in {table}/{chain}: {message}")]
    Command {
        action: &'static str,
        table: String,
        chain: String,
        message: String,
    },
}

/// The handful of firewall operations the network needs. Rules are given as
/// argument lists, e.g. `["-s", "10.80.0.2", "-j", "DROP"]`.
pub trait Iptables: Send + Sync {
    fn create_chain_or_flush_if_exists(&self, table: &str, chain: &str)
        -> Result<()>;
    fn append_rule(&self, table: &str, chain: &str, rulespec: &[&str])
        -> Result<()>;
    /// Appends the rule unless an identical one is already present.
    fn append_unique_rule(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> Result<()>;
    /// Inserts the rule at `position`, counting from 1.
    fn insert_rule(
        &self,
        table: &str,
        chain: &str,
        position: i32,
        rulespec: &[&str],
    ) -> Result<()>;
    fn delete_rule(&self, table: &str, chain: &str, rulespec: &[&str])
        -> Result<()>;
}

/// [Iptables] backed by the host's `iptables` binary.
pub struct HostIptables {
    ipt: ::iptables::IPTables,
}

impl HostIptables {
    pub fn new() -> Result<Self> {
        let ipt = ::iptables::new(false)
            .map_err(|e| IptablesError::Init { message: e.to_string() })?;
        Ok(Self { ipt })
    }
}

// The iptables crate reports errors as non-Send boxed errors; they are
// flattened into strings right where they are produced.
fn command_error(
    action: &'static str,
    table: &str,
    chain: &str,
) -> impl FnOnce(Box<dyn std::error::Error>) -> IptablesError {
    let table = table.to_string();
    let chain = chain.to_string();
    move |e| IptablesError::Command {
        action,
        table,
        chain,
        message: e.to_string(),
    }
}

impl Iptables for HostIptables {
    fn create_chain_or_flush_if_exists(
        &self,
        table: &str,
        chain: &str,
    ) -> Result<()> {
        let exists = self
            .ipt
            .chain_exists(table, chain)
            .map_err(command_error("list", table, chain))?;

        if exists {
            self.ipt
                .flush_chain(table, chain)
                .map_err(command_error("flush", table, chain))
        } else {
            self.ipt
                .new_chain(table, chain)
                .map_err(command_error("create", table, chain))
        }
    }

    fn append_rule(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> Result<()> {
        self.ipt
            .append(table, chain, &rulespec.join(" "))
            .map_err(command_error("append", table, chain))
    }

    fn append_unique_rule(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> Result<()> {
        self.ipt
            .append_unique(table, chain, &rulespec.join(" "))
            .map_err(command_error("append", table, chain))
    }

    fn insert_rule(
        &self,
        table: &str,
        chain: &str,
        position: i32,
        rulespec: &[&str],
    ) -> Result<()> {
        self.ipt
            .insert(table, chain, &rulespec.join(" "), position)
            .map_err(command_error("insert", table, chain))
    }

    fn delete_rule(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> Result<()> {
        self.ipt
            .delete(table, chain, &rulespec.join(" "))
            .map_err(command_error("delete", table, chain))
    }
}
