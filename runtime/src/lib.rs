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

//! Garden-style container backend for CI workers.
//!
//! Implements a handle-based container-management contract (see [`garden`])
//! on top of a lower-level OCI runtime reached through the narrow
//! [`client`] interface. The [`backend::GardenBackend`] owns the runtime
//! client, the CNI [`network`], the [`killer`] and the creation gate in
//! [`lock`], and hands out [`container::Container`] façades.

// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
#![warn(clippy::unwrap_used)]

pub mod backend;
pub mod cio;
pub mod client;
pub mod container;
pub mod error;
pub mod filestore;
pub mod garden;
pub mod hooks;
pub mod io_manager;
pub mod killer;
pub mod lazy_container;
pub mod lock;
pub mod logging;
pub mod network;
pub mod process;
pub mod rootfs;
pub mod spec;
pub mod userns;

#[cfg(test)]
mod fakes;

pub use backend::{BackendConfig, Collaborators, GardenBackend};
pub use error::{Result, RuntimeError};
