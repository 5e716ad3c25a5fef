/*
 *  lib.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

//! vmdev extends a hosted virtual machine with peripheral devices loaded
//! at runtime as independent native modules, bridged into the host's
//! scripting environment.
//!
//! The embedding process supplies the emulator interface
//! ([`vmdev_api::VmApi`]) and drives three things:
//!
//! - [`PluginHost`] — load/unload device modules, query the registry
//! - [`PluginHost::invoke`] — forward scripting calls into registered
//!   bindings (constructors, registry introspection)
//! - [`PluginHost::tick`] — the per-tick hook devices use for cooperative
//!   background work (e.g. the web framebuffer's event loop)
//!
//! Device modules are separate cdylib crates; see `devices/` for the
//! serial port and streaming framebuffer references.

pub mod config;
pub mod error;
pub mod host;
pub mod namespace;
pub mod plugin;

pub use config::{ConfigError, HostConfig};
pub use error::{NamespaceError, PluginError};
pub use host::PluginHost;
pub use namespace::Value;
pub use plugin::{DeviceInfo, ModuleLoader};

// The ABI crate is re-exported so embedders build their `VmApi` and
// static device declarations against the exact types the host uses.
pub use vmdev_api as api;
