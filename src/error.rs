/*
 *  error.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  Error types for the plugin lifecycle and namespace bridge
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

use std::path::PathBuf;
use thiserror::Error;

/// Failures of the plugin loader and device registry.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The module file could not be opened (missing, unreadable, wrong
    /// architecture).
    #[error("failed to load device module {path}: {reason}")]
    ModuleLoad { path: PathBuf, reason: String },

    /// One of the five required entry points is absent.
    #[error("device module {path} is missing required symbol `{symbol}`")]
    Symbol { path: PathBuf, symbol: &'static str },

    /// The module was built against an incompatible ABI major version.
    #[error("device module {path} targets ABI {found}.x, host speaks {host}.x")]
    AbiMismatch { path: PathBuf, found: u32, host: u32 },

    /// The module reported a null or empty name.
    #[error("device module {path} reported an invalid name")]
    BadName { path: PathBuf },

    /// Names are the registry's identity; a second module with the same
    /// name is rejected and released.
    #[error("a device named `{0}` is already loaded")]
    DuplicateName(String),

    /// `register` was requested twice without an intervening `close`.
    #[error("device `{0}` is already registered into the namespace")]
    AlreadyRegistered(String),

    /// An entry point panicked; the module was released.
    #[error("device module `{name}` panicked during {stage}")]
    EntryPointPanic { name: String, stage: &'static str },

    #[error("no device named `{0}` is loaded")]
    UnknownDevice(String),
}

/// Failures of namespace lookup and invocation.
#[derive(Debug, Error)]
pub enum NamespaceError {
    /// The binding belonged to a module that has been closed. This is the
    /// safe removed-state failure; the native code behind the binding is
    /// gone and must never run.
    #[error("binding `{0}` belongs to an unloaded device module")]
    Removed(String),

    #[error("no binding named `{0}`")]
    NotFound(String),

    #[error("`{0}` is not callable")]
    NotCallable(String),

    #[error("unknown object type for method `{0}`")]
    UnknownType(String),

    /// The callable ran and reported failure.
    #[error("call to `{name}` failed with status {status}")]
    CallFailed { name: String, status: i32 },

    /// The callable panicked; the panic was contained at the boundary.
    #[error("call to `{0}` panicked")]
    CallPanic(String),

    #[error("invalid argument: {0}")]
    BadArgument(String),
}
