/*
 *  plugin/mod.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  Dynamic loading of device modules and the capability registry
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

//! Device modules are shared objects exporting five entry points (see
//! `vmdev_api`). The loader turns a file into a validated
//! [`LoadedModule`](loader::LoadedModule); the registry keeps one
//! capability record per loaded module, keyed by the module-reported name.

pub mod loader;
pub mod registry;

pub use loader::ModuleLoader;
pub use registry::DeviceInfo;
