/*
 *  plugin/loader.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  Module loader - discovers and loads device .so/.dylib/.dll files
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

use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use log::{debug, info, warn};
use vmdev_api::{
    abi_major, DeviceAbiVersionFn, DeviceEntryPoints, DeviceGetNameFn, DeviceGetVersionFn,
    DeviceLifecycleFn, SYM_ABI_VERSION, SYM_CLOSE, SYM_GET_NAME, SYM_GET_VERSION, SYM_INIT,
    SYM_REGISTER, VMDEV_ABI_MAJOR,
};

use crate::error::PluginError;

/// A device module with its library open and all entry points resolved.
///
/// The function pointers are only valid while `library` is alive; the two
/// travel together into the registry record.
pub(crate) struct LoadedModule {
    pub library: Library,
    pub entry: DeviceEntryPoints,
}

/// Module discovery and loading.
pub struct ModuleLoader;

impl ModuleLoader {
    /// Search paths for device modules, in priority order.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. Environment variable override
        if let Ok(path) = std::env::var("VMDEV_DEVICE_PATH") {
            paths.push(PathBuf::from(path));
        }

        // 2. Development directory (relative to cwd)
        paths.push(PathBuf::from("./target/release/devices"));

        // 3. User-local directories
        if let Some(home) = dirs_next::home_dir() {
            paths.push(home.join(".local/lib/vmdev/devices"));
            paths.push(home.join(".vmdev/devices"));
        }

        // 4. System directories
        paths.push(PathBuf::from("/usr/local/lib/vmdev/devices"));
        paths.push(PathBuf::from("/usr/lib/vmdev/devices"));

        paths
    }

    /// Possible module filenames for a device stem, e.g. for "uart":
    /// - Linux: `libvmdev_device_uart.so`, `libvmdev-device-uart.so`
    /// - macOS: `libvmdev_device_uart.dylib`
    /// - Windows: `vmdev_device_uart.dll`
    pub fn module_filenames(stem: &str) -> Vec<String> {
        let mut names = Vec::new();

        #[cfg(target_os = "linux")]
        {
            names.push(format!("libvmdev_device_{}.so", stem));
            names.push(format!("libvmdev-device-{}.so", stem));
        }

        #[cfg(target_os = "macos")]
        {
            names.push(format!("libvmdev_device_{}.dylib", stem));
            names.push(format!("libvmdev-device-{}.dylib", stem));
        }

        #[cfg(target_os = "windows")]
        {
            names.push(format!("vmdev_device_{}.dll", stem));
            names.push(format!("vmdev-device-{}.dll", stem));
        }

        names
    }

    /// Locate a module for the given device stem across the search paths.
    pub fn find_module(stem: &str) -> Option<PathBuf> {
        let search_paths = Self::search_paths();
        let filenames = Self::module_filenames(stem);

        for path in &search_paths {
            if !path.exists() {
                continue;
            }
            for filename in &filenames {
                let module_path = path.join(filename);
                if module_path.exists() {
                    debug!("found device module at {}", module_path.display());
                    return Some(module_path);
                }
            }
        }

        debug!("no device module found for stem `{}`", stem);
        None
    }

    /// Platform extension of loadable modules, used by directory scans.
    pub fn module_extension() -> &'static str {
        if cfg!(target_os = "windows") {
            "dll"
        } else if cfg!(target_os = "macos") {
            "dylib"
        } else {
            "so"
        }
    }
}

impl LoadedModule {
    /// Open the module at `path` and resolve its entry points.
    ///
    /// Fails with `ModuleLoad` when the file cannot be opened (missing,
    /// architecture mismatch), `Symbol` when any of the five required
    /// entry points is absent, and `AbiMismatch` when the module exports
    /// an ABI version with a different major. On every failure path the
    /// library is dropped, which releases the module.
    pub fn open(path: &Path) -> Result<Self, PluginError> {
        info!("loading device module from {}", path.display());

        let library = unsafe { Library::new(path) }.map_err(|e| PluginError::ModuleLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // Optional ABI gate; modules that predate the symbol are accepted.
        if let Ok(abi_fn) = unsafe { library.get::<Symbol<DeviceAbiVersionFn>>(SYM_ABI_VERSION) } {
            let packed = abi_fn();
            debug!(
                "module ABI {}.{}, host ABI {}.x",
                abi_major(packed),
                packed & 0xFFFF,
                VMDEV_ABI_MAJOR
            );
            if abi_major(packed) != VMDEV_ABI_MAJOR {
                return Err(PluginError::AbiMismatch {
                    path: path.to_path_buf(),
                    found: abi_major(packed),
                    host: VMDEV_ABI_MAJOR,
                });
            }
        } else {
            warn!(
                "device module {} exports no ABI version; assuming {}.x",
                path.display(),
                VMDEV_ABI_MAJOR
            );
        }

        let get_name = resolve::<DeviceGetNameFn>(&library, path, SYM_GET_NAME, "device_get_name")?;
        let get_version =
            resolve::<DeviceGetVersionFn>(&library, path, SYM_GET_VERSION, "device_get_version")?;
        let init = resolve::<DeviceLifecycleFn>(&library, path, SYM_INIT, "device_init")?;
        let register =
            resolve::<DeviceLifecycleFn>(&library, path, SYM_REGISTER, "device_register_functions")?;
        let close = resolve::<DeviceLifecycleFn>(&library, path, SYM_CLOSE, "device_close")?;

        Ok(Self {
            library,
            entry: DeviceEntryPoints { get_name, get_version, init, register, close },
        })
    }
}

fn resolve<T: Copy>(
    library: &Library,
    path: &Path,
    symbol: &[u8],
    name: &'static str,
) -> Result<T, PluginError> {
    let sym: Symbol<T> = unsafe { library.get(symbol) }.map_err(|_| PluginError::Symbol {
        path: path.to_path_buf(),
        symbol: name,
    })?;
    Ok(*sym)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_paths_include_development_dir() {
        let paths = ModuleLoader::search_paths();
        assert!(!paths.is_empty());
        assert!(paths
            .iter()
            .any(|p| p.to_string_lossy().contains("target/release/devices")));
    }

    #[test]
    fn module_filenames_follow_platform_convention() {
        let names = ModuleLoader::module_filenames("uart");
        assert!(!names.is_empty());

        #[cfg(target_os = "linux")]
        {
            assert!(names.contains(&"libvmdev_device_uart.so".to_string()));
            assert!(names.contains(&"libvmdev-device-uart.so".to_string()));
        }

        #[cfg(target_os = "windows")]
        {
            assert!(names.contains(&"vmdev_device_uart.dll".to_string()));
        }
    }

    #[test]
    fn missing_file_is_a_module_load_error() {
        let err = LoadedModule::open(Path::new("/nonexistent/libvmdev_device_nope.so"))
            .err()
            .expect("open must fail");
        assert!(matches!(err, PluginError::ModuleLoad { .. }));
    }
}
