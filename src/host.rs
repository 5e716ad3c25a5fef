/*
 *  host.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  PluginHost - lifecycle manager tying loader, registry and bridge together
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

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};

use libloading::Library;
use log::{debug, error, info, warn};
use vmdev_api::{cstr_to_string, DeviceEntryPoints, VmApi};

use crate::config::HostConfig;
use crate::error::{NamespaceError, PluginError};
use crate::namespace::bridge::{self, call_entry};
use crate::namespace::{call_callable, ModuleId, Namespace, Value};
use crate::plugin::loader::{LoadedModule, ModuleLoader};
use crate::plugin::registry::{DeviceInfo, DeviceRecord, DeviceRegistry};

/// Shared state behind the `ctx` pointer modules receive. One instance
/// per host, owned by [`PluginHost`], referenced weakly by the namespace
/// bindings.
pub(crate) struct HostShared {
    pub(crate) ns: Mutex<Namespace>,
    pub(crate) registry: Mutex<DeviceRegistry>,
    /// Module whose lifecycle entry point is currently executing; its
    /// namespace exposures are tagged with this id.
    pub(crate) current_module: Mutex<Option<ModuleId>>,
    pub(crate) vm: VmApi,
    pub(crate) config: HostConfig,
}

/// The device plugin runtime: loads and unloads native device modules,
/// maintains the capability registry, and keeps the scripting namespace
/// in sync with what is loaded.
///
/// Created once by the embedding process with the emulator's [`VmApi`].
/// Dropping the host force-closes every loaded module in insertion order.
pub struct PluginHost {
    shared: Arc<HostShared>,
}

impl PluginHost {
    pub fn new(vm: VmApi, config: HostConfig) -> Self {
        let shared = Arc::new(HostShared {
            ns: Mutex::new(Namespace::new()),
            registry: Mutex::new(DeviceRegistry::default()),
            current_module: Mutex::new(None),
            vm,
            config,
        });
        bridge::install_host_bindings(&shared);
        Self { shared }
    }

    /// Load the device module at `path` and invoke its `init`. The module
    /// is not yet visible to scripts; see [`register_into_namespace`].
    ///
    /// [`register_into_namespace`]: Self::register_into_namespace
    pub fn load(&self, path: impl AsRef<Path>) -> Result<String, PluginError> {
        self.shared.load_path(path.as_ref())
    }

    /// Load and immediately register — the common path for startup scans
    /// and the `load_device` scripting binding.
    pub fn load_and_register(&self, path: impl AsRef<Path>) -> Result<String, PluginError> {
        self.shared.load_and_register(path.as_ref())
    }

    /// Register a built-in device living in the host binary itself. Goes
    /// through the identical init/record path as a loaded module.
    pub fn register_static(&self, entry: DeviceEntryPoints) -> Result<String, PluginError> {
        self.shared.admit(entry, None, Path::new("<static>"))
    }

    /// Expose the module's constructors into the device table. Calling
    /// this twice without an intervening unload is a caller error.
    pub fn register_into_namespace(&self, name: &str) -> Result<(), PluginError> {
        self.shared.register_into_namespace(name)
    }

    /// Close and release a module. Returns false for unknown names.
    pub fn unload(&self, name: &str) -> bool {
        self.shared.unload(name)
    }

    /// Scan the configured device directory and load-and-register every
    /// module file found. Failures are logged and skipped. Returns the
    /// number of modules loaded.
    pub fn load_dir(&self) -> usize {
        let dir = self.shared.config.device_dir.clone();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("device directory {} not readable: {}", dir.display(), err);
                return 0;
            }
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ModuleLoader::module_extension()) {
                continue;
            }
            match self.shared.load_and_register(&path) {
                Ok(name) => {
                    info!("loaded device: {}", name);
                    loaded += 1;
                }
                Err(err) => warn!("skipping {}: {}", path.display(), err),
            }
        }
        loaded
    }

    /// Insertion-ordered snapshot of the registry. Safe to call
    /// concurrently with load/unload; the returned copy is iterated
    /// without holding the registry lock.
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.shared.list()
    }

    pub fn find(&self, name: &str) -> Option<DeviceInfo> {
        self.shared.find(name)
    }

    /// Invoke a namespace callable by dotted path on behalf of the
    /// scripting environment.
    pub fn invoke(&self, path: &str, args: &[Value]) -> Result<Value, NamespaceError> {
        let callable = self.shared.ns.lock().unwrap().lookup(path)?;
        call_callable(path, &callable, args)
    }

    /// Invoke a method on a constructor-returned object handle.
    pub fn invoke_method(
        &self,
        object: &Value,
        method: &str,
        args: &[Value],
    ) -> Result<Value, NamespaceError> {
        let Value::Object { type_id, .. } = object else {
            return Err(NamespaceError::BadArgument("method receiver must be an object".into()));
        };
        let callable = self.shared.ns.lock().unwrap().lookup_method(*type_id, method)?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(object.clone());
        full.extend_from_slice(args);
        call_callable(method, &callable, &full)
    }

    /// Drive every registered tick hook once. Called from the embedder's
    /// per-tick update; each hook must return promptly.
    pub fn tick(&self) {
        let hooks = self.shared.ns.lock().unwrap().hooks_snapshot();
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| (hook.func)(hook.data.0))).is_err() {
                error!("tick hook `{}` panicked", hook.name);
            }
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        // Force-close every module, oldest first. Deterministic, and each
        // module's namespace state is swept before its code is released.
        loop {
            let name = match self.shared.registry.lock().unwrap().first_name() {
                Some(name) => name,
                None => break,
            };
            debug!("host teardown: closing device `{}`", name);
            if !self.shared.unload(&name) {
                break;
            }
        }
    }
}

impl HostShared {
    fn load_path(&self, path: &Path) -> Result<String, PluginError> {
        let module = LoadedModule::open(path)?;
        self.admit(module.entry, Some(module.library), path)
    }

    pub(crate) fn load_and_register(&self, path: &Path) -> Result<String, PluginError> {
        let name = self.load_path(path)?;
        self.register_into_namespace(&name)?;
        Ok(name)
    }

    /// Validate identity, run `init`, and store the capability record.
    /// A failure anywhere leaves no trace: the library (if any) drops on
    /// the error path, which releases the module, and any namespace state
    /// a failing `init` created is swept.
    fn admit(
        &self,
        entry: DeviceEntryPoints,
        library: Option<Library>,
        origin: &Path,
    ) -> Result<String, PluginError> {
        let name = unsafe { cstr_to_string((entry.get_name)()) }
            .filter(|n| !n.is_empty())
            .ok_or_else(|| PluginError::BadName { path: origin.to_path_buf() })?;
        let version = (entry.get_version)();

        let module = {
            let mut registry = self.registry.lock().unwrap();
            if registry.contains(&name) {
                return Err(PluginError::DuplicateName(name));
            }
            registry.alloc_module_id()
        };

        if call_entry(self, module, entry.init, "init").is_err() {
            self.ns.lock().unwrap().tombstone_module(module);
            return Err(PluginError::EntryPointPanic { name, stage: "init" });
        }

        let mut registry = self.registry.lock().unwrap();
        if registry.contains(&name) {
            // Lost a race against a concurrent load of the same name.
            drop(registry);
            self.ns.lock().unwrap().tombstone_module(module);
            return Err(PluginError::DuplicateName(name));
        }
        registry.insert(DeviceRecord {
            name: name.clone(),
            version,
            entry,
            library,
            module,
            registered: false,
            closing: false,
        });
        info!("admitted device `{}` (version {})", name, version);
        Ok(name)
    }

    pub(crate) fn register_into_namespace(&self, name: &str) -> Result<(), PluginError> {
        let (entry, module) = {
            let mut registry = self.registry.lock().unwrap();
            let record = registry
                .get_mut(name)
                .ok_or_else(|| PluginError::UnknownDevice(name.to_string()))?;
            if record.registered {
                return Err(PluginError::AlreadyRegistered(name.to_string()));
            }
            // Reserve before calling so a racing register observes the flag.
            record.registered = true;
            (record.entry, record.module)
        };

        if call_entry(self, module, entry.register, "register").is_err() {
            self.ns.lock().unwrap().tombstone_module(module);
            if let Some(record) = self.registry.lock().unwrap().get_mut(name) {
                record.registered = false;
            }
            return Err(PluginError::EntryPointPanic { name: name.to_string(), stage: "register" });
        }
        Ok(())
    }

    pub(crate) fn unload(&self, name: &str) -> bool {
        let (entry, module) = {
            let mut registry = self.registry.lock().unwrap();
            let Some(record) = registry.get_mut(name) else { return false };
            if record.closing {
                return false;
            }
            record.closing = true;
            (record.entry, record.module)
        };

        // Reverse any namespace exposure the module performed...
        let _ = call_entry(self, module, entry.close, "close");
        // ...then sweep removal markers over everything it left behind.
        // This must complete before the library is released: a stale
        // binding into unloaded code must never be callable.
        self.ns.lock().unwrap().tombstone_module(module);

        let record = self.registry.lock().unwrap().take(name);
        // Library (if any) drops here, releasing the native module.
        drop(record);
        info!("unloaded device `{}`", name);
        true
    }

    pub(crate) fn list(&self) -> Vec<DeviceInfo> {
        self.registry.lock().unwrap().list()
    }

    pub(crate) fn find(&self, name: &str) -> Option<DeviceInfo> {
        let registry = self.registry.lock().unwrap();
        registry.get(name).map(|r| DeviceInfo { name: r.name.clone(), version: r.version })
    }
}
