/*
 *  namespace/bridge.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  Bridge between registry lifecycle transitions and namespace exposure
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

//! A module's functions are visible if and only if the module is loaded.
//! The bridge enforces that: it positions the namespace cursor on the
//! dedicated device table before every `register`/`close` call and
//! restores it afterwards no matter what the module did, tags every
//! exposure with the module's id, and sweeps removal markers over the
//! module's entries before its native code is released.

use std::ffi::{c_char, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use log::{info, warn};
use serde_json::json;
use vmdev_api::{
    cstr_to_string, DeviceLifecycleFn, HostApi, NamespaceApi, ScriptFn, TickFn, VMDEV_ABI_MAJOR,
    VMDEV_ABI_MINOR,
};

use crate::error::NamespaceError;
use crate::host::HostShared;
use crate::namespace::{Callable, DataPtr, ModuleId, TickHook, Value};

/// The fixed table every device module registers its constructors into.
pub const DEVICE_TABLE: [&str; 2] = ["vm", "devices"];

/// Assemble the interface handed to module entry points. The returned
/// value embeds `shared` as the context pointer; it stays valid for the
/// lifetime of the host.
pub(crate) fn host_api(shared: &HostShared) -> HostApi {
    HostApi {
        abi_major: VMDEV_ABI_MAJOR,
        abi_minor: VMDEV_ABI_MINOR,
        ns: NAMESPACE_API,
        vm: shared.vm,
        ctx: shared as *const HostShared as *mut c_void,
    }
}

/// Invoke one lifecycle entry point under bridge discipline: device-table
/// cursor, current-module tagging, panic containment, cursor restored on
/// every path.
pub(crate) fn call_entry(
    shared: &HostShared,
    module: ModuleId,
    entry: DeviceLifecycleFn,
    stage: &'static str,
) -> Result<(), ()> {
    let api = host_api(shared);

    let saved_cursor = {
        let mut ns = shared.ns.lock().unwrap();
        let saved = ns.cursor();
        ns.set_cursor(&DEVICE_TABLE);
        saved
    };
    *shared.current_module.lock().unwrap() = Some(module);

    let outcome = catch_unwind(AssertUnwindSafe(|| entry(&api)));

    *shared.current_module.lock().unwrap() = None;
    shared.ns.lock().unwrap().restore_cursor(saved_cursor);

    match outcome {
        Ok(()) => Ok(()),
        Err(_) => {
            warn!("device module entry point `{}` panicked", stage);
            Err(())
        }
    }
}

// ---------------------------------------------------------------------------
// NamespaceApi implementation
// ---------------------------------------------------------------------------

const NAMESPACE_API: NamespaceApi = NamespaceApi {
    set_callable: ns_set_callable,
    remove: ns_remove,
    create_type: ns_create_type,
    type_set_method: ns_type_set_method,
    add_tick_hook: ns_add_tick_hook,
    remove_tick_hook: ns_remove_tick_hook,
};

/// SAFETY of all thunks below: `ctx` is the `HostShared` the host placed
/// in the `HostApi` it handed out; modules may only call these while the
/// host is alive (they must not use a stored `HostRef` after `close`).
fn shared_from(ctx: *mut c_void) -> Option<&'static HostShared> {
    if ctx.is_null() {
        return None;
    }
    Some(unsafe { &*(ctx as *const HostShared) })
}

fn current_module(shared: &HostShared) -> Option<ModuleId> {
    *shared.current_module.lock().unwrap()
}

extern "C" fn ns_set_callable(
    ctx: *mut c_void,
    name: *const c_char,
    func: ScriptFn,
    data: *mut c_void,
) -> bool {
    let Some(shared) = shared_from(ctx) else { return false };
    let Some(name) = (unsafe { cstr_to_string(name) }) else { return false };
    let module = current_module(shared);
    shared
        .ns
        .lock()
        .unwrap()
        .set_at_cursor(&name, Callable::Native { func, data: DataPtr(data), module });
    true
}

extern "C" fn ns_remove(ctx: *mut c_void, name: *const c_char) -> bool {
    let Some(shared) = shared_from(ctx) else { return false };
    let Some(name) = (unsafe { cstr_to_string(name) }) else { return false };
    shared.ns.lock().unwrap().remove_at_cursor(&name)
}

extern "C" fn ns_create_type(ctx: *mut c_void, name: *const c_char) -> u32 {
    let Some(shared) = shared_from(ctx) else { return 0 };
    let Some(name) = (unsafe { cstr_to_string(name) }) else { return 0 };
    let module = current_module(shared);
    shared.ns.lock().unwrap().create_type(&name, module)
}

extern "C" fn ns_type_set_method(
    ctx: *mut c_void,
    type_id: u32,
    name: *const c_char,
    func: ScriptFn,
    data: *mut c_void,
) -> bool {
    let Some(shared) = shared_from(ctx) else { return false };
    let Some(name) = (unsafe { cstr_to_string(name) }) else { return false };
    let module = current_module(shared);
    shared.ns.lock().unwrap().type_set_method(
        type_id,
        &name,
        Callable::Native { func, data: DataPtr(data), module },
    )
}

extern "C" fn ns_add_tick_hook(
    ctx: *mut c_void,
    name: *const c_char,
    func: TickFn,
    data: *mut c_void,
) -> bool {
    let Some(shared) = shared_from(ctx) else { return false };
    let Some(name) = (unsafe { cstr_to_string(name) }) else { return false };
    let module = current_module(shared);
    shared.ns.lock().unwrap().add_hook(TickHook { name, func, data: DataPtr(data), module });
    true
}

extern "C" fn ns_remove_tick_hook(ctx: *mut c_void, name: *const c_char) -> bool {
    let Some(shared) = shared_from(ctx) else { return false };
    let Some(name) = (unsafe { cstr_to_string(name) }) else { return false };
    shared.ns.lock().unwrap().remove_hook(&name)
}

// ---------------------------------------------------------------------------
// Host introspection bindings
// ---------------------------------------------------------------------------

/// Expose the registry to scripts under `vm.devices`: list, lookup, load
/// by file name, unload by device name. Every binding returns a value or
/// `false` — failures never unwind into the scripting environment.
pub(crate) fn install_host_bindings(shared: &Arc<HostShared>) {
    let mut ns = shared.ns.lock().unwrap();
    let table_path: Vec<String> = DEVICE_TABLE.iter().map(|s| s.to_string()).collect();

    let weak = Arc::downgrade(shared);
    let get_devices = host_fn(weak.clone(), |shared, _args| {
        let list: Vec<_> = shared
            .list()
            .into_iter()
            .map(|d| json!({ "name": d.name, "version": d.version }))
            .collect();
        Ok(Value::text(json!(list).to_string()))
    });

    let get_device = host_fn(weak.clone(), |shared, args| {
        let name = text_arg(args, 0)?;
        Ok(match shared.find(&name) {
            Some(d) => Value::text(json!({ "name": d.name, "version": d.version }).to_string()),
            None => Value::Nil,
        })
    });

    let load_device = host_fn(weak.clone(), |shared, args| {
        let file = text_arg(args, 0)?;
        let path = shared.config.device_dir.join(&file);
        match shared.load_and_register(&path) {
            Ok(name) => Ok(Value::text(name)),
            Err(err) => {
                warn!("load_device(\"{}\") failed: {}", file, err);
                Ok(Value::Bool(false))
            }
        }
    });

    let unload_device = host_fn(weak, |shared, args| {
        let name = text_arg(args, 0)?;
        Ok(Value::Bool(shared.unload(&name)))
    });

    let table = ns.ensure_table(&table_path);
    table.insert_host("get_devices", get_devices);
    table.insert_host("get_device", get_device);
    table.insert_host("load_device", load_device);
    table.insert_host("unload_device", unload_device);

    info!("registry bindings installed under {}", DEVICE_TABLE.join("."));
}

fn host_fn(
    weak: Weak<HostShared>,
    f: impl Fn(&Arc<HostShared>, &[Value]) -> Result<Value, NamespaceError> + Send + Sync + 'static,
) -> Callable {
    Callable::Host(Arc::new(move |args| match weak.upgrade() {
        Some(shared) => f(&shared, args),
        None => Ok(Value::Bool(false)),
    }))
}

fn text_arg(args: &[Value], index: usize) -> Result<String, NamespaceError> {
    args.get(index)
        .and_then(|v| v.as_text())
        .map(|s| s.into_owned())
        .ok_or_else(|| NamespaceError::BadArgument(format!("argument {} must be a string", index)))
}
