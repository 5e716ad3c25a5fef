/*
 *  tests/host_lifecycle.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  End-to-end lifecycle through the public host API
 */

use std::ffi::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use vmdev::api::testing::{create_machine, destroy_machine, mock_vm_api};
use vmdev::api::{DeviceEntryPoints, HostApi, HostRef, ScriptValue};
use vmdev::{HostConfig, NamespaceError, PluginError, PluginHost, Value};

static CLOSES: AtomicUsize = AtomicUsize::new(0);

// A minimal device the test registers statically: its constructor
// attaches a 16-byte region on the requested machine and returns true.

extern "C" fn rtc_name() -> *const c_char {
    c"test_rtc".as_ptr()
}

extern "C" fn rtc_version() -> c_int {
    2
}

extern "C-unwind" fn rtc_init(_host: *const HostApi) {}

extern "C-unwind" fn rtc_create(
    args: *const ScriptValue,
    nargs: usize,
    ret: *mut ScriptValue,
    _data: *mut c_void,
) -> c_int {
    let args = unsafe { std::slice::from_raw_parts(args, nargs) };
    let (Some(machine_id), Some(addr)) = (
        args.first().and_then(|v| v.as_int()),
        args.get(1).and_then(|v| v.as_int()),
    ) else {
        return 1;
    };

    let vm = mock_vm_api();
    let machine = (vm.get_machine)(machine_id);
    if machine.is_null() {
        unsafe { *ret = ScriptValue::from_bool(false) };
        return 0;
    }

    let mut region = vmdev::api::MmioRegion::zeroed();
    region.addr = addr as u64;
    region.size = 16;
    region.min_op_size = 1;
    region.max_op_size = 8;
    let attached = (vm.attach_mmio)(machine, &region);
    unsafe { *ret = ScriptValue::from_bool(!attached.is_null()) };
    0
}

extern "C-unwind" fn rtc_register(host: *const HostApi) {
    let host = unsafe { HostRef::new(host) }.expect("host pointer");
    host.set_callable(c"rtc_create", rtc_create, std::ptr::null_mut());
}

extern "C-unwind" fn rtc_close(host: *const HostApi) {
    let host = unsafe { HostRef::new(host) }.expect("host pointer");
    host.remove(c"rtc_create");
    CLOSES.fetch_add(1, Ordering::SeqCst);
}

fn rtc_entry() -> DeviceEntryPoints {
    DeviceEntryPoints {
        get_name: rtc_name,
        get_version: rtc_version,
        init: rtc_init,
        register: rtc_register,
        close: rtc_close,
    }
}

#[test]
fn full_lifecycle_register_construct_unload() {
    let machine = create_machine(7001);
    let host = PluginHost::new(mock_vm_api(), HostConfig::default());

    let name = host.register_static(rtc_entry()).expect("static registration");
    assert_eq!(name, "test_rtc");
    host.register_into_namespace(&name).expect("namespace registration");

    // Scripting side constructs a device instance on machine 7001.
    let created = host
        .invoke(
            "vm.devices.rtc_create",
            &[Value::Int(7001), Value::Int(0x2000_0000)],
        )
        .expect("constructor call");
    assert_eq!(created.as_bool(), Some(true));
    assert_eq!(machine.attached_count(), 1);

    // Unload: close runs, the binding degrades to a removal marker, the
    // device instance stays with the VM.
    let closes = CLOSES.load(Ordering::SeqCst);
    assert!(host.unload(&name));
    assert!(CLOSES.load(Ordering::SeqCst) > closes);
    assert!(matches!(
        host.invoke("vm.devices.rtc_create", &[]),
        Err(NamespaceError::Removed(_))
    ));
    assert_eq!(machine.attached_count(), 1);

    machine.detach_all();
    destroy_machine(7001);
}

#[test]
fn loading_a_missing_module_file_fails_cleanly() {
    let host = PluginHost::new(mock_vm_api(), HostConfig::default());
    let err = host.load("/nonexistent/libvmdev_device_ghost.so").unwrap_err();
    assert!(matches!(err, PluginError::ModuleLoad { .. }));
    assert!(host.list().is_empty());
}

#[test]
fn load_dir_on_an_absent_directory_loads_nothing() {
    let config = HostConfig {
        device_dir: "/nonexistent/devices".into(),
        ..HostConfig::default()
    };
    let host = PluginHost::new(mock_vm_api(), config);
    assert_eq!(host.load_dir(), 0);
}

#[test]
fn registry_snapshot_reflects_load_order_and_lookup() {
    let host = PluginHost::new(mock_vm_api(), HostConfig::default());
    host.register_static(rtc_entry()).expect("static registration");

    let list = host.list();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "test_rtc");
    assert_eq!(list[0].version, 2);

    assert!(host.find("test_rtc").is_some());
    assert!(host.find("missing").is_none());
}
