/*
 *  vmdev serial port plugin - module entry points and MMIO model
 */

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex;

use log::{debug, error, warn};
use vmdev_api::{
    abi_pack, FdtProp, HostApi, HostRef, MachineHandle, MmioRegion, ScriptValue, VmApi,
    VMDEV_ABI_MAJOR, VMDEV_ABI_MINOR,
};

use crate::chardev::{QueuePair, RX_READY, TX_SPACE};

const DEVICE_NAME: &CStr = c"simple_uart";
const DEVICE_VERSION: c_int = 1;

const MMIO_SIZE: u64 = 0x1000;

// 16550 register subset, 1-byte accesses.
const REG_DATA: u64 = 0;
const REG_LCR: u64 = 3;
const REG_LSR: u64 = 5;
const LCR_8N1: u8 = 0x03;
const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;

static HOST: Mutex<Option<HostRef>> = Mutex::new(None);
static UART_TYPE: AtomicU32 = AtomicU32::new(0);

/// One attached serial port. Owned by the VM's MMIO subsystem once
/// attached; the `remove` callback is the only place it is freed.
struct SerialPort {
    queues: QueuePair,
    vm: VmApi,
    machine: *mut MachineHandle,
    irq: u32,
    /// Back-reference to the attached region, for introspection.
    mmio: AtomicPtr<MmioRegion>,
    last_flags: AtomicU32,
}

// SAFETY: the queue pair is internally locked, the atomics are atomics,
// and `vm`/`machine` go to VM entry points the emulator guarantees are
// callable from any thread.
unsafe impl Send for SerialPort {}
unsafe impl Sync for SerialPort {}

impl SerialPort {
    fn new(vm: VmApi, machine: *mut MachineHandle, irq: u32) -> Self {
        Self {
            queues: QueuePair::new(),
            vm,
            machine,
            irq,
            mmio: AtomicPtr::new(std::ptr::null_mut()),
            last_flags: AtomicU32::new(0),
        }
    }

    /// Raise the IRQ on every rising poll-flag transition. This is the
    /// single asynchronous signal the device emits.
    fn signal(&self) {
        let now = self.queues.poll();
        let prev = self.last_flags.swap(now, Ordering::AcqRel);
        if now & !prev != 0 {
            (self.vm.raise_irq)(self.machine, self.irq);
        }
    }

    fn push_rx(&self, bytes: &[u8]) -> usize {
        let accepted = self.queues.push_rx(bytes);
        self.signal();
        accepted
    }

    fn pop_tx(&self, max: usize) -> Vec<u8> {
        let bytes = self.queues.pop_tx(max);
        self.signal();
        bytes
    }

    fn reg_read(&self, offset: u64) -> u8 {
        match offset {
            REG_DATA => {
                let byte = self.queues.pop_rx(1).first().copied().unwrap_or(0);
                self.signal();
                byte
            }
            REG_LCR => LCR_8N1,
            REG_LSR => {
                let flags = self.queues.poll();
                let mut lsr = 0;
                if flags & RX_READY != 0 {
                    lsr |= LSR_DATA_READY;
                }
                if flags & TX_SPACE != 0 {
                    lsr |= LSR_THR_EMPTY;
                }
                lsr
            }
            _ => 0,
        }
    }

    fn reg_write(&self, offset: u64, value: u8) {
        if offset == REG_DATA {
            // Full transmit queue drops the byte, same as overrun.
            self.queues.push_tx(&[value]);
            self.signal();
        }
    }
}

/// Contain a panic inside a callback the VM invokes directly; unwinding
/// into the bus dispatcher would abort the process.
fn contain<R>(default: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!("panic contained in serial MMIO callback");
            default
        }
    }
}

unsafe fn port_from(dev: *mut MmioRegion) -> Option<&'static SerialPort> {
    if dev.is_null() {
        return None;
    }
    let data = (*dev).data;
    if data.is_null() {
        return None;
    }
    Some(&*(data as *const SerialPort))
}

extern "C" fn mmio_read(dev: *mut MmioRegion, dest: *mut c_void, offset: u64, _size: u8) -> bool {
    contain(false, || {
        let Some(port) = (unsafe { port_from(dev) }) else { return false };
        let value = port.reg_read(offset);
        unsafe { *(dest as *mut u8) = value };
        true
    })
}

extern "C" fn mmio_write(dev: *mut MmioRegion, src: *const c_void, offset: u64, _size: u8) -> bool {
    contain(false, || {
        let Some(port) = (unsafe { port_from(dev) }) else { return false };
        let value = unsafe { *(src as *const u8) };
        port.reg_write(offset, value);
        true
    })
}

extern "C" fn mmio_update(dev: *mut MmioRegion) {
    contain((), || {
        if let Some(port) = unsafe { port_from(dev) } {
            port.signal();
        }
    })
}

/// Sole deallocation path, invoked by the VM when the region goes away.
extern "C" fn mmio_remove(dev: *mut MmioRegion) {
    contain((), || unsafe {
        if dev.is_null() {
            return;
        }
        let data = (*dev).data;
        if !data.is_null() {
            (*dev).data = std::ptr::null_mut();
            let port = Box::from_raw(data as *mut SerialPort);
            debug_assert_eq!(port.mmio.load(Ordering::Acquire), dev);
            drop(port);
        }
    })
}

// ---------------------------------------------------------------------------
// Scripting surface
// ---------------------------------------------------------------------------

fn port_arg(args: &[ScriptValue]) -> Option<&'static SerialPort> {
    let type_id = UART_TYPE.load(Ordering::Acquire);
    let ptr = args.first()?.as_object(type_id)?;
    Some(unsafe { &*(ptr as *const SerialPort) })
}

/// `uart_create(machine_id, address [, console])`
extern "C-unwind" fn uart_create(
    args: *const ScriptValue,
    nargs: usize,
    ret: *mut ScriptValue,
    _data: *mut c_void,
) -> c_int {
    let args = unsafe { std::slice::from_raw_parts(args, nargs) };
    let Some(host) = *HOST.lock().unwrap() else { return 1 };
    let (Some(machine_id), Some(addr)) = (
        args.first().and_then(|v| v.as_int()),
        args.get(1).and_then(|v| v.as_int()).filter(|a| *a >= 0),
    ) else {
        return 1;
    };
    let console = args.get(2).and_then(|v| v.as_bool()).unwrap_or(false);

    let vm = *host.vm();
    let machine = (vm.get_machine)(machine_id);
    if machine.is_null() {
        unsafe { *ret = ScriptValue::from_bool(false) };
        return 0;
    }

    let irq = (vm.alloc_irq)(machine);
    let port = Box::new(SerialPort::new(vm, machine, irq));
    let data = Box::into_raw(port) as *mut c_void;

    let mut region = MmioRegion::zeroed();
    region.addr = addr as u64;
    region.size = MMIO_SIZE;
    region.data = data;
    region.read = Some(mmio_read);
    region.write = Some(mmio_write);
    region.update = Some(mmio_update);
    region.remove = Some(mmio_remove);
    region.min_op_size = 1;
    region.max_op_size = 1;
    region.type_name = DEVICE_NAME.as_ptr();

    let attached = (vm.attach_mmio)(machine, &region);
    if attached.is_null() {
        // The VM refused the region (e.g. overlap); release everything
        // this call allocated and report failure, not an error.
        warn!("serial attach at {:#x} refused", addr);
        drop(unsafe { Box::from_raw(data as *mut SerialPort) });
        unsafe { *ret = ScriptValue::from_bool(false) };
        return 0;
    }
    unsafe { &*(data as *const SerialPort) }.mmio.store(attached, Ordering::Release);

    publish_fdt(&vm, machine, addr as u64, irq, console);
    debug!("serial port attached at {:#x}, irq {}", addr, irq);

    unsafe { *ret = ScriptValue::from_object(data, UART_TYPE.load(Ordering::Acquire)) };
    0
}

fn publish_fdt(vm: &VmApi, machine: *mut MachineHandle, addr: u64, irq: u32, console: bool) {
    let props = [
        FdtProp::reg(c"reg", addr, MMIO_SIZE),
        FdtProp::str(c"compatible", c"ns16550a"),
        FdtProp::u32(c"clock-frequency", 0x0100_0000),
        FdtProp::u32(c"reg-shift", 0),
        FdtProp::u32(c"reg-io-width", 1),
        FdtProp::u32(c"interrupts", irq),
    ];
    (vm.fdt_add_node)(machine, c"/soc".as_ptr(), c"uart".as_ptr(), props.as_ptr(), props.len());

    if console {
        if let Ok(path) = CString::new(format!("/soc/uart@{:x}", addr)) {
            let prop = FdtProp::str(c"stdout-path", &path);
            (vm.fdt_add_prop)(machine, c"/chosen".as_ptr(), &prop);
        }
    }
}

/// `uart:write(bytes)` — feed the receive queue; returns accepted count.
extern "C-unwind" fn uart_write(
    args: *const ScriptValue,
    nargs: usize,
    ret: *mut ScriptValue,
    _data: *mut c_void,
) -> c_int {
    let args = unsafe { std::slice::from_raw_parts(args, nargs) };
    let Some(port) = port_arg(args) else { return 1 };
    let Some(bytes) = args.get(1).and_then(|v| unsafe { v.as_bytes() }) else { return 1 };
    let accepted = port.push_rx(bytes);
    unsafe { *ret = ScriptValue::from_int(accepted as i64) };
    0
}

/// `uart:read([max])` — drain up to `max` transmitted bytes.
extern "C-unwind" fn uart_read(
    args: *const ScriptValue,
    nargs: usize,
    ret: *mut ScriptValue,
    _data: *mut c_void,
) -> c_int {
    thread_local! {
        // Returned strings point in here; the host copies before the
        // next call into this module.
        static READ_BUF: std::cell::RefCell<Vec<u8>> = const { std::cell::RefCell::new(Vec::new()) };
    }

    let args = unsafe { std::slice::from_raw_parts(args, nargs) };
    let Some(port) = port_arg(args) else { return 1 };
    let max = match args.get(1).and_then(|v| v.as_int()) {
        Some(n) if n > 0 && n <= 4096 => n as usize,
        _ => 4096,
    };

    let bytes = port.pop_tx(max);
    READ_BUF.with(|buf| {
        let mut buf = buf.borrow_mut();
        buf.clear();
        buf.extend_from_slice(&bytes);
        unsafe { *ret = ScriptValue::from_str_raw(buf.as_ptr() as *const c_char, buf.len()) };
    });
    0
}

/// `uart:poll()` — current {RX-ready, TX-space} bitmask.
extern "C-unwind" fn uart_poll(
    args: *const ScriptValue,
    nargs: usize,
    ret: *mut ScriptValue,
    _data: *mut c_void,
) -> c_int {
    let args = unsafe { std::slice::from_raw_parts(args, nargs) };
    let Some(port) = port_arg(args) else { return 1 };
    unsafe { *ret = ScriptValue::from_int(i64::from(port.queues.poll())) };
    0
}

// ---------------------------------------------------------------------------
// Module entry points
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn device_get_name() -> *const c_char {
    DEVICE_NAME.as_ptr()
}

#[no_mangle]
pub extern "C" fn device_get_version() -> c_int {
    DEVICE_VERSION
}

#[no_mangle]
pub extern "C" fn device_abi_version() -> u32 {
    abi_pack(VMDEV_ABI_MAJOR, VMDEV_ABI_MINOR)
}

#[no_mangle]
pub extern "C-unwind" fn device_init(host: *const HostApi) {
    let Some(host) = (unsafe { HostRef::new(host) }) else { return };

    let type_id = host.create_type(DEVICE_NAME);
    if type_id == 0 {
        error!("serial: type registration failed");
        return;
    }
    host.type_set_method(type_id, c"write", uart_write, std::ptr::null_mut());
    host.type_set_method(type_id, c"read", uart_read, std::ptr::null_mut());
    host.type_set_method(type_id, c"poll", uart_poll, std::ptr::null_mut());

    UART_TYPE.store(type_id, Ordering::Release);
    *HOST.lock().unwrap() = Some(host);
}

#[no_mangle]
pub extern "C-unwind" fn device_register_functions(host: *const HostApi) {
    let Some(host) = (unsafe { HostRef::new(host) }) else { return };
    host.set_callable(c"uart_create", uart_create, std::ptr::null_mut());
}

#[no_mangle]
pub extern "C-unwind" fn device_close(host: *const HostApi) {
    let Some(host) = (unsafe { HostRef::new(host) }) else { return };
    host.remove(c"uart_create");
    *HOST.lock().unwrap() = None;
}
