/*
 *  testing.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  In-memory VM double for unit tests (feature "testing")
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

//! A recording stand-in for the emulator core. [`mock_vm_api`] yields a
//! [`VmApi`] whose machines live in a process-global registry; tests
//! create machines with [`create_machine`] under test-unique ids and
//! inspect what devices attached, which IRQs fired, and what landed in
//! the device tree.
//!
//! Guest-side MMIO traffic is simulated with [`MockMachine::mmio_read`] /
//! [`MockMachine::mmio_write`], which dispatch through the attached
//! region's callbacks exactly like the bus would.

use std::collections::HashMap;
use std::ffi::{c_char, c_void};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::{cstr_to_string, FdtProp, FdtPropKind, MachineHandle, MmioRegion, VmApi};

/// One simulated machine. All fields are inspection points for tests.
pub struct MockMachine {
    pub id: i64,
    /// Attached regions, boxed so callback back-references stay stable.
    pub attached: Mutex<Vec<Box<MmioRegion>>>,
    next_irq: AtomicU32,
    pub raised: Mutex<Vec<u32>>,
    /// Flattened `path/name prop=value` lines, one per FDT mutation.
    pub fdt: Mutex<Vec<String>>,
}

// MmioRegion carries raw pointers owned by the device under test; the
// mock only stores and forwards them.
unsafe impl Send for MockMachine {}
unsafe impl Sync for MockMachine {}

impl MockMachine {
    fn new(id: i64) -> Self {
        Self {
            id,
            attached: Mutex::new(Vec::new()),
            next_irq: AtomicU32::new(1),
            raised: Mutex::new(Vec::new()),
            fdt: Mutex::new(Vec::new()),
        }
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().unwrap().len()
    }

    pub fn raised_irqs(&self) -> Vec<u32> {
        self.raised.lock().unwrap().clone()
    }

    pub fn fdt_lines(&self) -> Vec<String> {
        self.fdt.lock().unwrap().clone()
    }

    /// Base address and direct mapping of the attached region covering
    /// `addr`, if any.
    pub fn mapping_at(&self, addr: u64) -> Option<*mut u8> {
        let attached = self.attached.lock().unwrap();
        attached
            .iter()
            .find(|r| addr >= r.addr && addr < r.addr + r.size)
            .map(|r| r.mapping as *mut u8)
    }

    /// Dispatch a guest read of `size` bytes at absolute address `addr`.
    pub fn mmio_read(&self, addr: u64, size: u8) -> Option<u64> {
        let mut attached = self.attached.lock().unwrap();
        let region = attached
            .iter_mut()
            .find(|r| addr >= r.addr && addr < r.addr + r.size)?;
        let offset = addr - region.addr;
        let mut buf = [0u8; 8];
        let read = region.read?;
        let dev: *mut MmioRegion = &mut **region;
        if !read(dev, buf.as_mut_ptr() as *mut c_void, offset, size) {
            return None;
        }
        Some(u64::from_le_bytes(buf))
    }

    /// Dispatch a guest write of `size` bytes at absolute address `addr`.
    pub fn mmio_write(&self, addr: u64, value: u64, size: u8) -> bool {
        let mut attached = self.attached.lock().unwrap();
        let Some(region) = attached
            .iter_mut()
            .find(|r| addr >= r.addr && addr < r.addr + r.size)
        else {
            return false;
        };
        let offset = addr - region.addr;
        let buf = value.to_le_bytes();
        let Some(write) = region.write else { return false };
        let dev: *mut MmioRegion = &mut **region;
        write(dev, buf.as_ptr() as *const c_void, offset, size)
    }

    /// Detach every region, invoking each `remove` callback — the VM's
    /// teardown path.
    pub fn detach_all(&self) {
        let mut attached = self.attached.lock().unwrap();
        for mut region in attached.drain(..) {
            if let Some(remove) = region.remove {
                let dev: *mut MmioRegion = &mut *region;
                remove(dev);
            }
        }
    }
}

fn machines() -> &'static Mutex<HashMap<i64, Arc<MockMachine>>> {
    static MACHINES: OnceLock<Mutex<HashMap<i64, Arc<MockMachine>>>> = OnceLock::new();
    MACHINES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Create (or replace) the machine behind `id`. Tests pick unique ids so
/// parallel tests stay isolated.
pub fn create_machine(id: i64) -> Arc<MockMachine> {
    let machine = Arc::new(MockMachine::new(id));
    machines().lock().unwrap().insert(id, Arc::clone(&machine));
    machine
}

pub fn destroy_machine(id: i64) {
    machines().lock().unwrap().remove(&id);
}

/// The `VmApi` the mock implements.
pub fn mock_vm_api() -> VmApi {
    VmApi {
        get_machine: mock_get_machine,
        attach_mmio: mock_attach_mmio,
        detach_mmio: mock_detach_mmio,
        alloc_irq: mock_alloc_irq,
        raise_irq: mock_raise_irq,
        fdt_add_node: mock_fdt_add_node,
        fdt_add_prop: mock_fdt_add_prop,
    }
}

fn machine_ref(handle: *mut MachineHandle) -> Option<&'static MockMachine> {
    if handle.is_null() {
        return None;
    }
    // Handles are Arc pointers kept alive by the global registry.
    Some(unsafe { &*(handle as *const MockMachine) })
}

extern "C" fn mock_get_machine(id: i64) -> *mut MachineHandle {
    match machines().lock().unwrap().get(&id) {
        Some(machine) => Arc::as_ptr(machine) as *mut MachineHandle,
        None => std::ptr::null_mut(),
    }
}

extern "C" fn mock_attach_mmio(
    handle: *mut MachineHandle,
    region: *const MmioRegion,
) -> *mut MmioRegion {
    let Some(machine) = machine_ref(handle) else { return std::ptr::null_mut() };
    if region.is_null() {
        return std::ptr::null_mut();
    }
    let region = unsafe { *region };

    let mut attached = machine.attached.lock().unwrap();
    let overlaps = attached.iter().any(|existing| {
        region.addr < existing.addr + existing.size && existing.addr < region.addr + region.size
    });
    if overlaps {
        return std::ptr::null_mut();
    }

    attached.push(Box::new(region));
    let slot = attached.last_mut().unwrap();
    &mut **slot as *mut MmioRegion
}

extern "C" fn mock_detach_mmio(handle: *mut MachineHandle, attached_region: *mut MmioRegion) {
    let Some(machine) = machine_ref(handle) else { return };
    let mut attached = machine.attached.lock().unwrap();
    if let Some(index) = attached
        .iter_mut()
        .position(|r| std::ptr::eq(&mut **r as *mut MmioRegion, attached_region))
    {
        let mut region = attached.remove(index);
        if let Some(remove) = region.remove {
            let dev: *mut MmioRegion = &mut *region;
            remove(dev);
        }
    }
}

extern "C" fn mock_alloc_irq(handle: *mut MachineHandle) -> u32 {
    match machine_ref(handle) {
        Some(machine) => machine.next_irq.fetch_add(1, Ordering::SeqCst),
        None => 0,
    }
}

extern "C" fn mock_raise_irq(handle: *mut MachineHandle, irq: u32) {
    if let Some(machine) = machine_ref(handle) {
        machine.raised.lock().unwrap().push(irq);
    }
}

fn format_prop(prop: &FdtProp) -> String {
    let name = unsafe { cstr_to_string(prop.name) }.unwrap_or_default();
    match prop.kind {
        FdtPropKind::Str => {
            let value = unsafe { cstr_to_string(prop.str_value) }.unwrap_or_default();
            format!("{}=\"{}\"", name, value)
        }
        FdtPropKind::U32 => format!("{}={}", name, prop.value),
        FdtPropKind::Reg => format!("{}=<{:#x} {:#x}>", name, prop.value, prop.value2),
    }
}

extern "C" fn mock_fdt_add_node(
    handle: *mut MachineHandle,
    parent: *const c_char,
    name: *const c_char,
    props: *const FdtProp,
    nprops: usize,
) -> bool {
    let Some(machine) = machine_ref(handle) else { return false };
    let parent = unsafe { cstr_to_string(parent) }.unwrap_or_default();
    let name = unsafe { cstr_to_string(name) }.unwrap_or_default();
    let props = if props.is_null() || nprops == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(props, nprops) }
    };
    let mut fdt = machine.fdt.lock().unwrap();
    for prop in props {
        fdt.push(format!("{}/{} {}", parent, name, format_prop(prop)));
    }
    if props.is_empty() {
        fdt.push(format!("{}/{}", parent, name));
    }
    true
}

extern "C" fn mock_fdt_add_prop(
    handle: *mut MachineHandle,
    node: *const c_char,
    prop: *const FdtProp,
) -> bool {
    let Some(machine) = machine_ref(handle) else { return false };
    if prop.is_null() {
        return false;
    }
    let node = unsafe { cstr_to_string(node) }.unwrap_or_default();
    let prop = unsafe { &*prop };
    machine.fdt.lock().unwrap().push(format!("{} {}", node, format_prop(prop)));
    true
}
