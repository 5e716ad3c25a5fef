/*
 *  plugin/registry.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  Capability registry - one record per loaded device module
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

use libloading::Library;
use serde::Serialize;
use vmdev_api::DeviceEntryPoints;

use crate::namespace::ModuleId;

/// Public registry snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub version: i32,
}

/// Capability record: identity, version, the resolved entry points, and
/// the native handle keeping them loaded. `library` is `None` for
/// built-in devices registered from inside the host binary.
pub(crate) struct DeviceRecord {
    pub name: String,
    pub version: i32,
    pub entry: DeviceEntryPoints,
    pub library: Option<Library>,
    pub module: ModuleId,
    /// Set between `register` and `close`.
    pub registered: bool,
    /// Set while an unload is in flight, so a racing unload bails out.
    pub closing: bool,
}

/// Insertion-ordered record store. Mutation is serialized by the caller
/// (one mutex in `HostShared`); `list` hands out a point-in-time copy so
/// nobody iterates under the lock.
#[derive(Default)]
pub(crate) struct DeviceRegistry {
    records: Vec<DeviceRecord>,
    next_module: ModuleId,
}

impl DeviceRegistry {
    pub fn alloc_module_id(&mut self) -> ModuleId {
        self.next_module += 1;
        self.next_module
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }

    pub fn insert(&mut self, record: DeviceRecord) {
        self.records.push(record);
    }

    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DeviceRecord> {
        self.records.iter_mut().find(|r| r.name == name)
    }

    pub fn take(&mut self, name: &str) -> Option<DeviceRecord> {
        let index = self.records.iter().position(|r| r.name == name)?;
        Some(self.records.remove(index))
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        self.records
            .iter()
            .map(|r| DeviceInfo { name: r.name.clone(), version: r.version })
            .collect()
    }

    pub fn first_name(&self) -> Option<String> {
        self.records.first().map(|r| r.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{c_char, c_int};
    use vmdev_api::HostApi;

    extern "C" fn name() -> *const c_char {
        c"test_dev".as_ptr()
    }
    extern "C" fn version() -> c_int {
        1
    }
    extern "C-unwind" fn lifecycle(_host: *const HostApi) {}

    fn record(name_str: &str, module: ModuleId) -> DeviceRecord {
        DeviceRecord {
            name: name_str.to_string(),
            version: 1,
            entry: DeviceEntryPoints {
                get_name: name,
                get_version: version,
                init: lifecycle,
                register: lifecycle,
                close: lifecycle,
            },
            library: None,
            module,
            registered: false,
            closing: false,
        }
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut reg = DeviceRegistry::default();
        for n in ["uart", "web_fb", "rtc"] {
            let id = reg.alloc_module_id();
            reg.insert(record(n, id));
        }
        let names: Vec<_> = reg.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["uart", "web_fb", "rtc"]);
    }

    #[test]
    fn take_removes_exactly_one_record() {
        let mut reg = DeviceRegistry::default();
        let id = reg.alloc_module_id();
        reg.insert(record("uart", id));
        let id = reg.alloc_module_id();
        reg.insert(record("web_fb", id));

        assert!(reg.take("uart").is_some());
        assert!(reg.take("uart").is_none());
        assert!(reg.contains("web_fb"));
    }

    #[test]
    fn module_ids_are_unique() {
        let mut reg = DeviceRegistry::default();
        let a = reg.alloc_module_id();
        let b = reg.alloc_module_id();
        assert_ne!(a, b);
    }
}
