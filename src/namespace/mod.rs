/*
 *  namespace/mod.rs
 *
 *  vmdev - runtime device plugins for hosted virtual machines
 *  (c) 2024-26 the vmdev authors
 *
 *  Host-side scripting namespace: tables, callables, removal markers
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

//! The namespace is the host's model of what the scripting environment can
//! see: a tree of tables whose leaves are callables, a registry of object
//! types (method tables behind constructor-returned handles), and the
//! per-tick hook list.
//!
//! Every entry a device module creates is tagged with the module's id so
//! the bridge can sweep it on close. Sweeping never deletes an entry — it
//! replaces it with an explicit removal marker, and invoking a marker
//! yields [`NamespaceError::Removed`] instead of jumping into freed code.

pub mod bridge;

use std::borrow::Cow;
use std::collections::HashMap;
use std::ffi::{c_char, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};
use vmdev_api::{ScriptFn, ScriptValue, ScriptValueKind, TickFn};

use crate::error::NamespaceError;

/// Registry-assigned identity of one loaded module.
pub type ModuleId = u64;

/// Raw pointer that may travel between threads. The pointee is owned by a
/// device module, which guarantees thread-safe access for as long as the
/// entry referencing it exists.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DataPtr(pub *mut c_void);

unsafe impl Send for DataPtr {}

/// Host-side script value.
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    /// Byte string; scripting strings carry arbitrary bytes.
    Str(Vec<u8>),
    /// Opaque device-instance handle tagged with its namespace type.
    Object { ptr: *mut c_void, type_id: u32 },
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Str(s.into().into_bytes())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Str(b) => Some(String::from_utf8_lossy(b)),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

// `Value::Object` carries a device-owned pointer with the same thread-safety
// contract documented for `DataPtr` above: the pointee is owned by a device
// module that guarantees thread-safe access for the entry's lifetime.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

#[derive(Clone)]
pub(crate) enum Callable {
    /// A function pointer inside a device module.
    Native { func: ScriptFn, data: DataPtr, module: Option<ModuleId> },
    /// A host-side binding (registry introspection and friends).
    Host(Arc<dyn Fn(&[Value]) -> Result<Value, NamespaceError> + Send + Sync>),
}

pub(crate) enum Entry {
    Table(Table),
    Callable(Callable),
    /// Removal marker left behind by a closed module.
    Removed,
}

#[derive(Default)]
pub(crate) struct Table {
    entries: HashMap<String, Entry>,
}

impl Table {
    pub(crate) fn insert_host(&mut self, name: &str, callable: Callable) {
        self.entries.insert(name.to_string(), Entry::Callable(callable));
    }
}

/// Method table backing object handles of one device kind.
pub(crate) struct TypeDef {
    pub name: String,
    pub module: Option<ModuleId>,
    pub methods: HashMap<String, Entry>,
    pub removed: bool,
}

#[derive(Clone)]
pub(crate) struct TickHook {
    pub name: String,
    pub func: TickFn,
    pub data: DataPtr,
    pub module: Option<ModuleId>,
}

#[derive(Default)]
pub(crate) struct Namespace {
    root: Table,
    types: Vec<TypeDef>,
    hooks: Vec<TickHook>,
    /// Table path new callables land in; managed by the bridge.
    cursor: Vec<String>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cursor(&mut self, path: &[&str]) {
        self.cursor = path.iter().map(|s| s.to_string()).collect();
    }

    pub fn cursor(&self) -> Vec<String> {
        self.cursor.clone()
    }

    pub fn restore_cursor(&mut self, saved: Vec<String>) {
        self.cursor = saved;
    }

    /// Walk (and create) tables along `path`.
    pub fn ensure_table(&mut self, path: &[String]) -> &mut Table {
        let mut table = &mut self.root;
        for part in path {
            table = match table
                .entries
                .entry(part.clone())
                .or_insert_with(|| Entry::Table(Table::default()))
            {
                Entry::Table(t) => t,
                other => {
                    // A non-table in the way is replaced; this only happens
                    // on a path collision, which we surface loudly.
                    warn!("namespace path component `{}` shadowed a non-table entry", part);
                    *other = Entry::Table(Table::default());
                    match other {
                        Entry::Table(t) => t,
                        _ => unreachable!(),
                    }
                }
            };
        }
        table
    }

    pub fn set_at_cursor(&mut self, name: &str, callable: Callable) {
        let cursor = self.cursor.clone();
        let table = self.ensure_table(&cursor);
        table.entries.insert(name.to_string(), Entry::Callable(callable));
    }

    /// Replace an entry at the cursor with a removal marker.
    pub fn remove_at_cursor(&mut self, name: &str) -> bool {
        let cursor = self.cursor.clone();
        let table = self.ensure_table(&cursor);
        match table.entries.get_mut(name) {
            Some(entry) => {
                *entry = Entry::Removed;
                true
            }
            None => false,
        }
    }

    pub fn create_type(&mut self, name: &str, module: Option<ModuleId>) -> u32 {
        self.types.push(TypeDef {
            name: name.to_string(),
            module,
            methods: HashMap::new(),
            removed: false,
        });
        self.types.len() as u32
    }

    pub fn type_set_method(&mut self, type_id: u32, name: &str, callable: Callable) -> bool {
        match self.type_def_mut(type_id) {
            Some(def) if !def.removed => {
                def.methods.insert(name.to_string(), Entry::Callable(callable));
                true
            }
            _ => false,
        }
    }

    fn type_def_mut(&mut self, type_id: u32) -> Option<&mut TypeDef> {
        if type_id == 0 {
            return None;
        }
        self.types.get_mut(type_id as usize - 1)
    }

    fn type_def(&self, type_id: u32) -> Option<&TypeDef> {
        if type_id == 0 {
            return None;
        }
        self.types.get(type_id as usize - 1)
    }

    pub fn add_hook(&mut self, hook: TickHook) {
        self.hooks.retain(|h| h.name != hook.name);
        self.hooks.push(hook);
    }

    pub fn remove_hook(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.name != name);
        self.hooks.len() != before
    }

    pub fn hooks_snapshot(&self) -> Vec<TickHook> {
        self.hooks.clone()
    }

    /// Resolve a dotted path to a cloned callable. Removal markers are
    /// reported as such, never silently skipped.
    pub fn lookup(&self, path: &str) -> Result<Callable, NamespaceError> {
        let mut table = &self.root;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let entry = table
                .entries
                .get(part)
                .ok_or_else(|| NamespaceError::NotFound(path.to_string()))?;
            match entry {
                Entry::Table(t) if parts.peek().is_some() => table = t,
                Entry::Table(_) => return Err(NamespaceError::NotCallable(path.to_string())),
                Entry::Callable(c) if parts.peek().is_none() => return Ok(c.clone()),
                Entry::Callable(_) => return Err(NamespaceError::NotFound(path.to_string())),
                Entry::Removed => return Err(NamespaceError::Removed(path.to_string())),
            }
        }
        Err(NamespaceError::NotFound(path.to_string()))
    }

    pub fn lookup_method(&self, type_id: u32, name: &str) -> Result<Callable, NamespaceError> {
        let def = self
            .type_def(type_id)
            .ok_or_else(|| NamespaceError::UnknownType(name.to_string()))?;
        match def.methods.get(name) {
            Some(Entry::Callable(c)) if !def.removed => Ok(c.clone()),
            Some(Entry::Removed) => Err(NamespaceError::Removed(format!("{}.{}", def.name, name))),
            _ if def.removed => Err(NamespaceError::Removed(format!("{}.{}", def.name, name))),
            Some(Entry::Table(_)) => Err(NamespaceError::NotCallable(name.to_string())),
            // Statically required: a Callable reached here means the guard on
            // the first arm failed, i.e. `def.removed` is set (the `_ if
            // def.removed` arm above already yields this at runtime).
            Some(Entry::Callable(_)) => Err(NamespaceError::Removed(format!("{}.{}", def.name, name))),
            None => Err(NamespaceError::NotFound(format!("{}.{}", def.name, name))),
        }
    }

    /// Replace everything a module exposed with removal markers and drop
    /// its tick hooks. Runs strictly before the module's library is
    /// released.
    pub fn tombstone_module(&mut self, module: ModuleId) {
        fn sweep(table: &mut Table, module: ModuleId) {
            for entry in table.entries.values_mut() {
                match entry {
                    Entry::Table(t) => sweep(t, module),
                    Entry::Callable(Callable::Native { module: Some(m), .. }) if *m == module => {
                        *entry = Entry::Removed;
                    }
                    _ => {}
                }
            }
        }
        sweep(&mut self.root, module);

        for def in &mut self.types {
            if def.module == Some(module) {
                def.removed = true;
                for method in def.methods.values_mut() {
                    *method = Entry::Removed;
                }
            }
        }

        let before = self.hooks.len();
        self.hooks.retain(|h| h.module != Some(module));
        if self.hooks.len() != before {
            debug!("dropped {} tick hook(s) of module {}", before - self.hooks.len(), module);
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Marshal host values into a C call frame and invoke a callable. The
/// namespace lock must not be held here: callables may re-enter the host.
pub(crate) fn call_callable(
    name: &str,
    callable: &Callable,
    args: &[Value],
) -> Result<Value, NamespaceError> {
    match callable {
        Callable::Host(f) => f(args),
        Callable::Native { func, data, .. } => call_native(name, *func, data.0, args),
    }
}

fn call_native(
    name: &str,
    func: ScriptFn,
    data: *mut c_void,
    args: &[Value],
) -> Result<Value, NamespaceError> {
    // String payloads are copied into stable heap buffers first; the frame
    // then points into them for the duration of the call.
    let mut storage: Vec<Vec<u8>> = Vec::new();
    for arg in args {
        if let Value::Str(bytes) = arg {
            let mut owned = bytes.clone();
            owned.push(0);
            storage.push(owned);
        }
    }

    let mut next_str = 0;
    let frame: Vec<ScriptValue> = args
        .iter()
        .map(|arg| match arg {
            Value::Nil => ScriptValue::nil(),
            Value::Bool(b) => ScriptValue::from_bool(*b),
            Value::Int(i) => ScriptValue::from_int(*i),
            Value::Str(bytes) => {
                let buf = &storage[next_str];
                next_str += 1;
                ScriptValue::from_str_raw(buf.as_ptr() as *const c_char, bytes.len())
            }
            Value::Object { ptr, type_id } => ScriptValue::from_object(*ptr, *type_id),
        })
        .collect();

    let mut ret = ScriptValue::nil();
    let status = catch_unwind(AssertUnwindSafe(|| {
        func(frame.as_ptr(), frame.len(), &mut ret, data)
    }))
    .map_err(|_| {
        warn!("callable `{}` panicked; contained at the boundary", name);
        NamespaceError::CallPanic(name.to_string())
    })?;

    if status != 0 {
        return Err(NamespaceError::CallFailed { name: name.to_string(), status });
    }

    // Copy any returned string out immediately; the callee only guarantees
    // the pointer until the next call into its module.
    Ok(from_script(&ret))
}

pub(crate) fn from_script(v: &ScriptValue) -> Value {
    match v.kind {
        ScriptValueKind::Nil => Value::Nil,
        ScriptValueKind::Bool => Value::Bool(v.b),
        ScriptValueKind::Int => Value::Int(v.i),
        ScriptValueKind::Str => {
            let bytes = unsafe { v.as_bytes() }.unwrap_or_default();
            Value::Str(bytes.to_vec())
        }
        ScriptValueKind::Object => Value::Object { ptr: v.obj, type_id: v.type_id },
    }
}
