//! Handle table for environment-owned objects.
//!
//! Every lock, event, condition variable, thread, guest region and plugin
//! instance is reached through a [`Handle`]. The table stores the object
//! behind an `Arc`; a successful lookup hands out a clone of that `Arc`, and
//! a handle value is never reissued while any such clone is alive, even
//! after the handle itself was released.

use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::error::{Result, VmiopError};
use crate::types::Handle;


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Lock,
    Event,
    CondVar,
    Thread,
    Region,
    Plugin,
}


/// An object that can live in the registry.
pub trait Resource: Any + Send + Sync {
    const KIND: ObjectKind;
}


type AnyObject = Arc<dyn Any + Send + Sync>;


struct Entry {
    kind: ObjectKind,
    owner: Handle,
    object: AnyObject,
}


#[derive(Default)]
struct Table {
    entries: HashMap<u32, Entry>,
    /// Released values whose objects may still be referenced by callers.
    retired: HashMap<u32, Weak<dyn Any + Send + Sync>>,
    next: u32,
}


impl Table {
    fn is_free(&self, value: u32) -> bool {
        if value == Handle::NULL.raw() || self.entries.contains_key(&value) {
            return false;
        }
        match self.retired.get(&value) {
            Some(weak) => weak.strong_count() == 0,
            None => true,
        }
    }

    fn next_free(&mut self) -> Option<u32> {
        // One full lap over the 32-bit space at most.
        for _ in 0..=u32::MAX {
            self.next = self.next.wrapping_add(1);
            if self.is_free(self.next) {
                self.retired.remove(&self.next);
                return Some(self.next);
            }
        }
        None
    }

    fn prune_retired(&mut self) {
        self.retired.retain(|_, weak| weak.strong_count() > 0);
    }
}


pub struct Registry {
    table: Mutex<Table>,
    max_handles: usize,
}


impl Registry {
    pub fn new(max_handles: u32) -> Self {
        Self { table: Mutex::new(Table::default()), max_handles: max_handles as usize }
    }

    /// Registers `object` and returns its new handle.
    ///
    /// `owner` is the plugin on whose behalf the object exists, or
    /// [`Handle::NULL`] for environment-owned objects.
    pub fn insert<T: Resource>(&self, owner: Handle, object: Arc<T>) -> Result<Handle> {
        self.insert_with(owner, |_| Ok(object))
    }

    /// Like [`Registry::insert`], for objects that need to know their own
    /// handle. `build` runs under the table lock and must not touch the
    /// registry.
    pub fn insert_with<T, F>(&self, owner: Handle, build: F) -> Result<Handle>
    where
        T: Resource,
        F: FnOnce(Handle) -> Result<Arc<T>>,
    {
        let mut table = self.table.lock();
        if table.entries.len() >= self.max_handles {
            table.prune_retired();
            warn!("handle table full ({} live handles)", table.entries.len());
            return Err(VmiopError::Resource);
        }
        if table.retired.len() > self.max_handles {
            table.prune_retired();
        }
        let value = table.next_free().ok_or(VmiopError::Resource)?;
        let handle = Handle::from_raw(value);
        let object: AnyObject = build(handle)?;
        table.entries.insert(value, Entry { kind: T::KIND, owner, object });
        trace!("allocated {:?} handle {} (owner {})", T::KIND, handle, owner);
        Ok(handle)
    }

    /// Resolves `handle` to an object of type `T`.
    ///
    /// Null or unknown handles fail with `NotFound`; a live handle of
    /// another kind fails with `Inval`.
    pub fn lookup<T: Resource>(&self, handle: Handle) -> Result<Arc<T>> {
        if handle.is_null() {
            return Err(VmiopError::NotFound);
        }
        let table = self.table.lock();
        let entry = table.entries.get(&handle.raw()).ok_or(VmiopError::NotFound)?;
        if entry.kind != T::KIND {
            return Err(VmiopError::Inval);
        }
        entry.object.clone().downcast::<T>().map_err(|_| VmiopError::Inval)
    }

    pub fn kind_of(&self, handle: Handle) -> Option<ObjectKind> {
        self.table.lock().entries.get(&handle.raw()).map(|e| e.kind)
    }

    pub fn owner_of(&self, handle: Handle) -> Option<Handle> {
        self.table.lock().entries.get(&handle.raw()).map(|e| e.owner)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        !handle.is_null() && self.table.lock().entries.contains_key(&handle.raw())
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes `handle` regardless of its kind.
    pub fn release(&self, handle: Handle) -> Result<()> {
        self.remove(handle, None, None).map(drop)
    }

    /// Removes `handle` on behalf of the plugin `owner`. Handles registered
    /// by anyone else fail with `NotFound`; plugin instances fail with
    /// `Inval`, they are only removed by the environment.
    pub fn release_owned(&self, owner: Handle, handle: Handle) -> Result<()> {
        self.remove(handle, None, Some(owner)).map(drop)
    }

    /// Removes `handle` after checking that it names a `T`, returning the
    /// object so the caller can tear it down.
    pub fn release_typed<T: Resource>(&self, handle: Handle) -> Result<Arc<T>> {
        let object = self.remove(handle, Some(T::KIND), None)?;
        object.downcast::<T>().map_err(|_| VmiopError::Inval)
    }

    fn remove(&self, handle: Handle, kind: Option<ObjectKind>, owner: Option<Handle>) -> Result<AnyObject> {
        if handle.is_null() {
            return Err(VmiopError::NotFound);
        }
        let mut table = self.table.lock();
        match table.entries.get(&handle.raw()) {
            None => return Err(VmiopError::NotFound),
            Some(entry) if kind.is_some_and(|k| k != entry.kind) => return Err(VmiopError::Inval),
            Some(entry) if owner.is_some() && entry.kind == ObjectKind::Plugin => return Err(VmiopError::Inval),
            Some(entry) if owner.is_some_and(|o| o != entry.owner) => return Err(VmiopError::NotFound),
            Some(_) => {}
        }
        let entry = table.entries.remove(&handle.raw()).ok_or(VmiopError::NotFound)?;
        table.retired.insert(handle.raw(), Arc::downgrade(&entry.object));
        trace!("released {:?} handle {}", entry.kind, handle);
        Ok(entry.object)
    }

    /// Handles registered on behalf of `owner`, in allocation order.
    pub fn owned_by(&self, owner: Handle) -> Vec<(Handle, ObjectKind)> {
        let table = self.table.lock();
        let mut owned: Vec<_> = table
            .entries
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(&value, e)| (Handle::from_raw(value), e.kind))
            .collect();
        owned.sort_by_key(|(h, _)| h.raw());
        owned
    }

    /// Releases everything `owner` registered. Objects are dropped after the
    /// table lock is released so their teardown may use the registry.
    pub fn release_owned_by(&self, owner: Handle) -> usize {
        let removed: Vec<AnyObject> = {
            let mut table = self.table.lock();
            let values: Vec<u32> = table
                .entries
                .iter()
                .filter(|(_, e)| e.owner == owner)
                .map(|(&value, _)| value)
                .collect();
            values
                .into_iter()
                .filter_map(|value| {
                    let entry = table.entries.remove(&value)?;
                    table.retired.insert(value, Arc::downgrade(&entry.object));
                    Some(entry.object)
                })
                .collect()
        };
        let count = removed.len();
        if count > 0 {
            debug!("released {} handle(s) owned by {}", count, owner);
        }
        drop(removed);
        count
    }
}


impl Default for Registry {
    fn default() -> Self {
        Self::new(crate::config::RegistryConfig::default().max_handles)
    }
}
