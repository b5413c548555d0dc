//! Plugin-owned native threads.

use log::{debug, error};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::registry::{ObjectKind, Registry, Resource};
use crate::error::{Result, VmiopError};
use crate::types::Handle;


pub struct PluginThread {
    name: String,
    join: Mutex<Option<JoinHandle<()>>>,
}


impl Resource for PluginThread {
    const KIND: ObjectKind = ObjectKind::Thread;
}


impl PluginThread {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.lock().as_ref().map_or(true, JoinHandle::is_finished)
    }
}


/// Starts `body` on a new thread owned by `owner`. The thread receives its
/// own handle.
pub fn spawn<F>(registry: &Registry, owner: Handle, name: &str, body: F) -> Result<Handle>
where
    F: FnOnce(Handle) + Send + 'static,
{
    let thread = Arc::new(PluginThread { name: name.to_string(), join: Mutex::new(None) });
    let handle = registry.insert(owner, Arc::clone(&thread))?;
    let spawned = std::thread::Builder::new()
        .name(format!("vmiop-{}", name))
        .spawn(move || body(handle));
    match spawned {
        Ok(join) => {
            *thread.join.lock() = Some(join);
            debug!("started thread {} ({})", handle, name);
            Ok(handle)
        }
        Err(err) => {
            error!("failed to start thread {}: {}", name, err);
            let _ = registry.release(handle);
            Err(VmiopError::Resource)
        }
    }
}


/// Waits for the thread behind `handle` to finish and releases the handle.
///
/// A thread that ended by panicking (for example through a fatal log
/// message) is still joined; the failure is only logged.
pub fn join(registry: &Registry, handle: Handle) -> Result<()> {
    let thread = registry.lookup::<PluginThread>(handle)?;
    if thread.join.lock().as_ref().is_some_and(|j| j.thread().id() == std::thread::current().id()) {
        return Err(VmiopError::Inval);
    }
    let join = thread.join.lock().take();
    registry.release(handle)?;
    if let Some(join) = join {
        if join.join().is_err() {
            error!("thread {} ({}) terminated abnormally", handle, thread.name);
        }
    }
    Ok(())
}
