//! Directional delivery of buffers between neighbouring plugins.

use log::trace;
use std::cell::Cell;
use std::sync::Arc;

use crate::buffer::BufferRef;
use crate::error::{Result, VmiopError};
use crate::graph::PluginGraph;
use crate::plugin::PluginInstance;
use crate::types::{Direction, Handle};
use crate::vmm::registry::Registry;


thread_local! {
    static CALLBACK_DEPTH: Cell<u32> = const { Cell::new(0) };
}


/// Whether the current thread is inside a `put_message` callback.
pub fn in_callback() -> bool {
    CALLBACK_DEPTH.with(|d| d.get() > 0)
}


struct CallbackScope;


impl CallbackScope {
    fn enter() -> Self {
        CALLBACK_DEPTH.with(|d| d.set(d.get() + 1));
        CallbackScope
    }
}


impl Drop for CallbackScope {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}


#[derive(Clone)]
pub struct MessageBus {
    registry: Arc<Registry>,
    graph: Arc<PluginGraph>,
}


impl MessageBus {
    pub fn new(registry: Arc<Registry>, graph: Arc<PluginGraph>) -> Self {
        Self { registry, graph }
    }

    /// Delivers `buffer` from `caller` to the nearest plugin in `direction`
    /// that accepts the buffer's source class.
    ///
    /// The acceptor's `put_message` runs synchronously on this thread with
    /// a reference of its own. `buffer` stays with the caller whatever the
    /// outcome and must still be released by it. No lock is held while the
    /// acceptor runs.
    pub fn deliver(&self, caller: Handle, buffer: &BufferRef, direction: Direction) -> Result<()> {
        if caller.is_null() {
            return Err(VmiopError::Inval);
        }
        let target = self.graph.next_acceptor(caller, direction, buffer.source_class())?;
        let instance = self.registry.lookup::<PluginInstance>(target)?;
        trace!("deliver {:?} from {} {:?} to {}", buffer.source_class(), caller, direction, target);

        buffer.mark_in_transit();
        let reference = buffer.retain();
        let _scope = CallbackScope::enter();
        instance.put_message(reference)
    }
}
