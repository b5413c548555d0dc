//! The plugin contract and the per-instance context handed to plugins.

use log::{debug, warn};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::{BufferPool, BufferRef};
use crate::bus::MessageBus;
use crate::error::{Result, VmiopError};
use crate::logging;
use crate::message::{self, MessageKind, SequenceCounter};
use crate::migration::{DeviceState, MigrationController, Stateless};
use crate::types::{Access, AttributeValue, ClassSet, Direction, Handle, LogLevel, PluginClass};
use crate::vmm::callbacks::EnvCallbacks;
use crate::vmm::memory::GuestRegion;
use crate::vmm::registry::{ObjectKind, Registry, Resource};
use crate::vmm::sync::{CondVar, Event, Lock};
use crate::vmm::thread;


/// Descriptor generation a plugin was built against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AbiGeneration {
    /// No migration entry points.
    Base,
    /// Adds stage notification and device-state streaming.
    Extended,
}


/// Static facts about a plugin, taken from its module descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub class: PluginClass,
    pub input_classes: ClassSet,
    /// A plugin may be connected below this one.
    pub connect_down_allowed: bool,
    /// A plugin may be connected above this one.
    pub connect_up_allowed: bool,
    pub generation: AbiGeneration,
    /// Capability bits, see [`crate::types::VGPU_CAP_MIGRATION`].
    pub migration_capabilities: u64,
}


/// Entry points every plugin implements.
///
/// All methods may be called from any thread. `put_message` runs on the
/// delivering thread and receives its own reference to the buffer; work
/// that blocks belongs on a plugin-owned thread.
pub trait Plugin: Send + Sync {
    fn init(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    fn get_attribute(&self, _ctx: &PluginContext, _name: &str) -> Result<AttributeValue> {
        Err(VmiopError::NotFound)
    }

    fn set_attribute(&self, _ctx: &PluginContext, _name: &str, _value: &AttributeValue) -> Result<()> {
        Err(VmiopError::NotFound)
    }

    fn put_message(&self, ctx: &PluginContext, buffer: BufferRef) -> Result<()>;

    fn reset(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// State streamed during migration. Only consulted for plugins of the
    /// extended generation.
    fn device_state(&self) -> Option<&dyn DeviceState> {
        None
    }
}


impl<P: Plugin + ?Sized> Plugin for Arc<P> {
    fn init(&self, ctx: &PluginContext) -> Result<()> {
        (**self).init(ctx)
    }

    fn shutdown(&self, ctx: &PluginContext) -> Result<()> {
        (**self).shutdown(ctx)
    }

    fn get_attribute(&self, ctx: &PluginContext, name: &str) -> Result<AttributeValue> {
        (**self).get_attribute(ctx, name)
    }

    fn set_attribute(&self, ctx: &PluginContext, name: &str, value: &AttributeValue) -> Result<()> {
        (**self).set_attribute(ctx, name, value)
    }

    fn put_message(&self, ctx: &PluginContext, buffer: BufferRef) -> Result<()> {
        (**self).put_message(ctx, buffer)
    }

    fn reset(&self, ctx: &PluginContext) -> Result<()> {
        (**self).reset(ctx)
    }

    fn device_state(&self) -> Option<&dyn DeviceState> {
        (**self).device_state()
    }
}


/// Environment services available to one plugin instance.
#[derive(Clone)]
pub struct PluginContext {
    handle: Handle,
    name: Arc<str>,
    class: PluginClass,
    registry: Arc<Registry>,
    pool: Arc<BufferPool>,
    bus: MessageBus,
    callbacks: Arc<dyn EnvCallbacks>,
    options: Arc<BTreeMap<String, String>>,
    sequence: Arc<SequenceCounter>,
    page_size: u64,
}


pub(crate) struct ContextParts {
    pub registry: Arc<Registry>,
    pub pool: Arc<BufferPool>,
    pub bus: MessageBus,
    pub callbacks: Arc<dyn EnvCallbacks>,
    pub options: BTreeMap<String, String>,
    pub page_size: u64,
}


impl PluginContext {
    pub(crate) fn new(handle: Handle, info: &PluginInfo, parts: ContextParts) -> Self {
        Self {
            handle,
            name: Arc::from(info.name.as_str()),
            class: info.class,
            registry: parts.registry,
            pool: parts.pool,
            bus: parts.bus,
            callbacks: parts.callbacks,
            options: Arc::new(parts.options),
            sequence: Arc::new(SequenceCounter::new()),
            page_size: parts.page_size,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> PluginClass {
        self.class
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn callbacks(&self) -> &dyn EnvCallbacks {
        &*self.callbacks
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Plugin option from the configuration.
    pub fn config_get(&self, key: &str) -> Result<&str> {
        self.options.get(key).map(String::as_str).ok_or(VmiopError::NotFound)
    }

    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        logging::log(level, &self.name, args);
    }

    pub fn next_sequence(&self) -> u32 {
        self.sequence.next()
    }

    /// Hands `buffer` to the next acceptor in `direction`. The caller keeps
    /// its own reference either way.
    pub fn deliver(&self, buffer: &BufferRef, direction: Direction) -> Result<()> {
        self.bus.deliver(self.handle, buffer, direction)
    }

    pub fn allocate_buffer(&self, destination: PluginClass, element_count: u32, data_size: u32) -> Result<BufferRef> {
        self.pool.allocate(self.class, destination, element_count, data_size)
    }

    /// Allocates a one-element buffer holding a complete message from this
    /// plugin, stamped with its next sequence number.
    pub fn compose_message(
        &self,
        destination: PluginClass,
        kind: MessageKind,
        display_number: u32,
        content: &[u8],
    ) -> Result<BufferRef> {
        let size = u32::try_from(message::encoded_len(kind, content.len())).map_err(|_| VmiopError::Range)?;
        let mut buffer = self.allocate_buffer(destination, 1, size)?;
        message::write(buffer.data_mut(0)?, kind, self.next_sequence(), display_number, content)?;
        Ok(buffer)
    }

    pub fn create_lock(&self) -> Result<Handle> {
        self.registry.insert(self.handle, Arc::new(Lock::new()))
    }

    pub fn create_event(&self) -> Result<Handle> {
        self.registry.insert(self.handle, Arc::new(Event::new()))
    }

    pub fn create_condvar(&self) -> Result<Handle> {
        self.registry.insert(self.handle, Arc::new(CondVar::new()))
    }

    /// Resolves a handle this plugin may use.
    pub fn lookup<T: Resource>(&self, handle: Handle) -> Result<Arc<T>> {
        self.registry.lookup(handle)
    }

    /// Releases a handle this plugin created. Handles owned by anyone else,
    /// plugin instances included, are out of reach.
    pub fn release(&self, handle: Handle) -> Result<()> {
        if handle == self.handle {
            return Err(VmiopError::Inval);
        }
        self.registry.release_owned(self.handle, handle)
    }

    pub fn spawn_thread<F>(&self, name: &str, body: F) -> Result<Handle>
    where
        F: FnOnce(Handle) + Send + 'static,
    {
        thread::spawn(&self.registry, self.handle, name, body)
    }

    pub fn join_thread(&self, handle: Handle) -> Result<()> {
        if self.registry.owner_of(handle) != Some(self.handle) {
            return Err(VmiopError::NotFound);
        }
        thread::join(&self.registry, handle)
    }

    pub fn map_guest_region(&self, base: u64, length: u64, access: Access) -> Result<Handle> {
        let region = GuestRegion::map(base, length, access)?;
        self.registry.insert(self.handle, Arc::new(region))
    }
}


/// A loaded plugin, registered under exactly one handle.
pub struct PluginInstance {
    info: PluginInfo,
    plugin: Box<dyn Plugin>,
    ctx: PluginContext,
    migration: Option<MigrationController>,
    initialized: AtomicBool,
    // Dropped after `plugin`: keeps the code of a loaded module mapped.
    _module: Option<Arc<dyn Any + Send + Sync>>,
}


impl Resource for PluginInstance {
    const KIND: ObjectKind = ObjectKind::Plugin;
}


impl PluginInstance {
    pub(crate) fn new(
        info: PluginInfo,
        plugin: Box<dyn Plugin>,
        ctx: PluginContext,
        write_queue_limit: usize,
        module: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        let migration = (info.generation == AbiGeneration::Extended)
            .then(|| MigrationController::new(&info.name, write_queue_limit));
        Self { info, plugin, ctx, migration, initialized: AtomicBool::new(false), _module: module }
    }

    pub fn handle(&self) -> Handle {
        self.ctx.handle
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Present only for extended-generation plugins.
    pub fn migration(&self) -> Option<&MigrationController> {
        self.migration.as_ref()
    }

    pub(crate) fn device_state(&self) -> &dyn DeviceState {
        self.plugin.device_state().unwrap_or(&Stateless)
    }

    pub(crate) fn init(&self) -> Result<()> {
        self.plugin.init(&self.ctx)?;
        self.initialized.store(true, Ordering::Release);
        if let Some(migration) = &self.migration {
            migration.mark_initialized(self.device_state())?;
        }
        debug!("plugin {} ({}) initialized", self.info.name, self.handle());
        Ok(())
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.plugin.shutdown(&self.ctx)
    }

    pub(crate) fn put_message(&self, buffer: BufferRef) -> Result<()> {
        if !self.is_initialized() {
            warn!("plugin {} received a message before init", self.info.name);
        }
        self.plugin.put_message(&self.ctx, buffer)
    }

    pub(crate) fn get_attribute(&self, name: &str) -> Result<AttributeValue> {
        self.plugin.get_attribute(&self.ctx, name)
    }

    pub(crate) fn set_attribute(&self, name: &str, value: &AttributeValue) -> Result<()> {
        self.plugin.set_attribute(&self.ctx, name, value)
    }

    pub(crate) fn reset(&self) -> Result<()> {
        self.plugin.reset(&self.ctx)
    }
}
