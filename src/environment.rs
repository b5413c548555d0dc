//! The hosting environment: composes the plugin stack and drives resets and
//! migration on behalf of the hypervisor.

use anyhow::{anyhow, Context};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::buffer::{BufferPool, BufferRef};
use crate::bus::{self, MessageBus};
use crate::config::{EnvironmentConfig, PluginConfig};
use crate::error::{Result, VmiopError};
use crate::graph::{Node, Placement, PluginGraph};
use crate::logging;
use crate::migration::ReadProgress;
use crate::module::ModuleCatalog;
use crate::plugin::{AbiGeneration, ContextParts, PluginContext, PluginInfo, PluginInstance};
use crate::types::{
    AttributeType, AttributeValue, Direction, Handle, MigrationStage, ATTRIBUTE_VMM_MIGRATION_SUPPORTED,
    VGPU_CAP_MIGRATION,
};
use crate::vmm::callbacks::{EnvCallbacks, RecordingCallbacks};
use crate::vmm::registry::Registry;


pub struct Environment {
    config: EnvironmentConfig,
    registry: Arc<Registry>,
    pool: Arc<BufferPool>,
    graph: Arc<PluginGraph>,
    bus: MessageBus,
    callbacks: Arc<dyn EnvCallbacks>,
    catalog: ModuleCatalog,
    /// Plugins currently outside stage `none`.
    migrating: Mutex<Vec<(Handle, Weak<PluginInstance>)>>,
    shut_down: AtomicBool,
}


impl Environment {
    pub fn new(config: EnvironmentConfig, callbacks: Arc<dyn EnvCallbacks>, catalog: ModuleCatalog) -> Self {
        logging::set_debug_level(config.debug_level);
        let registry = Arc::new(Registry::new(config.registry.max_handles));
        let graph = Arc::new(PluginGraph::new());
        Self {
            pool: Arc::new(BufferPool::new(config.buffer_pool.clone())),
            bus: MessageBus::new(Arc::clone(&registry), Arc::clone(&graph)),
            registry,
            graph,
            callbacks,
            catalog,
            config,
            migrating: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Builds an environment with the built-in modules and recording
    /// callbacks, then loads the configured plugins bottom first.
    pub fn from_config(config: EnvironmentConfig) -> anyhow::Result<Self> {
        let callbacks = Arc::new(RecordingCallbacks::new(config.guest.clone()));
        let env = Self::new(config, callbacks, ModuleCatalog::builtin()?);
        for plugin in env.config.plugins.clone() {
            env.load_plugin(&plugin).with_context(|| format!("failed to load plugin module `{}`", plugin.module))?;
        }
        Ok(env)
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn graph(&self) -> &Arc<PluginGraph> {
        &self.graph
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn callbacks(&self) -> &Arc<dyn EnvCallbacks> {
        &self.callbacks
    }

    pub fn catalog_mut(&mut self) -> &mut ModuleCatalog {
        &mut self.catalog
    }

    /// Loads a plugin on top of the stack.
    pub fn load_plugin(&self, config: &PluginConfig) -> anyhow::Result<Handle> {
        self.load_plugin_at(config, Placement::Top)
    }

    /// Loads a plugin: registers it, attaches it at `placement`, applies the
    /// configured attributes and runs its init routine.
    pub fn load_plugin_at(&self, config: &PluginConfig, placement: Placement) -> anyhow::Result<Handle> {
        if bus::in_callback() {
            return Err(VmiopError::NotAllowedInCallback.into());
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(anyhow!("environment is shut down"));
        }
        let descriptor = self.catalog.resolve(&config.module)?;
        let plugin = descriptor.instantiate()?;
        let info = descriptor.info.clone();

        let parts = ContextParts {
            registry: Arc::clone(&self.registry),
            pool: Arc::clone(&self.pool),
            bus: self.bus.clone(),
            callbacks: Arc::clone(&self.callbacks),
            options: config.options.clone(),
            page_size: self.config.guest.page_size,
        };
        let write_queue_limit = usize::try_from(self.config.migration.write_queue_bytes).unwrap_or(usize::MAX);
        let handle = self.registry.insert_with(Handle::NULL, |handle| {
            let ctx = PluginContext::new(handle, &info, parts);
            Ok(Arc::new(PluginInstance::new(info.clone(), plugin, ctx, write_queue_limit, descriptor.module())))
        })?;

        if let Err(err) = self.graph.attach(Node::new(handle, &info), placement) {
            let _ = self.registry.release(handle);
            return Err(anyhow::Error::new(err).context(format!("cannot attach plugin `{}`", info.name)));
        }
        if let Err(err) = self.configure(handle, config) {
            self.discard(handle);
            return Err(err);
        }
        let instance = self.registry.lookup::<PluginInstance>(handle)?;
        if let Err(err) = instance.init() {
            error!("plugin {} failed to initialize: {}", info.name, err);
            self.discard(handle);
            return Err(anyhow::Error::new(err).context(format!("plugin `{}` failed to initialize", info.name)));
        }
        info!("loaded plugin {} as {} ({:?}, {:?})", info.name, handle, info.class, info.generation);
        Ok(handle)
    }

    fn configure(&self, handle: Handle, config: &PluginConfig) -> anyhow::Result<()> {
        let instance = self.registry.lookup::<PluginInstance>(handle)?;
        if instance.info().generation == AbiGeneration::Extended {
            let supported = AttributeValue::Unsigned(self.config.migration.supported as u64);
            match instance.set_attribute(ATTRIBUTE_VMM_MIGRATION_SUPPORTED, &supported) {
                Ok(()) | Err(VmiopError::NotFound) => {}
                Err(err) => warn!("{}: {} rejected: {}", instance.info().name, ATTRIBUTE_VMM_MIGRATION_SUPPORTED, err),
            }
        }
        for (name, value) in &config.attributes {
            instance
                .set_attribute(name, value)
                .map_err(anyhow::Error::new)
                .with_context(|| format!("plugin `{}` rejected attribute `{}`", instance.info().name, name))?;
        }
        Ok(())
    }

    /// Tears down a plugin whose load did not complete.
    fn discard(&self, handle: Handle) {
        let _ = self.graph.detach(handle);
        self.registry.release_owned_by(handle);
        let _ = self.registry.release(handle);
    }

    /// Detaches a plugin from the stack, shuts it down, releases every handle
    /// it registered and finally its own handle. Once detached the plugin is
    /// no longer a delivery target.
    pub fn unload_plugin(&self, handle: Handle) -> Result<()> {
        if bus::in_callback() {
            return Err(VmiopError::NotAllowedInCallback);
        }
        if handle.is_null() {
            return Err(VmiopError::Inval);
        }
        let instance = self.registry.lookup::<PluginInstance>(handle)?;
        self.graph.detach(handle)?;
        self.migrating.lock().retain(|(h, _)| *h != handle);
        if let Err(err) = instance.shutdown() {
            warn!("plugin {} shutdown failed: {}", instance.info().name, err);
        }
        let released = self.registry.release_owned_by(handle);
        self.registry.release(handle)?;
        info!("unloaded plugin {} ({} handle(s) released)", instance.info().name, released);
        Ok(())
    }

    /// Unloads every plugin, top of the stack first. Later calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        if bus::in_callback() {
            return Err(VmiopError::NotAllowedInCallback);
        }
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for handle in self.graph.snapshot().into_iter().rev() {
            if let Err(err) = self.unload_plugin(handle) {
                error!("failed to unload {}: {}", handle, err);
            }
        }
        debug!("environment shut down, {} handle(s) left", self.registry.len());
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn instance(&self, handle: Handle) -> Result<Arc<PluginInstance>> {
        if handle.is_null() {
            return Err(VmiopError::Inval);
        }
        self.registry.lookup::<PluginInstance>(handle)
    }

    /// Plugins from the bottom of the stack up.
    pub fn plugins(&self) -> Vec<Handle> {
        self.graph.snapshot()
    }

    pub fn find_plugin(&self, name: &str) -> Option<Handle> {
        self.plugins()
            .into_iter()
            .find(|h| self.registry.lookup::<PluginInstance>(*h).is_ok_and(|p| p.info().name == name))
    }

    pub fn plugin_info(&self, handle: Handle) -> Result<PluginInfo> {
        Ok(self.instance(handle)?.info().clone())
    }

    /// Delivers `buffer` on behalf of `caller`.
    pub fn deliver(&self, caller: Handle, buffer: &BufferRef, direction: Direction) -> Result<()> {
        self.bus.deliver(caller, buffer, direction)
    }

    /// Reads an attribute and converts it to `kind`.
    pub fn get_attribute(&self, handle: Handle, name: &str, kind: AttributeType) -> Result<AttributeValue> {
        self.instance(handle)?.get_attribute(name)?.convert(kind)
    }

    pub fn set_attribute(&self, handle: Handle, name: &str, value: &AttributeValue) -> Result<()> {
        self.instance(handle)?.set_attribute(name, value)
    }

    /// Resets a plugin and gives the boot frame buffer back to the guest.
    pub fn reset(&self, handle: Handle) -> Result<()> {
        let instance = self.instance(handle)?;
        instance.reset()?;
        self.callbacks.restore_original_lfb();
        debug!("reset {}", instance.info().name);
        Ok(())
    }

    /// Whether the plugin takes part in migration: extended generation,
    /// migration capable, and migration supported by this environment.
    pub fn is_migration_capable(&self, handle: Handle) -> bool {
        self.config.migration.supported
            && self.instance(handle).is_ok_and(|p| {
                p.migration().is_some() && p.info().migration_capabilities & VGPU_CAP_MIGRATION != 0
            })
    }

    pub fn migration_stage(&self, handle: Handle) -> Result<MigrationStage> {
        let instance = self.instance(handle)?;
        instance.migration().map(|m| m.stage()).ok_or(VmiopError::NotFound)
    }

    /// Moves one plugin to `stage`.
    pub fn notify_migration(&self, handle: Handle, stage: MigrationStage) -> Result<()> {
        let instance = self.instance(handle)?;
        let controller = instance.migration().ok_or(VmiopError::NotFound)?;
        controller.notify(instance.device_state(), stage)?;

        let mut migrating = self.migrating.lock();
        migrating.retain(|(h, weak)| *h != handle && weak.strong_count() > 0);
        if stage != MigrationStage::None {
            migrating.push((handle, Arc::downgrade(&instance)));
        }
        Ok(())
    }

    /// Moves every migration-capable plugin to `stage`, bottom of the stack
    /// first. Stops at the first plugin that refuses.
    pub fn notify_all(&self, stage: MigrationStage) -> Result<usize> {
        let mut notified = 0;
        for handle in self.plugins() {
            if !self.is_migration_capable(handle) {
                continue;
            }
            self.notify_migration(handle, stage)?;
            notified += 1;
        }
        Ok(notified)
    }

    /// Plugins currently outside stage `none` that are still loaded.
    pub fn migrating_plugins(&self) -> Vec<Handle> {
        let mut migrating = self.migrating.lock();
        migrating.retain(|(h, weak)| weak.strong_count() > 0 && self.registry.contains(*h));
        migrating.iter().map(|(h, _)| *h).collect()
    }

    pub fn read_device_buffer(&self, handle: Handle, out: &mut [u8]) -> Result<ReadProgress> {
        let instance = self.instance(handle)?;
        let controller = instance.migration().ok_or(VmiopError::NotFound)?;
        controller.read(instance.device_state(), out)
    }

    pub fn write_device_buffer(&self, handle: Handle, data: &[u8]) -> Result<()> {
        let instance = self.instance(handle)?;
        let controller = instance.migration().ok_or(VmiopError::NotFound)?;
        controller.write(instance.device_state(), data)
    }
}


impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("environment shutdown failed: {}", err);
        }
    }
}
