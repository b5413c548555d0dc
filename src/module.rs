//! Plugin modules: descriptor validation, the built-in catalog and loading
//! of shared libraries.
//!
//! A module exports a descriptor named `<base-name>_vmiop_plugin`. Nothing
//! in a descriptor is trusted until its length, signature and version have
//! been checked; a descriptor that fails any check is rejected whole.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use std::any::Any;
use std::collections::BTreeMap;
use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;

use crate::plugin::{AbiGeneration, Plugin, PluginInfo};
use crate::types::{ClassSet, PluginClass};


pub const PLUGIN_SIGNATURE: &CStr = c"VMIOP_PLUGIN_SIGNATURE";


/// Appended to a module's base name to form its descriptor symbol.
pub const PLUGIN_SUFFIX: &str = "_vmiop_plugin";


/// 1.0.0, base descriptor.
pub const PLUGIN_VERSION: u32 = 0x0001_0000;
/// 2.0.0, adds the migration entry points.
pub const PLUGIN_VERSION_V2: u32 = 0x0002_0000;


/// Creates a plugin instance. Returns a pointer produced by
/// [`into_raw_plugin`], or null on failure.
pub type CreatePluginFn = unsafe extern "C" fn() -> *mut c_void;


/// Base descriptor record.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawPluginDescriptor {
    /// Size of the whole record.
    pub length: u32,
    pub version: u32,
    pub signature: *const c_char,
    pub name: *const c_char,
    pub plugin_class: u32,
    pub input_classes: u32,
    pub connect_down_allowed: bool,
    pub connect_up_allowed: bool,
    pub create: Option<CreatePluginFn>,
}


/// Extended descriptor record.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawPluginDescriptorV2 {
    pub base: RawPluginDescriptor,
    pub migration_capabilities: u64,
}


// Descriptors are immutable statics; the pointers name static strings.
unsafe impl Sync for RawPluginDescriptor {}
unsafe impl Sync for RawPluginDescriptorV2 {}


impl RawPluginDescriptor {
    pub const fn as_raw(&self) -> *const RawPluginDescriptor {
        self
    }
}


impl RawPluginDescriptorV2 {
    /// Pointer to the whole record, typed as its base prefix.
    pub const fn as_raw(&self) -> *const RawPluginDescriptor {
        (self as *const RawPluginDescriptorV2).cast()
    }
}


/// Passes a plugin out of a module's create function. Host and module must
/// be built by the same compiler.
pub fn into_raw_plugin(plugin: Box<dyn Plugin>) -> *mut c_void {
    Box::into_raw(Box::new(plugin)).cast()
}


/// # Safety
///
/// `ptr` must be null or come from [`into_raw_plugin`], and be used once.
unsafe fn plugin_from_raw(ptr: *mut c_void) -> Option<Box<dyn Plugin>> {
    if ptr.is_null() {
        return None;
    }
    Some(*Box::from_raw(ptr.cast::<Box<dyn Plugin>>()))
}


pub type PluginFactory = Arc<dyn Fn() -> Result<Box<dyn Plugin>> + Send + Sync>;


/// A validated plugin module, ready to be instantiated.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub info: PluginInfo,
    factory: PluginFactory,
    module: Option<Arc<dyn Any + Send + Sync>>,
}


impl PluginDescriptor {
    pub fn new<F>(info: PluginInfo, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        Self { info, factory: Arc::new(factory), module: None }
    }

    pub fn instantiate(&self) -> Result<Box<dyn Plugin>> {
        (self.factory)().with_context(|| format!("failed to create plugin `{}`", self.info.name))
    }

    /// Keeps the module the plugin code lives in loaded.
    pub(crate) fn module(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.module.clone()
    }
}


impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("info", &self.info)
            .field("dynamic", &self.module.is_some())
            .finish()
    }
}


/// Validates the descriptor at `raw`.
///
/// Checks run in order: non-null, length covers the base record, signature,
/// known version, length covers the record of that version, known class,
/// name, create function.
///
/// # Safety
///
/// `raw` must be null or point to readable memory of at least the length
/// the record claims, whose string and function pointers stay valid for as
/// long as the returned descriptor is used.
pub unsafe fn validate_descriptor(raw: *const RawPluginDescriptor) -> Result<PluginDescriptor> {
    if raw.is_null() {
        bail!("plugin descriptor is null");
    }
    let length = std::ptr::addr_of!((*raw).length).read() as usize;
    if length < size_of::<RawPluginDescriptor>() {
        bail!("plugin descriptor length {} is too short", length);
    }
    let base = &*raw;
    if base.signature.is_null() || CStr::from_ptr(base.signature) != PLUGIN_SIGNATURE {
        bail!("plugin descriptor signature mismatch");
    }
    let generation = match base.version {
        PLUGIN_VERSION => AbiGeneration::Base,
        PLUGIN_VERSION_V2 => AbiGeneration::Extended,
        other => bail!("unsupported plugin descriptor version {:#x}", other),
    };
    let migration_capabilities = match generation {
        AbiGeneration::Base => 0,
        AbiGeneration::Extended => {
            if length < size_of::<RawPluginDescriptorV2>() {
                bail!("plugin descriptor length {} is too short for version 2", length);
            }
            (*raw.cast::<RawPluginDescriptorV2>()).migration_capabilities
        }
    };
    let class = PluginClass::from_raw(base.plugin_class)
        .ok_or_else(|| anyhow!("unknown plugin class {}", base.plugin_class))?;
    if base.name.is_null() {
        bail!("plugin descriptor has no name");
    }
    let name = CStr::from_ptr(base.name).to_str().context("plugin name is not UTF-8")?.to_string();
    let create = base.create.ok_or_else(|| anyhow!("plugin `{}` has no create function", name))?;

    let info = PluginInfo {
        name: name.clone(),
        class,
        input_classes: ClassSet::from_bits(base.input_classes),
        connect_down_allowed: base.connect_down_allowed,
        connect_up_allowed: base.connect_up_allowed,
        generation,
        migration_capabilities,
    };
    debug!("validated descriptor for {} ({:?}, {:?})", name, class, generation);
    Ok(PluginDescriptor::new(info, move || {
        // SAFETY: `create` hands out a pointer from `into_raw_plugin` or null.
        unsafe { plugin_from_raw(create()) }
            .ok_or_else(|| anyhow!("plugin `{}` failed to create an instance", name))
    }))
}


/// Descriptor symbol for the module at `path`: the file name without any
/// extensions and without a leading `lib`, followed by [`PLUGIN_SUFFIX`].
pub fn symbol_name(path: &Path) -> Result<String> {
    let file = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| anyhow!("invalid plugin module path {}", path.display()))?;
    let stem = file.split('.').next().unwrap_or(file);
    let base = stem.strip_prefix("lib").unwrap_or(stem);
    if base.is_empty() {
        bail!("plugin module {} has an empty base name", path.display());
    }
    Ok(format!("{}{}", base, PLUGIN_SUFFIX))
}


/// Loads a plugin module from a shared library.
#[cfg(feature = "dynamic-modules")]
pub fn load_library(path: &Path) -> Result<PluginDescriptor> {
    use libloading::{Library, Symbol};

    let symbol = symbol_name(path)?;
    // SAFETY: loading a module runs its initializers; modules are trusted
    // as far as the descriptor checks below go.
    let lib = unsafe { Library::new(path) }
        .with_context(|| format!("failed to load plugin module {}", path.display()))?;
    // SAFETY: the symbol is a data symbol; its address is the descriptor.
    let raw: *const RawPluginDescriptor = unsafe {
        let sym: Symbol<*const RawPluginDescriptor> = lib
            .get(symbol.as_bytes())
            .with_context(|| format!("missing descriptor `{}` in {}", symbol, path.display()))?;
        *sym
    };
    // SAFETY: the descriptor lives in `lib`, which the returned descriptor
    // keeps loaded.
    let mut descriptor = unsafe { validate_descriptor(raw) }
        .with_context(|| format!("rejected plugin module {}", path.display()))?;
    descriptor.module = Some(Arc::new(lib));
    info!("loaded plugin module {} from {}", descriptor.info.name, path.display());
    Ok(descriptor)
}


/// Plugin modules known by name.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, PluginDescriptor>,
}


impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the reference display and presentation plugins.
    pub fn builtin() -> Result<Self> {
        use crate::plugins::{display, presentation};

        let mut catalog = Self::new();
        // SAFETY: both descriptors are statics with static strings.
        unsafe {
            catalog.register_raw(display::NAME, display::DESCRIPTOR.as_raw())?;
            catalog.register_raw(presentation::NAME, presentation::DESCRIPTOR.as_raw())?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, name: &str, descriptor: PluginDescriptor) {
        self.modules.insert(name.to_string(), descriptor);
    }

    /// Validates a descriptor compiled into the host and registers it.
    ///
    /// # Safety
    ///
    /// Same contract as [`validate_descriptor`], for the life of the catalog.
    pub unsafe fn register_raw(&mut self, name: &str, raw: *const RawPluginDescriptor) -> Result<()> {
        let descriptor = validate_descriptor(raw)
            .with_context(|| format!("rejected built-in plugin module `{}`", name))?;
        self.register(name, descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PluginDescriptor> {
        self.modules.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Finds `module` in the catalog, or else loads it as a shared library.
    pub fn resolve(&self, module: &str) -> Result<PluginDescriptor> {
        if let Some(descriptor) = self.modules.get(module) {
            return Ok(descriptor.clone());
        }
        #[cfg(feature = "dynamic-modules")]
        {
            load_library(Path::new(module))
        }
        #[cfg(not(feature = "dynamic-modules"))]
        {
            bail!("unknown plugin module `{}`", module)
        }
    }
}
