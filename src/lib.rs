//! Plugin runtime for virtual-machine I/O emulation.
//!
//! Device-emulation and presentation plugins are stacked by an
//! [`Environment`], exchange reference-counted [`Buffer`]s over the
//! [`MessageBus`] and stream their device state during live migration
//! through a [`MigrationController`]. Every object a plugin creates lives
//! in the handle-indexed [`Registry`].

pub mod buffer;
pub mod bus;
pub mod config;
pub mod environment;
pub mod error;
pub mod graph;
pub mod logging;
pub mod message;
pub mod migration;
pub mod module;
pub mod plugin;
pub mod plugins;
pub mod types;
pub mod vmm;


pub use buffer::{Buffer, BufferPool, BufferRef, ReleaseCallback};
pub use bus::MessageBus;
pub use config::{EnvironmentConfig, PluginConfig};
pub use environment::Environment;
pub use error::{Result, VmiopError};
pub use graph::{Node, Placement, PluginGraph};
pub use message::{DisplayType, Message, MessageKind, PresentationType};
pub use migration::{DeviceState, MigrationController, ReadProgress};
pub use module::{ModuleCatalog, PluginDescriptor};
pub use plugin::{AbiGeneration, Plugin, PluginContext, PluginInfo, PluginInstance};
pub use types::{
    AttributeType, AttributeValue, ClassSet, Deadline, Direction, Handle, LogLevel, MigrationStage, PluginClass,
};
pub use vmm::callbacks::{EnvCallbacks, RecordingCallbacks};
pub use vmm::registry::Registry;
