//! Reference plugins shipped with the runtime.

pub mod display;
pub mod presentation;

pub use display::DisplayPlugin;
pub use presentation::PresentationPlugin;
