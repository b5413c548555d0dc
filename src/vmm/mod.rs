pub mod registry;
pub mod sync;
pub mod thread;
pub mod memory;
pub mod callbacks;
