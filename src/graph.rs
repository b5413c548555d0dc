//! Ordered stack of plugin instances.
//!
//! Index 0 is the bottom of the stack, the device-facing end; moving
//! [`Direction::Up`] increases the index.

use log::{debug, warn};
use parking_lot::RwLock;

use crate::bus;
use crate::error::{Result, VmiopError};
use crate::plugin::PluginInfo;
use crate::types::{ClassSet, Direction, Handle, PluginClass};


/// Where a plugin is attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Top,
    Bottom,
    Above(Handle),
    Below(Handle),
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub handle: Handle,
    pub class: PluginClass,
    pub input_classes: ClassSet,
    pub connect_down_allowed: bool,
    pub connect_up_allowed: bool,
}


impl Node {
    pub fn new(handle: Handle, info: &PluginInfo) -> Self {
        Self {
            handle,
            class: info.class,
            input_classes: info.input_classes,
            connect_down_allowed: info.connect_down_allowed,
            connect_up_allowed: info.connect_up_allowed,
        }
    }
}


#[derive(Default)]
pub struct PluginGraph {
    stack: RwLock<Vec<Node>>,
}


impl PluginGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `node` at `placement` and returns its index.
    ///
    /// Fails with `NotFound` when the reference plugin is not attached or
    /// when a neighbour, or `node` itself, forbids the resulting connection.
    pub fn attach(&self, node: Node, placement: Placement) -> Result<usize> {
        if bus::in_callback() {
            return Err(VmiopError::NotAllowedInCallback);
        }
        if node.handle.is_null() {
            return Err(VmiopError::Inval);
        }
        let mut stack = self.stack.write();
        if stack.iter().any(|n| n.handle == node.handle) {
            return Err(VmiopError::Inval);
        }
        let position = |h: Handle| stack.iter().position(|n| n.handle == h).ok_or(VmiopError::NotFound);
        let index = match placement {
            Placement::Top => stack.len(),
            Placement::Bottom => 0,
            Placement::Above(h) => position(h)? + 1,
            Placement::Below(h) => position(h)?,
        };

        if let Some(below) = index.checked_sub(1).and_then(|i| stack.get(i)) {
            if !below.connect_up_allowed || !node.connect_down_allowed {
                warn!("{} may not be connected above {}", node.handle, below.handle);
                return Err(VmiopError::NotFound);
            }
        }
        if let Some(above) = stack.get(index) {
            if !above.connect_down_allowed || !node.connect_up_allowed {
                warn!("{} may not be connected below {}", node.handle, above.handle);
                return Err(VmiopError::NotFound);
            }
        }

        stack.insert(index, node);
        debug!("attached {} ({:?}) at {} of {}", node.handle, node.class, index, stack.len());
        Ok(index)
    }

    pub fn detach(&self, handle: Handle) -> Result<Node> {
        if bus::in_callback() {
            return Err(VmiopError::NotAllowedInCallback);
        }
        let mut stack = self.stack.write();
        let index = stack.iter().position(|n| n.handle == handle).ok_or(VmiopError::NotFound)?;
        let node = stack.remove(index);
        debug!("detached {} from {}", handle, index);
        Ok(node)
    }

    pub fn position(&self, handle: Handle) -> Option<usize> {
        self.stack.read().iter().position(|n| n.handle == handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.position(handle).is_some()
    }

    /// Handles from the bottom of the stack up.
    pub fn snapshot(&self) -> Vec<Handle> {
        self.stack.read().iter().map(|n| n.handle).collect()
    }

    pub fn len(&self) -> usize {
        self.stack.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nearest plugin from `caller` in `direction` that accepts buffers
    /// from `source_class`. Plugins that do not accept it are passed over.
    pub fn next_acceptor(&self, caller: Handle, direction: Direction, source_class: PluginClass) -> Result<Handle> {
        let stack = self.stack.read();
        let index = stack.iter().position(|n| n.handle == caller).ok_or(VmiopError::NotFound)?;
        let found = match direction {
            Direction::Up => stack[index + 1..].iter().find(|n| n.input_classes.contains(source_class)),
            Direction::Down => stack[..index].iter().rev().find(|n| n.input_classes.contains(source_class)),
        };
        found.map(|n| n.handle).ok_or(VmiopError::NotFound)
    }
}
