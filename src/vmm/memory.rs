use log::warn;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use super::registry::{ObjectKind, Resource};
use crate::error::{Result, VmiopError};
use crate::types::Access;


/// Guest memory range mapped into the environment on behalf of a plugin.
pub struct GuestRegion {
    base: GuestAddress,
    length: u64,
    access: Access,
    mem: GuestMemoryMmap,
}


impl Resource for GuestRegion {
    const KIND: ObjectKind = ObjectKind::Region;
}


impl GuestRegion {
    pub fn map(base: u64, length: u64, access: Access) -> Result<Self> {
        if length == 0 {
            return Err(VmiopError::Inval);
        }
        base.checked_add(length).ok_or(VmiopError::NoAddressSpace)?;
        let size: usize = length.try_into().map_err(|_| VmiopError::NoAddressSpace)?;
        let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(base), size)]).map_err(|e| {
            warn!("failed to map {:#x} bytes at {:#x}: {}", length, base, e);
            VmiopError::Resource
        })?;
        Ok(Self { base: GuestAddress(base), length, access, mem })
    }

    pub fn base(&self) -> u64 { self.base.0 }
    pub fn len(&self) -> u64 { self.length }
    pub fn is_empty(&self) -> bool { self.length == 0 }
    pub fn access(&self) -> Access { self.access }

    fn address(&self, offset: u64, len: usize) -> Result<GuestAddress> {
        let end = offset.checked_add(len as u64).ok_or(VmiopError::Range)?;
        if end > self.length {
            return Err(VmiopError::Range);
        }
        Ok(GuestAddress(self.base.0 + offset))
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.access == Access::None {
            return Err(VmiopError::Inval);
        }
        let addr = self.address(offset, buf.len())?;
        self.mem.read_slice(buf, addr).map_err(|e| {
            warn!("guest read at {:#x} failed: {}", addr.0, e);
            VmiopError::Range
        })
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        match self.access {
            Access::ReadWrite => {}
            Access::ReadOnly => return Err(VmiopError::ReadOnly),
            Access::None => return Err(VmiopError::Inval),
        }
        let addr = self.address(offset, buf.len())?;
        self.mem.write_slice(buf, addr).map_err(|e| {
            warn!("guest write at {:#x} failed: {}", addr.0, e);
            VmiopError::Range
        })
    }
}
