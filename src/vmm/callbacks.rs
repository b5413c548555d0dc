//! Services the hosting environment offers every plugin.

use log::debug;
use parking_lot::Mutex;

use crate::config::GuestConfig;
use crate::error::{Result, VmiopError};
use crate::types::{GuestId, GuestIdType, Handle};


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptMode {
    Off,
    On,
}


/// Contiguous run of guest frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRange {
    pub first_gfn: u64,
    pub count: u64,
}


/// Environment callback table.
///
/// The core only calls into it for notifications that accompany resets and
/// migration; plugins reach it through their context.
pub trait EnvCallbacks: Send + Sync {
    fn control_interrupt(&self, device: Handle, line: u32, mode: InterruptMode) -> Result<()>;

    fn control_interrupt_msi(&self, device: Handle, msg_addr: u64, msg_data: u32) -> Result<()>;

    /// Pins guest frames and returns the matching host frames.
    fn pin_guest_pages(&self, gpfns: &[u64]) -> Result<Vec<u64>>;

    fn unpin_guest_pages(&self, gpfns: &[u64], hpfns: &[u64]) -> Result<()>;

    fn guest_id(&self) -> GuestId;

    fn guest_id_type(&self) -> GuestIdType {
        match self.guest_id() {
            GuestId::Domain(_) => GuestIdType::DomainId,
            GuestId::Uuid(_) => GuestIdType::Uuid,
        }
    }

    /// Hands the boot frame buffer back to the guest.
    fn restore_original_lfb(&self);

    fn can_discard_presentation_surface_params(&self) -> bool;

    /// Reports guest pages a device wrote behind the hypervisor's back.
    fn set_guest_dirty_pages(&self, pages: &[PageRange]) -> Result<()>;
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvCall {
    Interrupt { device: Handle, line: u32, mode: InterruptMode },
    Msi { device: Handle, msg_addr: u64, msg_data: u32 },
    Pin(Vec<u64>),
    Unpin(Vec<u64>),
    RestoreLfb,
    DirtyPages(Vec<PageRange>),
}


/// Callback table that logs and records every call, backed by the guest
/// section of the configuration. Pinning maps guest frames one to one.
pub struct RecordingCallbacks {
    guest: GuestConfig,
    calls: Mutex<Vec<EnvCall>>,
}


impl RecordingCallbacks {
    pub fn new(guest: GuestConfig) -> Self {
        Self { guest, calls: Mutex::new(Vec::new()) }
    }

    pub fn calls(&self) -> Vec<EnvCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: EnvCall) {
        debug!("environment callback: {:?}", call);
        self.calls.lock().push(call);
    }
}


impl EnvCallbacks for RecordingCallbacks {
    fn control_interrupt(&self, device: Handle, line: u32, mode: InterruptMode) -> Result<()> {
        if device.is_null() {
            return Err(VmiopError::Inval);
        }
        self.record(EnvCall::Interrupt { device, line, mode });
        Ok(())
    }

    fn control_interrupt_msi(&self, device: Handle, msg_addr: u64, msg_data: u32) -> Result<()> {
        if device.is_null() {
            return Err(VmiopError::Inval);
        }
        self.record(EnvCall::Msi { device, msg_addr, msg_data });
        Ok(())
    }

    fn pin_guest_pages(&self, gpfns: &[u64]) -> Result<Vec<u64>> {
        if gpfns.is_empty() {
            return Err(VmiopError::Inval);
        }
        self.record(EnvCall::Pin(gpfns.to_vec()));
        Ok(gpfns.to_vec())
    }

    fn unpin_guest_pages(&self, gpfns: &[u64], hpfns: &[u64]) -> Result<()> {
        if gpfns.len() != hpfns.len() {
            return Err(VmiopError::Inval);
        }
        self.record(EnvCall::Unpin(gpfns.to_vec()));
        Ok(())
    }

    fn guest_id(&self) -> GuestId {
        match (self.guest.id_type, self.guest.uuid) {
            (GuestIdType::Uuid, Some(uuid)) => GuestId::Uuid(uuid),
            (GuestIdType::Uuid, None) => GuestId::Uuid(uuid::Uuid::nil()),
            (GuestIdType::DomainId, _) => GuestId::Domain(self.guest.domain_id),
        }
    }

    fn restore_original_lfb(&self) {
        self.record(EnvCall::RestoreLfb);
    }

    fn can_discard_presentation_surface_params(&self) -> bool {
        self.guest.can_discard_presentation_surface_params
    }

    fn set_guest_dirty_pages(&self, pages: &[PageRange]) -> Result<()> {
        self.record(EnvCall::DirtyPages(pages.to_vec()));
        Ok(())
    }
}
