//! Reference display device-emulation plugin.
//!
//! Sits at the bottom of the stack, sends frames and EDID requests up to a
//! presentation plugin and caches the EDID reports that come back. Its
//! state survives migration.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::BufferRef;
use crate::error::{Result, VmiopError};
use crate::message::{self, DisplayType, MessageKind, PresentationType, DISPLAY_ALL};
use crate::migration::DeviceState;
use crate::module::{into_raw_plugin, RawPluginDescriptor, RawPluginDescriptorV2, PLUGIN_SIGNATURE, PLUGIN_VERSION_V2};
use crate::plugin::{Plugin, PluginContext};
use crate::types::{
    AttributeValue, ClassSet, Direction, LogLevel, MigrationStage, PluginClass, ATTRIBUTE_VGPU_CAP,
    ATTRIBUTE_VMM_MIGRATION_SUPPORTED, VGPU_CAP_MIGRATION,
};


pub const NAME: &str = "display";


pub static DESCRIPTOR: RawPluginDescriptorV2 = RawPluginDescriptorV2 {
    base: RawPluginDescriptor {
        length: size_of::<RawPluginDescriptorV2>() as u32,
        version: PLUGIN_VERSION_V2,
        signature: PLUGIN_SIGNATURE.as_ptr(),
        name: c"display".as_ptr(),
        plugin_class: PluginClass::Display as u32,
        input_classes: ClassSet::of(PluginClass::Presentation).bits(),
        connect_down_allowed: false,
        connect_up_allowed: true,
        create: Some(create),
    },
    migration_capabilities: VGPU_CAP_MIGRATION,
};


unsafe extern "C" fn create() -> *mut c_void {
    into_raw_plugin(Box::new(DisplayPlugin::new()))
}


#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DisplayState {
    display_count: u32,
    frames_sent: u64,
    edid: Option<Vec<u8>>,
    vnc_console_active: bool,
}


pub struct DisplayPlugin {
    ctx: Mutex<Option<PluginContext>>,
    state: Mutex<DisplayState>,
    incoming: Mutex<Vec<u8>>,
    vmm_migration_supported: AtomicBool,
}


impl Default for DisplayPlugin {
    fn default() -> Self {
        Self::new()
    }
}


impl DisplayPlugin {
    pub fn new() -> Self {
        Self {
            ctx: Mutex::new(None),
            state: Mutex::new(DisplayState { display_count: 1, ..DisplayState::default() }),
            incoming: Mutex::new(Vec::new()),
            vmm_migration_supported: AtomicBool::new(true),
        }
    }

    fn context(&self) -> Result<PluginContext> {
        self.ctx.lock().clone().ok_or(VmiopError::Inval)
    }

    fn check_display(&self, display_number: u32) -> Result<()> {
        if display_number != DISPLAY_ALL && display_number >= self.state.lock().display_count {
            return Err(VmiopError::Range);
        }
        Ok(())
    }

    fn send(&self, kind: MessageKind, display_number: u32, content: &[u8], discard_config: bool) -> Result<()> {
        let ctx = self.context()?;
        let mut buffer = ctx.compose_message(PluginClass::Presentation, kind, display_number, content)?;
        buffer.set_discard_config(discard_config)?;
        let delivered = ctx.deliver(&buffer, Direction::Up);
        buffer.release()?;
        delivered
    }

    /// Sends a frame for `display_number` up the stack.
    pub fn emit_frame(&self, display_number: u32, pixels: &[u8]) -> Result<()> {
        self.check_display(display_number)?;
        self.send(MessageKind::Display(DisplayType::Frame), display_number, pixels, false)?;
        self.state.lock().frames_sent += 1;
        Ok(())
    }

    /// Asks the presentation side for its EDID. Any cached EDID is
    /// invalidated along the way.
    pub fn request_edid(&self, display_number: u32) -> Result<()> {
        self.check_display(display_number)?;
        self.state.lock().edid = None;
        self.send(MessageKind::Display(DisplayType::EdidRequest), display_number, &[], true)
    }

    pub fn set_vnc_console_state(&self, active: bool) -> Result<()> {
        self.send(MessageKind::Display(DisplayType::SetVncConsoleState), DISPLAY_ALL, &[active as u8], false)?;
        self.state.lock().vnc_console_active = active;
        Ok(())
    }

    pub fn edid(&self) -> Option<Vec<u8>> {
        self.state.lock().edid.clone()
    }

    pub fn frames_sent(&self) -> u64 {
        self.state.lock().frames_sent
    }

    pub fn vnc_console_active(&self) -> bool {
        self.state.lock().vnc_console_active
    }
}


impl Plugin for DisplayPlugin {
    fn init(&self, ctx: &PluginContext) -> Result<()> {
        let display_count = match ctx.config_get("display_count") {
            Ok(raw) => raw.trim().parse::<u32>().map_err(|_| VmiopError::Inval)?,
            Err(VmiopError::NotFound) => 1,
            Err(err) => return Err(err),
        };
        if display_count == 0 {
            return Err(VmiopError::Inval);
        }
        self.state.lock().display_count = display_count;
        *self.ctx.lock() = Some(ctx.clone());
        ctx.log(LogLevel::Status, format_args!("{} display(s)", display_count));
        Ok(())
    }

    fn shutdown(&self, _ctx: &PluginContext) -> Result<()> {
        self.ctx.lock().take();
        Ok(())
    }

    fn get_attribute(&self, _ctx: &PluginContext, name: &str) -> Result<AttributeValue> {
        match name {
            ATTRIBUTE_VGPU_CAP => {
                let caps = if self.vmm_migration_supported.load(Ordering::Acquire) { VGPU_CAP_MIGRATION } else { 0 };
                Ok(AttributeValue::Unsigned(caps))
            }
            "display_count" => Ok(AttributeValue::Unsigned(self.state.lock().display_count.into())),
            "frames_sent" => Ok(AttributeValue::Unsigned(self.frames_sent())),
            _ => Err(VmiopError::NotFound),
        }
    }

    fn set_attribute(&self, _ctx: &PluginContext, name: &str, value: &AttributeValue) -> Result<()> {
        match name {
            ATTRIBUTE_VMM_MIGRATION_SUPPORTED => {
                let supported = value.as_unsigned().ok_or(VmiopError::Inval)?;
                self.vmm_migration_supported.store(supported != 0, Ordering::Release);
                Ok(())
            }
            _ => Err(VmiopError::NotFound),
        }
    }

    fn put_message(&self, ctx: &PluginContext, buffer: BufferRef) -> Result<()> {
        let parsed = buffer.element(0).ok_or(VmiopError::Inval).and_then(message::parse);
        let msg = match parsed {
            Ok(msg) => msg,
            Err(err) => {
                buffer.release()?;
                return Err(err);
            }
        };
        {
            let mut state = self.state.lock();
            if buffer.discard_config() {
                state.edid = None;
            }
            match msg.kind {
                MessageKind::Presentation(PresentationType::EdidReport) => {
                    ctx.log(LogLevel::Debug, format_args!("EDID report, {} bytes", msg.content.len()));
                    state.edid = Some(msg.content.to_vec());
                }
                MessageKind::Presentation(PresentationType::Null) => {}
                other => ctx.log(LogLevel::Notice, format_args!("ignoring {:?}", other)),
            }
        }
        buffer.release()
    }

    fn reset(&self, _ctx: &PluginContext) -> Result<()> {
        let mut state = self.state.lock();
        state.edid = None;
        state.frames_sent = 0;
        state.vnc_console_active = false;
        Ok(())
    }

    fn device_state(&self) -> Option<&dyn DeviceState> {
        Some(self)
    }
}


impl DeviceState for DisplayPlugin {
    fn save(&self, _stage: MigrationStage) -> Result<Vec<u8>> {
        serde_json::to_vec(&*self.state.lock()).map_err(|_| VmiopError::Resource)
    }

    fn restore_chunk(&self, chunk: &[u8]) -> Result<()> {
        let mut incoming = self.incoming.lock();
        incoming.try_reserve(chunk.len()).map_err(|_| VmiopError::Resource)?;
        incoming.extend_from_slice(chunk);
        Ok(())
    }

    fn restore_complete(&self) -> Result<()> {
        let raw = std::mem::take(&mut *self.incoming.lock());
        let restored: DisplayState = serde_json::from_slice(&raw).map_err(|_| VmiopError::Inval)?;
        *self.state.lock() = restored;
        Ok(())
    }

    fn stage_changed(&self, from: MigrationStage, to: MigrationStage) -> Result<()> {
        if to == MigrationStage::None && from != MigrationStage::Resume {
            self.incoming.lock().clear();
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_migration_stream() {
        let source = DisplayPlugin::new();
        {
            let mut state = source.state.lock();
            state.frames_sent = 12;
            state.edid = Some(vec![0, 255, 255, 0]);
        }
        let bytes = source.save(MigrationStage::StopAndCopy).unwrap();
        let dest = DisplayPlugin::new();
        let (a, b) = bytes.split_at(bytes.len() / 2);
        dest.restore_chunk(a).unwrap();
        dest.restore_chunk(b).unwrap();
        dest.restore_complete().unwrap();
        assert_eq!(*dest.state.lock(), *source.state.lock());
    }

    #[test]
    fn garbage_state_is_rejected() {
        let dest = DisplayPlugin::new();
        dest.restore_chunk(b"not json").unwrap();
        assert_eq!(dest.restore_complete(), Err(VmiopError::Inval));
    }

    #[test]
    fn sending_requires_init() {
        let plugin = DisplayPlugin::new();
        assert_eq!(plugin.emit_frame(0, b"px"), Err(VmiopError::Inval));
        assert_eq!(plugin.emit_frame(3, b"px"), Err(VmiopError::Range));
    }
}
