//! Reference presentation plugin.
//!
//! Accepts display messages and processes them on a worker thread of its
//! own: frames update the presented surface, EDID requests are answered
//! with an EDID report sent back down the stack.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::BufferRef;
use crate::error::{Result, VmiopError};
use crate::message::{self, DisplayType, MessageKind, PresentationType};
use crate::module::{into_raw_plugin, RawPluginDescriptor, PLUGIN_SIGNATURE, PLUGIN_VERSION};
use crate::plugin::{Plugin, PluginContext};
use crate::types::{AttributeValue, ClassSet, Deadline, Direction, Handle, LogLevel, PluginClass};
use crate::vmm::sync::{CondVar, Event, Lock};


pub const NAME: &str = "presentation";


pub static DESCRIPTOR: RawPluginDescriptor = RawPluginDescriptor {
    length: size_of::<RawPluginDescriptor>() as u32,
    version: PLUGIN_VERSION,
    signature: PLUGIN_SIGNATURE.as_ptr(),
    name: c"presentation".as_ptr(),
    plugin_class: PluginClass::Presentation as u32,
    input_classes: ClassSet::of(PluginClass::Display).bits(),
    connect_down_allowed: true,
    connect_up_allowed: true,
    create: Some(create),
};


unsafe extern "C" fn create() -> *mut c_void {
    into_raw_plugin(Box::new(PresentationPlugin::new()))
}


/// 128-byte EDID base block advertising a single 1024x768 mode.
pub fn default_edid() -> Vec<u8> {
    let mut edid = vec![0u8; 128];
    edid[..8].copy_from_slice(&[0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]);
    edid[18] = 1; // version 1.4
    edid[19] = 4;
    edid[35] = 0x08; // 1024x768@60
    let sum = edid[..127].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    edid[127] = 0u8.wrapping_sub(sum);
    edid
}


fn parse_hex(raw: &str) -> Result<Vec<u8>> {
    let raw: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(raw).map_err(|_| VmiopError::Inval)
}


#[derive(Default)]
struct Surface {
    display_number: u32,
    last_frame: Option<Vec<u8>>,
}


struct Worker {
    thread: Handle,
    event: Arc<Event>,
    lock: Arc<Lock>,
    presented: Arc<CondVar>,
}


#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<BufferRef>>,
    stopping: AtomicBool,
    frames: AtomicU64,
    edid_replies: AtomicU64,
    surface: Mutex<Surface>,
    edid: Mutex<Vec<u8>>,
}


pub struct PresentationPlugin {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}


impl Default for PresentationPlugin {
    fn default() -> Self {
        Self::new()
    }
}


impl PresentationPlugin {
    pub fn new() -> Self {
        Self { shared: Arc::new(Shared::default()), worker: Mutex::new(None) }
    }

    pub fn frames_presented(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }

    pub fn edid_replies(&self) -> u64 {
        self.shared.edid_replies.load(Ordering::Acquire)
    }

    /// Display number and content of the last frame presented.
    pub fn last_frame(&self) -> Option<(u32, Vec<u8>)> {
        let surface = self.shared.surface.lock();
        surface.last_frame.clone().map(|f| (surface.display_number, f))
    }

    /// Blocks until at least `count` frames were presented.
    pub fn wait_for_frames(&self, count: u64, deadline: Deadline) -> Result<u64> {
        let (lock, presented) = match &*self.worker.lock() {
            Some(w) => (Arc::clone(&w.lock), Arc::clone(&w.presented)),
            None => return Err(VmiopError::Inval),
        };
        lock.lock(deadline)?;
        while self.frames_presented() < count {
            if let Err(err) = presented.wait(&lock, deadline) {
                lock.unlock()?;
                return Err(err);
            }
        }
        lock.unlock()?;
        Ok(self.frames_presented())
    }
}


fn run_worker(ctx: PluginContext, shared: Arc<Shared>, event: Arc<Event>, lock: Arc<Lock>, presented: Arc<CondVar>) {
    loop {
        if let Err(err) = event.wait(Deadline::NO_LIMIT, true) {
            ctx.log(LogLevel::Error, format_args!("worker wait failed: {}", err));
            return;
        }
        loop {
            let next = shared.queue.lock().pop_front();
            let Some(buffer) = next else { break };
            if let Err(err) = process(&ctx, &shared, &buffer) {
                ctx.log(LogLevel::Error, format_args!("dropping message: {}", err));
            }
            if let Err(err) = buffer.release() {
                ctx.log(LogLevel::Error, format_args!("buffer release failed: {}", err));
            }
            if lock.lock(Deadline::NO_LIMIT).is_ok() {
                presented.broadcast();
                let _ = lock.unlock();
            }
        }
        if shared.stopping.load(Ordering::Acquire) {
            return;
        }
    }
}


fn process(ctx: &PluginContext, shared: &Shared, buffer: &BufferRef) -> Result<()> {
    let msg = message::parse(buffer.element(0).ok_or(VmiopError::Inval)?)?;
    if buffer.discard_config() && ctx.callbacks().can_discard_presentation_surface_params() {
        *shared.surface.lock() = Surface::default();
    }
    match msg.kind {
        MessageKind::Display(DisplayType::Frame) => {
            let mut surface = shared.surface.lock();
            surface.display_number = msg.display_number;
            surface.last_frame = Some(msg.content.to_vec());
            shared.frames.fetch_add(1, Ordering::AcqRel);
        }
        MessageKind::Display(DisplayType::EdidRequest) => {
            let edid = shared.edid.lock().clone();
            let reply = ctx.compose_message(
                PluginClass::Display,
                MessageKind::Presentation(PresentationType::EdidReport),
                msg.display_number,
                &edid,
            )?;
            let delivered = ctx.deliver(&reply, Direction::Down);
            reply.release()?;
            delivered?;
            shared.edid_replies.fetch_add(1, Ordering::AcqRel);
        }
        MessageKind::Display(DisplayType::Null) => {}
        other => ctx.log(LogLevel::Debug, format_args!("unhandled {:?} (seq {})", other, msg.header.sequence)),
    }
    Ok(())
}


impl Plugin for PresentationPlugin {
    fn init(&self, ctx: &PluginContext) -> Result<()> {
        let edid = match ctx.config_get("edid") {
            Ok(raw) => parse_hex(raw)?,
            Err(VmiopError::NotFound) => default_edid(),
            Err(err) => return Err(err),
        };
        *self.shared.edid.lock() = edid;
        self.shared.stopping.store(false, Ordering::Release);

        let event = ctx.lookup::<Event>(ctx.create_event()?)?;
        let lock = ctx.lookup::<Lock>(ctx.create_lock()?)?;
        let presented = ctx.lookup::<CondVar>(ctx.create_condvar()?)?;
        let thread = {
            let (worker_ctx, shared) = (ctx.clone(), Arc::clone(&self.shared));
            let (event, lock, presented) = (Arc::clone(&event), Arc::clone(&lock), Arc::clone(&presented));
            ctx.spawn_thread("presentation", move |_| run_worker(worker_ctx, shared, event, lock, presented))?
        };
        *self.worker.lock() = Some(Worker { thread, event, lock, presented });
        Ok(())
    }

    fn shutdown(&self, ctx: &PluginContext) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else { return Ok(()) };
        self.shared.stopping.store(true, Ordering::Release);
        worker.event.post(false);
        ctx.join_thread(worker.thread)?;
        let leftover: Vec<BufferRef> = self.shared.queue.lock().drain(..).collect();
        for buffer in leftover {
            buffer.release()?;
        }
        Ok(())
    }

    fn get_attribute(&self, _ctx: &PluginContext, name: &str) -> Result<AttributeValue> {
        match name {
            "frames_presented" => Ok(AttributeValue::Unsigned(self.frames_presented())),
            _ => Err(VmiopError::NotFound),
        }
    }

    fn put_message(&self, _ctx: &PluginContext, buffer: BufferRef) -> Result<()> {
        let event = match &*self.worker.lock() {
            Some(w) => Arc::clone(&w.event),
            None => return Err(VmiopError::Inval),
        };
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(VmiopError::Inval);
        }
        {
            let mut queue = self.shared.queue.lock();
            queue.try_reserve(1).map_err(|_| VmiopError::Resource)?;
            queue.push_back(buffer);
        }
        event.post(true);
        Ok(())
    }

    fn reset(&self, _ctx: &PluginContext) -> Result<()> {
        *self.shared.surface.lock() = Surface::default();
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_edid_checksums_to_zero() {
        let edid = default_edid();
        assert_eq!(edid.len(), 128);
        assert_eq!(edid.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)), 0);
    }

    #[test]
    fn hex_option() {
        assert_eq!(parse_hex("00 ff 10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert_eq!(parse_hex("abc"), Err(VmiopError::Inval));
        assert_eq!(parse_hex("zz"), Err(VmiopError::Inval));
        assert_eq!(parse_hex("\u{e9}0"), Err(VmiopError::Inval));
        assert_eq!(parse_hex("0A\tBc\n"), Ok(vec![0x0a, 0xbc]));
    }

    #[test]
    fn messages_before_init_are_refused() {
        let plugin = PresentationPlugin::new();
        assert!(plugin.wait_for_frames(1, Deadline::POLL).is_err());
    }
}
