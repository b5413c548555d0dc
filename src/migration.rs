//! Per-device migration stage machine and device-state streaming.
//!
//! The environment advances the stage through [`MigrationController::notify`]
//! and, while the device is migrating, drains its state with
//! [`MigrationController::read`] or feeds it with
//! [`MigrationController::write`]. Writes may arrive before the device has
//! finished initializing; they are queued and applied in arrival order once
//! [`MigrationController::mark_initialized`] runs.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::{Result, VmiopError};
use crate::types::MigrationStage;


/// Serialized device state of a plugin.
pub trait DeviceState: Send + Sync {
    /// Produces the state to stream during `stage`. Called once per read
    /// pass; an error leaves the pass unstarted so a later read retries.
    fn save(&self, stage: MigrationStage) -> Result<Vec<u8>>;

    /// Accepts the next chunk of incoming state.
    fn restore_chunk(&self, chunk: &[u8]) -> Result<()>;

    /// All incoming state has arrived.
    fn restore_complete(&self) -> Result<()>;

    /// Observes a stage change before it takes effect. Failing vetoes it.
    fn stage_changed(&self, _from: MigrationStage, _to: MigrationStage) -> Result<()> {
        Ok(())
    }
}


/// Device without state of its own.
pub struct Stateless;


impl DeviceState for Stateless {
    fn save(&self, _stage: MigrationStage) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore_chunk(&self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() { Ok(()) } else { Err(VmiopError::Range) }
    }

    fn restore_complete(&self) -> Result<()> {
        Ok(())
    }
}


/// Outcome of one read call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadProgress {
    /// Bytes still to be read in this pass, this call's excluded.
    pub remaining: u64,
    pub written: u64,
}


#[derive(Default)]
struct Outgoing {
    data: Vec<u8>,
    cursor: usize,
}


#[derive(Default)]
struct Inner {
    stage: MigrationStage,
    outgoing: Option<Outgoing>,
    /// The read pass of the current stage has reached zero remaining.
    drained: bool,
    queued: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    initialized: bool,
    restored_bytes: u64,
    completion_pending: bool,
}


pub struct MigrationController {
    name: String,
    inner: Mutex<Inner>,
    write_queue_limit: usize,
}


impl MigrationController {
    pub fn new(name: &str, write_queue_limit: usize) -> Self {
        Self { name: name.to_string(), inner: Mutex::new(Inner::default()), write_queue_limit }
    }

    pub fn stage(&self) -> MigrationStage {
        self.inner.lock().stage
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Bytes of incoming state waiting for initialization to finish.
    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().queued_bytes
    }

    pub fn restored_bytes(&self) -> u64 {
        self.inner.lock().restored_bytes
    }

    /// Advances to `next`. Anything but a legal successor of the current
    /// stage fails with `Inval` and leaves the stage unchanged.
    pub fn notify(&self, state: &dyn DeviceState, next: MigrationStage) -> Result<()> {
        let mut inner = self.inner.lock();
        let current = inner.stage;
        if !current.can_advance_to(next) {
            warn!("{}: rejected migration stage {:?} -> {:?}", self.name, current, next);
            return Err(VmiopError::Inval);
        }
        state.stage_changed(current, next)?;

        match next {
            MigrationStage::PreCopy | MigrationStage::StopAndCopy => {
                inner.outgoing = None;
                inner.drained = false;
            }
            MigrationStage::Resume => {
                inner.outgoing = None;
                inner.drained = true;
                if inner.restored_bytes > 0 || !inner.queued.is_empty() {
                    if inner.initialized && inner.queued.is_empty() {
                        state.restore_complete()?;
                    } else {
                        inner.completion_pending = true;
                    }
                }
            }
            MigrationStage::None => {
                if !inner.queued.is_empty() {
                    warn!("{}: dropping {} bytes of unapplied device state", self.name, inner.queued_bytes);
                }
                inner.outgoing = None;
                inner.drained = false;
                inner.queued.clear();
                inner.queued_bytes = 0;
                inner.restored_bytes = 0;
                inner.completion_pending = false;
            }
        }
        inner.stage = next;
        info!("{}: migration stage {:?} -> {:?}", self.name, current, next);
        Ok(())
    }

    /// Copies the next part of the device state into `out`.
    ///
    /// Once a pass has reported zero remaining bytes, further reads in the
    /// same stage return zero written and zero remaining.
    pub fn read(&self, state: &dyn DeviceState, out: &mut [u8]) -> Result<ReadProgress> {
        let mut inner = self.inner.lock();
        if !matches!(inner.stage, MigrationStage::PreCopy | MigrationStage::StopAndCopy) {
            return Err(VmiopError::Inval);
        }
        if inner.drained {
            return Ok(ReadProgress::default());
        }
        if inner.outgoing.is_none() {
            let data = state.save(inner.stage)?;
            debug!("{}: {} bytes of device state to stream in {:?}", self.name, data.len(), inner.stage);
            inner.outgoing = Some(Outgoing { data, cursor: 0 });
        }

        let (written, remaining) = match inner.outgoing.as_mut() {
            Some(pass) => {
                let n = out.len().min(pass.data.len() - pass.cursor);
                out[..n].copy_from_slice(&pass.data[pass.cursor..pass.cursor + n]);
                pass.cursor += n;
                (n, pass.data.len() - pass.cursor)
            }
            None => (0, 0),
        };
        if remaining == 0 {
            inner.outgoing = None;
            inner.drained = true;
        }
        Ok(ReadProgress { remaining: remaining as u64, written: written as u64 })
    }

    /// Accepts the next chunk of incoming device state.
    pub fn write(&self, state: &dyn DeviceState, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.stage == MigrationStage::None {
            return Err(VmiopError::Inval);
        }
        if !inner.initialized || !inner.queued.is_empty() {
            let total = inner.queued_bytes.checked_add(data.len()).ok_or(VmiopError::Resource)?;
            if total > self.write_queue_limit {
                return Err(VmiopError::Resource);
            }
            let mut chunk = Vec::new();
            chunk.try_reserve_exact(data.len()).map_err(|_| VmiopError::Resource)?;
            chunk.extend_from_slice(data);
            inner.queued.push_back(chunk);
            inner.queued_bytes = total;
            debug!("{}: queued {} bytes of device state", self.name, data.len());
            return Ok(());
        }
        state.restore_chunk(data)?;
        inner.restored_bytes += data.len() as u64;
        Ok(())
    }

    /// The device finished initializing: applies queued writes in order.
    ///
    /// If the device rejects a chunk, that chunk and everything after it
    /// stay queued and the controller stays uninitialized, so a later call
    /// resumes the flush where it stopped.
    pub fn mark_initialized(&self, state: &dyn DeviceState) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        while let Some(chunk) = inner.queued.pop_front() {
            if let Err(err) = state.restore_chunk(&chunk) {
                warn!("{}: queued device state rejected: {}", self.name, err);
                inner.queued.push_front(chunk);
                return Err(err);
            }
            inner.queued_bytes -= chunk.len();
            inner.restored_bytes += chunk.len() as u64;
        }
        if inner.completion_pending {
            state.restore_complete()?;
            inner.completion_pending = false;
        }
        inner.initialized = true;
        Ok(())
    }
}
