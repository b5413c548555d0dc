//! Reference-counted message buffers.
//!
//! A [`BufferRef`] is one counted reference. `retain` produces another one,
//! `release` (or dropping the reference) gives it back, and the buffer's
//! release callback runs exactly once, on the reference that brings the
//! count from 1 to 0. Buffers travel between plugins without copying; what
//! moves is the reference.

use log::{trace, warn};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::BufferPoolConfig;
use crate::error::{Result, VmiopError};
use crate::types::PluginClass;


/// Custom teardown run when the last reference goes away.
pub type ReleaseCallback = Box<dyn FnOnce(&Buffer) -> Result<()> + Send + Sync>;


#[derive(Clone)]
enum Element {
    Inline { offset: usize, len: usize },
    External(Arc<[u8]>),
}


pub struct Buffer {
    source_class: PluginClass,
    destination_class: PluginClass,
    references: AtomicU32,
    elements: Vec<Element>,
    data: Box<[u8]>,
    discard_config: AtomicBool,
    in_transit: AtomicBool,
    release: Mutex<Option<ReleaseCallback>>,
}


impl Buffer {
    pub fn source_class(&self) -> PluginClass {
        self.source_class
    }

    pub fn destination_class(&self) -> PluginClass {
        self.destination_class
    }

    /// Live references at the time of the call.
    pub fn references(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn element(&self, index: usize) -> Option<&[u8]> {
        Some(match self.elements.get(index)? {
            Element::Inline { offset, len } => &self.data[*offset..*offset + *len],
            Element::External(bytes) => bytes,
        })
    }

    pub fn elements(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.elements.len()).filter_map(move |i| self.element(i))
    }

    pub fn total_len(&self) -> usize {
        self.elements().map(<[u8]>::len).sum()
    }

    /// All element data, concatenated in order.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        self.elements().for_each(|e| out.extend_from_slice(e));
        out
    }

    /// Previously cached configuration state is stale.
    pub fn discard_config(&self) -> bool {
        self.discard_config.load(Ordering::Acquire)
    }

    pub fn is_in_transit(&self) -> bool {
        self.in_transit.load(Ordering::Acquire)
    }
}


impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("source_class", &self.source_class)
            .field("destination_class", &self.destination_class)
            .field("references", &self.references())
            .field("elements", &self.elements.len())
            .field("discard_config", &self.discard_config())
            .finish()
    }
}


/// One counted reference to a [`Buffer`].
pub struct BufferRef {
    inner: Option<Arc<Buffer>>,
}


impl BufferRef {
    fn new(buffer: Buffer) -> Self {
        Self { inner: Some(Arc::new(buffer)) }
    }

    fn shared(&self) -> &Arc<Buffer> {
        match &self.inner {
            Some(inner) => inner,
            None => unreachable!("buffer reference used after release"),
        }
    }

    /// Takes another reference.
    pub fn retain(&self) -> BufferRef {
        let shared = self.shared();
        shared.references.fetch_add(1, Ordering::AcqRel);
        BufferRef { inner: Some(Arc::clone(shared)) }
    }

    /// Gives this reference back. On the last reference the release
    /// callback runs and its result is returned.
    pub fn release(mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => release_shared(inner),
            None => Ok(()),
        }
    }

    /// Whether both references name the same buffer.
    pub fn ptr_eq(&self, other: &BufferRef) -> bool {
        Arc::ptr_eq(self.shared(), other.shared())
    }

    /// Exclusive access to the header, available only to the sole holder
    /// of a buffer that has not been delivered yet.
    fn exclusive(&mut self) -> Result<&mut Buffer> {
        let inner = match &mut self.inner {
            Some(inner) => inner,
            None => return Err(VmiopError::Inval),
        };
        let buffer = Arc::get_mut(inner).ok_or(VmiopError::ReadOnly)?;
        if *buffer.in_transit.get_mut() {
            return Err(VmiopError::ReadOnly);
        }
        Ok(buffer)
    }

    /// Writable view of an inline element.
    pub fn data_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let buffer = self.exclusive()?;
        match buffer.elements.get(index).ok_or(VmiopError::Range)? {
            Element::Inline { offset, len } => {
                let (offset, len) = (*offset, *len);
                Ok(&mut buffer.data[offset..offset + len])
            }
            Element::External(_) => Err(VmiopError::ReadOnly),
        }
    }

    /// Points element `index` at `len` bytes of inline data starting at
    /// `offset`.
    pub fn set_element(&mut self, index: usize, offset: usize, len: usize) -> Result<()> {
        let buffer = self.exclusive()?;
        let end = offset.checked_add(len).ok_or(VmiopError::Range)?;
        if end > buffer.data.len() {
            return Err(VmiopError::Range);
        }
        let slot = buffer.elements.get_mut(index).ok_or(VmiopError::Range)?;
        *slot = Element::Inline { offset, len };
        Ok(())
    }

    /// Points element `index` at memory the buffer does not own.
    pub fn set_external(&mut self, index: usize, bytes: Arc<[u8]>) -> Result<()> {
        let buffer = self.exclusive()?;
        let slot = buffer.elements.get_mut(index).ok_or(VmiopError::Range)?;
        *slot = Element::External(bytes);
        Ok(())
    }

    pub fn set_discard_config(&mut self, discard: bool) -> Result<()> {
        let buffer = self.exclusive()?;
        *buffer.discard_config.get_mut() = discard;
        Ok(())
    }

    /// Replaces the release callback and returns the previous one, so that
    /// custom teardown can chain to the pool's own.
    pub fn set_release_callback(&mut self, callback: ReleaseCallback) -> Result<Option<ReleaseCallback>> {
        let buffer = self.exclusive()?;
        Ok(buffer.release.get_mut().replace(callback))
    }

    /// Content becomes immutable from the first delivery on.
    pub(crate) fn mark_in_transit(&self) {
        self.shared().in_transit.store(true, Ordering::Release);
    }
}


impl Deref for BufferRef {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.shared()
    }
}


impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => inner.fmt(f),
            None => f.write_str("BufferRef(released)"),
        }
    }
}


impl Drop for BufferRef {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Err(err) = release_shared(inner) {
                warn!("buffer release callback failed: {}", err);
            }
        }
    }
}


fn release_shared(inner: Arc<Buffer>) -> Result<()> {
    let previous = inner.references.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0, "buffer reference count underflow");
    if previous != 1 {
        return Ok(());
    }
    trace!("last reference to {:?} released", inner);
    let callback = inner.release.lock().take();
    match callback {
        Some(callback) => callback(&inner),
        None => Ok(()),
    }
}


#[derive(Default)]
struct PoolStats {
    live_buffers: AtomicU32,
    live_bytes: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
}


/// Allocator for message buffers, bounded by [`BufferPoolConfig`].
pub struct BufferPool {
    config: BufferPoolConfig,
    stats: Arc<PoolStats>,
}


impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self { config, stats: Arc::new(PoolStats::default()) }
    }

    /// Allocates a buffer with `element_count` elements and `data_size`
    /// bytes of zeroed inline data. Element 0 covers the whole data region,
    /// the others start out empty.
    ///
    /// The inline data is one contiguous region and every inline element is
    /// a window into it, so [`BufferRef::set_element`] may overlap elements.
    /// The header and its element table are allocated separately from the
    /// data; only the data counts against the pool's byte limit.
    pub fn allocate(
        &self,
        source_class: PluginClass,
        destination_class: PluginClass,
        element_count: u32,
        data_size: u32,
    ) -> Result<BufferRef> {
        if element_count == 0 {
            return Err(VmiopError::Inval);
        }
        let size = data_size as usize;
        self.reserve(size as u64)?;

        let built = (|| {
            let mut data = Vec::new();
            data.try_reserve_exact(size).map_err(|_| VmiopError::Resource)?;
            data.resize(size, 0u8);
            let mut elements = Vec::new();
            elements.try_reserve_exact(element_count as usize).map_err(|_| VmiopError::Resource)?;
            elements.push(Element::Inline { offset: 0, len: size });
            elements.resize(element_count as usize, Element::Inline { offset: 0, len: 0 });
            Ok((data.into_boxed_slice(), elements))
        })();
        let (data, elements) = match built {
            Ok(parts) => parts,
            Err(err) => {
                self.unreserve(size as u64);
                return Err(err);
            }
        };

        let stats = Arc::clone(&self.stats);
        let release: ReleaseCallback = Box::new(move |_buffer| {
            stats.live_buffers.fetch_sub(1, Ordering::AcqRel);
            stats.live_bytes.fetch_sub(size as u64, Ordering::AcqRel);
            stats.releases.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);

        Ok(BufferRef::new(Buffer {
            source_class,
            destination_class,
            references: AtomicU32::new(1),
            elements,
            data,
            discard_config: AtomicBool::new(false),
            in_transit: AtomicBool::new(false),
            release: Mutex::new(Some(release)),
        }))
    }

    /// Builds a buffer around externally owned memory. It does not count
    /// against the pool limits; `release` runs when the last reference goes.
    pub fn wrap(
        &self,
        source_class: PluginClass,
        destination_class: PluginClass,
        elements: Vec<Arc<[u8]>>,
        release: Option<ReleaseCallback>,
    ) -> Result<BufferRef> {
        if elements.is_empty() {
            return Err(VmiopError::Inval);
        }
        Ok(BufferRef::new(Buffer {
            source_class,
            destination_class,
            references: AtomicU32::new(1),
            elements: elements.into_iter().map(Element::External).collect(),
            data: Box::default(),
            discard_config: AtomicBool::new(false),
            in_transit: AtomicBool::new(false),
            release: Mutex::new(release),
        }))
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        let max_buffers = self.config.max_buffers;
        self.stats
            .live_buffers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max_buffers).then_some(n + 1))
            .map_err(|_| VmiopError::Resource)?;
        let max_bytes = self.config.max_bytes;
        let reserved = self.stats.live_bytes.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            n.checked_add(bytes).filter(|&total| total <= max_bytes)
        });
        if reserved.is_err() {
            self.stats.live_buffers.fetch_sub(1, Ordering::AcqRel);
            return Err(VmiopError::Resource);
        }
        Ok(())
    }

    fn unreserve(&self, bytes: u64) {
        self.stats.live_buffers.fetch_sub(1, Ordering::AcqRel);
        self.stats.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn live_buffers(&self) -> u32 {
        self.stats.live_buffers.load(Ordering::Acquire)
    }

    pub fn live_bytes(&self) -> u64 {
        self.stats.live_bytes.load(Ordering::Acquire)
    }

    pub fn allocations(&self) -> u64 {
        self.stats.allocations.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.stats.releases.load(Ordering::Relaxed)
    }
}


impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}
