//! Device buffers and bounds-checked spans over them.
//!
//! A [`DeviceBuffer`] owns one contiguous allocation on a device stream. Accelerator
//! buffers also carry a host staging copy that is filled on demand, the way
//! pinned staging memory sits next to a device allocation. A [`DeviceSpan`] is a
//! cheap, cloneable view of a sub-range that keeps its buffer alive.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::DeviceType;
use crate::errors::{GenError, Result};

/// Scalar element types a device buffer may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    I32,
    I64,
    U32,
    U8,
}

impl ElementType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 | ElementType::U32 => 4,
            ElementType::I64 => 8,
            ElementType::U8 => 1,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::F32 => "f32",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::U32 => "u32",
            ElementType::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Element types storable in a [`DeviceBuffer`]. Every element type is plain old
/// data, so any buffer can be viewed as raw bytes for staging and copies.
pub trait Element: bytemuck::Pod + Send + Sync + fmt::Debug + 'static {
    const ELEMENT_TYPE: ElementType;
}

impl Element for f32 {
    const ELEMENT_TYPE: ElementType = ElementType::F32;
}
impl Element for i32 {
    const ELEMENT_TYPE: ElementType = ElementType::I32;
}
impl Element for i64 {
    const ELEMENT_TYPE: ElementType = ElementType::I64;
}
impl Element for u32 {
    const ELEMENT_TYPE: ElementType = ElementType::U32;
}
impl Element for u8 {
    const ELEMENT_TYPE: ElementType = ElementType::U8;
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// A compute stream. Device work is issued against a stream and is only
/// guaranteed complete after [`Stream::synchronize`].
#[derive(Debug)]
pub struct Stream {
    id: u64,
    device_type: DeviceType,
    pending: AtomicUsize,
}

impl Stream {
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            device_type,
            pending: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Record one asynchronous operation issued on this stream.
    pub(crate) fn enqueue(&self) {
        if self.device_type != DeviceType::Cpu {
            self.pending.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Number of issued operations not yet waited on.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Block until all work issued on this stream has completed.
    pub fn synchronize(&self) {
        let drained = self.pending.swap(0, Ordering::AcqRel);
        if drained > 0 {
            trace!(stream = self.id, device = %self.device_type, drained, "stream synchronized");
        }
    }
}

/// Byte accounting for one device allocator.
#[derive(Debug)]
pub struct MemoryTracker {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl MemoryTracker {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub(crate) fn reserve(self: &Arc<Self>, bytes: usize) -> Result<Reservation> {
        let limit = self.limit.unwrap_or(usize::MAX);
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= limit)
            })
            .map_err(|used| GenError::OutOfMemory {
                requested: bytes,
                available: limit.saturating_sub(used),
            })?;
        Ok(Reservation {
            tracker: Arc::clone(self),
            bytes,
        })
    }
}

/// Bytes held against a [`MemoryTracker`]; released on drop.
#[derive(Debug)]
pub(crate) struct Reservation {
    tracker: Arc<MemoryTracker>,
    bytes: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.tracker.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// One contiguous allocation on a device stream.
pub struct DeviceBuffer<T: Element> {
    stream: Arc<Stream>,
    device: RwLock<Vec<T>>,
    /// Host staging copy; never allocated for CPU buffers.
    host: Mutex<Option<Vec<T>>>,
    _reservation: Reservation,
}

impl<T: Element> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.stream.device_type())
            .field("stream", &self.stream.id())
            .field("element", &T::ELEMENT_TYPE)
            .field("len", &self.len())
            .finish()
    }
}

impl<T: Element> DeviceBuffer<T> {
    pub(crate) fn zeroed(
        stream: Arc<Stream>,
        tracker: &Arc<MemoryTracker>,
        count: usize,
    ) -> Result<Self> {
        let bytes = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| GenError::invalid_argument("allocation size overflows usize"))?;
        let reservation = tracker.reserve(bytes)?;
        let mut data: Vec<T> = Vec::new();
        data.try_reserve_exact(count)
            .map_err(|_| GenError::OutOfMemory {
                requested: bytes,
                available: 0,
            })?;
        data.resize(count, T::zeroed());
        Ok(Self {
            stream,
            device: RwLock::new(data),
            host: Mutex::new(None),
            _reservation: reservation,
        })
    }

    pub(crate) fn adopt(stream: Arc<Stream>, tracker: &Arc<MemoryTracker>, data: Vec<T>) -> Result<Self> {
        let reservation = tracker.reserve(std::mem::size_of_val(data.as_slice()))?;
        Ok(Self {
            stream,
            device: RwLock::new(data),
            host: Mutex::new(None),
            _reservation: reservation,
        })
    }

    pub fn len(&self) -> usize {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device_type(&self) -> DeviceType {
        self.stream.device_type()
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }
}

/// Bounds-checked view over `len` elements of a [`DeviceBuffer`] starting at `begin`.
pub struct DeviceSpan<T: Element> {
    buffer: Arc<DeviceBuffer<T>>,
    begin: usize,
    len: usize,
}

impl<T: Element> Clone for DeviceSpan<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            begin: self.begin,
            len: self.len,
        }
    }
}

impl<T: Element> fmt::Debug for DeviceSpan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSpan")
            .field("device", &self.device_type())
            .field("element", &T::ELEMENT_TYPE)
            .field("begin", &self.begin)
            .field("len", &self.len)
            .finish()
    }
}

impl<T: Element> DeviceSpan<T> {
    pub(crate) fn whole(buffer: Arc<DeviceBuffer<T>>) -> Self {
        let len = buffer.len();
        Self {
            buffer,
            begin: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    pub fn element_type(&self) -> ElementType {
        T::ELEMENT_TYPE
    }

    pub fn device_type(&self) -> DeviceType {
        self.buffer.device_type()
    }

    pub fn stream(&self) -> &Arc<Stream> {
        self.buffer.stream()
    }

    /// True when both spans view the same allocation.
    pub fn shares_buffer_with(&self, other: &DeviceSpan<T>) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Narrow this span to `len` elements starting at `begin` (relative to this span).
    pub fn subspan(&self, begin: usize, len: usize) -> Result<DeviceSpan<T>> {
        match begin.checked_add(len) {
            Some(end) if end <= self.len => Ok(Self {
                buffer: Arc::clone(&self.buffer),
                begin: self.begin + begin,
                len,
            }),
            _ => Err(GenError::InvalidArgument(format!(
                "subspan [{}, {}+{}) out of bounds for span of length {}",
                begin, begin, len, self.len
            ))),
        }
    }

    /// Copy the viewed elements to host memory. Synchronizes the stream first.
    pub fn to_cpu(&self) -> Vec<T> {
        self.buffer.stream.synchronize();
        let device = self
            .buffer
            .device
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let region = &device[self.begin..self.begin + self.len];
        if self.device_type() == DeviceType::Cpu {
            return region.to_vec();
        }
        let mut host = self
            .buffer
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let staging = host.get_or_insert_with(|| vec![T::zeroed(); device.len()]);
        staging[self.begin..self.begin + self.len].copy_from_slice(region);
        staging[self.begin..self.begin + self.len].to_vec()
    }

    /// Overwrite the viewed elements with host data of exactly the same length.
    pub fn copy_from_cpu(&self, src: &[T]) -> Result<()> {
        if src.len() != self.len {
            return Err(GenError::InvalidArgument(format!(
                "host source has {} elements, span has {}",
                src.len(),
                self.len
            )));
        }
        self.with_device_mut(|dst| dst.copy_from_slice(src));
        Ok(())
    }

    /// Stage the viewed elements on the host, let `f` mutate them, and write them back.
    pub fn with_cpu_mut<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> R {
        if self.device_type() == DeviceType::Cpu {
            return self.with_device_mut(f);
        }
        let mut staged = self.to_cpu();
        let out = f(&mut staged);
        self.with_device_mut(|dst| dst.copy_from_slice(&staged));
        out
    }

    /// Set every viewed element to `value` on the device.
    pub fn fill(&self, value: T) {
        self.with_device_mut(|dst| dst.fill(value));
    }

    /// Device-side read access. Used by kernels; does not stage through host memory.
    pub(crate) fn with_device<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let device = self
            .buffer
            .device
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&device[self.begin..self.begin + self.len])
    }

    /// Device-side write access. Counts as work issued on the buffer's stream.
    pub(crate) fn with_device_mut<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> R {
        let mut device = self
            .buffer
            .device
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.buffer.stream.enqueue();
        f(&mut device[self.begin..self.begin + self.len])
    }

    pub(crate) fn allocation_id(&self) -> *const () {
        Arc::as_ptr(&self.buffer) as *const ()
    }

    /// Offset of this view into its allocation, in bytes.
    pub(crate) fn byte_offset(&self) -> usize {
        self.begin * std::mem::size_of::<T>()
    }

    /// Byte access to the whole underlying allocation.
    pub(crate) fn with_allocation_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut device = self
            .buffer
            .device
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.buffer.stream.enqueue();
        f(bytemuck::cast_slice_mut(device.as_mut_slice()))
    }

    /// Raw byte view of the viewed elements (device side).
    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.with_device(|elems| f(bytemuck::cast_slice(elems)))
    }

    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.with_device_mut(|elems| f(bytemuck::cast_slice_mut(elems)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_span(data: Vec<i32>) -> DeviceSpan<i32> {
        let stream = Arc::new(Stream::new(DeviceType::Cpu));
        let tracker = Arc::new(MemoryTracker::new(None));
        DeviceSpan::whole(Arc::new(DeviceBuffer::adopt(stream, &tracker, data).unwrap()))
    }

    #[test]
    fn subspan_bounds_checked() {
        let span = cpu_span(vec![1, 2, 3, 4]);
        let sub = span.subspan(1, 2).unwrap();
        assert_eq!(sub.to_cpu(), vec![2, 3]);
        assert!(span.subspan(3, 2).is_err());
        assert!(span.subspan(usize::MAX, 2).is_err());
        assert!(sub.subspan(0, 3).is_err());
    }

    #[test]
    fn tracker_enforces_limit_and_releases() {
        let stream = Arc::new(Stream::new(DeviceType::Cuda));
        let tracker = Arc::new(MemoryTracker::new(Some(64)));
        let a = DeviceBuffer::<f32>::zeroed(Arc::clone(&stream), &tracker, 8).unwrap();
        assert_eq!(tracker.used(), 32);
        let err = DeviceBuffer::<f32>::zeroed(Arc::clone(&stream), &tracker, 16).unwrap_err();
        assert!(matches!(err, GenError::OutOfMemory { requested: 64, available: 32 }));
        drop(a);
        assert_eq!(tracker.used(), 0);
        assert!(DeviceBuffer::<f32>::zeroed(stream, &tracker, 16).is_ok());
    }

    #[test]
    fn accelerator_reads_synchronize_stream() {
        let stream = Arc::new(Stream::new(DeviceType::Cuda));
        let tracker = Arc::new(MemoryTracker::new(None));
        let span = DeviceSpan::whole(Arc::new(
            DeviceBuffer::<u32>::zeroed(Arc::clone(&stream), &tracker, 4).unwrap(),
        ));
        span.fill(7);
        assert_eq!(stream.pending(), 1);
        assert_eq!(span.to_cpu(), vec![7; 4]);
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn with_cpu_mut_writes_back() {
        let stream = Arc::new(Stream::new(DeviceType::WebGpu));
        let tracker = Arc::new(MemoryTracker::new(None));
        let span = DeviceSpan::whole(Arc::new(
            DeviceBuffer::adopt(stream, &tracker, vec![1.0f32, 2.0, 3.0]).unwrap(),
        ));
        span.subspan(1, 2)
            .unwrap()
            .with_cpu_mut(|v| v.iter_mut().for_each(|x| *x *= 10.0));
        assert_eq!(span.to_cpu(), vec![1.0, 20.0, 30.0]);
    }
}
