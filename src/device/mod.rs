//! Device memory abstraction.
//!
//! Every backend implements [`DeviceInterface`] once. Generation code only sees the
//! trait object selected from [`DeviceType`] when a generator is built, so the same
//! loop runs over CPU, CUDA, DirectML and WebGPU memory.

pub mod accelerator;
pub mod buffer;
pub mod cpu;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{GenError, Result};
use crate::kernels::{apply_token_mask, words_per_row};
use crate::utils::staging_pool;

pub use accelerator::AcceleratorDevice;
pub use buffer::{DeviceBuffer, DeviceSpan, Element, ElementType, MemoryTracker, Stream};
pub use cpu::CpuDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Cpu,
    Cuda,
    Dml,
    WebGpu,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Cpu,
        DeviceType::Cuda,
        DeviceType::Dml,
        DeviceType::WebGpu,
    ];

    /// Dense index, used for per-device tables.
    pub fn index(self) -> usize {
        match self {
            DeviceType::Cpu => 0,
            DeviceType::Cuda => 1,
            DeviceType::Dml => 2,
            DeviceType::WebGpu => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::Dml => "dml",
            DeviceType::WebGpu => "webgpu",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = GenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" => Ok(DeviceType::Cuda),
            "dml" | "directml" => Ok(DeviceType::Dml),
            "webgpu" => Ok(DeviceType::WebGpu),
            other => Err(GenError::InvalidArgument(format!(
                "unknown device type '{}'",
                other
            ))),
        }
    }
}

/// Per-backend allocator options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceOptions {
    /// Upper bound on live bytes allocated through this device. `None` = unbounded.
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,
}

/// Capability interface implemented once per backend.
pub trait DeviceInterface: Send + Sync + fmt::Debug {
    fn device_type(&self) -> DeviceType;

    /// The compute stream all buffers of this device are bound to.
    fn stream(&self) -> &Arc<Stream>;

    fn memory(&self) -> &Arc<MemoryTracker>;

    /// Block until all work issued on the bound stream completes.
    fn synchronize(&self) -> Result<()> {
        self.stream().synchronize();
        Ok(())
    }

    /// Whether a fixed sequence of device work can be recorded once and replayed.
    fn supports_graph_capture(&self) -> bool {
        false
    }

    /// Whether an existing sequence may be extended with new prompt tokens.
    fn supports_continuous_decoding(&self) -> bool {
        true
    }

    /// Whether buffers on this device can be copied without staging through the host.
    fn has_peer_copy(&self) -> bool {
        false
    }
}

impl dyn DeviceInterface {
    /// Allocate `count` zeroed elements on this device.
    pub fn allocate<T: Element>(&self, count: usize) -> Result<DeviceSpan<T>> {
        let buffer = DeviceBuffer::zeroed(Arc::clone(self.stream()), self.memory(), count)?;
        Ok(DeviceSpan::whole(Arc::new(buffer)))
    }

    /// Adopt an existing allocation as a device span without copying it.
    pub fn wrap_memory<T: Element>(&self, data: Vec<T>) -> Result<DeviceSpan<T>> {
        let buffer = DeviceBuffer::adopt(Arc::clone(self.stream()), self.memory(), data)?;
        Ok(DeviceSpan::whole(Arc::new(buffer)))
    }

    /// Allocate a span and fill it from host memory.
    pub fn upload<T: Element>(&self, data: &[T]) -> Result<DeviceSpan<T>> {
        let span = self.allocate::<T>(data.len())?;
        span.copy_from_cpu(data)?;
        Ok(span)
    }

    /// Copy bytes between spans, directly on the device when both spans live on this
    /// backend and it has peer copy, otherwise staged through host memory.
    pub fn copy<D: Element, S: Element>(
        &self,
        dest: &DeviceSpan<D>,
        begin_dest: usize,
        source: &DeviceSpan<S>,
        begin_source: usize,
        size_in_bytes: usize,
    ) -> Result<()> {
        let local = self.ensure_owns(dest).is_ok() && self.ensure_owns(source).is_ok();
        if !(local && self.has_peer_copy()) {
            return copy_through_host(dest, begin_dest, source, begin_source, size_in_bytes);
        }
        check_byte_range("source", source.size_in_bytes(), begin_source, size_in_bytes)?;
        check_byte_range("destination", dest.size_in_bytes(), begin_dest, size_in_bytes)?;
        if size_in_bytes == 0 {
            return Ok(());
        }
        if dest.allocation_id() == source.allocation_id() {
            let (d, s) = (dest.byte_offset() + begin_dest, source.byte_offset() + begin_source);
            dest.with_allocation_bytes_mut(|bytes| bytes.copy_within(s..s + size_in_bytes, d));
        } else {
            source.with_bytes(|src| {
                dest.with_bytes_mut(|dst| {
                    dst[begin_dest..begin_dest + size_in_bytes]
                        .copy_from_slice(&src[begin_source..begin_source + size_in_bytes])
                })
            });
        }
        Ok(())
    }

    /// Set logits of tokens whose mask bit is clear to negative infinity, on the
    /// device stream.
    ///
    /// `logits` is `[rows, vocab_size]`; `mask` is `[rows, vocab_size.div_ceil(32)]`
    /// little-endian bit words. Both spans must be owned by this device.
    pub fn apply_mask(
        &self,
        logits: &DeviceSpan<f32>,
        mask: &DeviceSpan<u32>,
        vocab_size: usize,
    ) -> Result<()> {
        self.ensure_owns(logits)?;
        self.ensure_owns(mask)?;
        check_mask_shape(logits, mask, vocab_size)?;
        mask.with_device(|words| {
            logits.with_device_mut(|scores| apply_token_mask(scores, words, vocab_size))
        });
        Ok(())
    }

    /// Fail fast when `span` does not belong to this device's stream.
    pub fn ensure_owns<T: Element>(&self, span: &DeviceSpan<T>) -> Result<()> {
        ensure_same_device(self.device_type(), span)?;
        if span.stream().id() != self.stream().id() {
            return Err(GenError::InvalidArgument(format!(
                "span is bound to stream {} but device {} uses stream {}",
                span.stream().id(),
                self.device_type(),
                self.stream().id()
            )));
        }
        Ok(())
    }
}

fn check_mask_shape(
    logits: &DeviceSpan<f32>,
    mask: &DeviceSpan<u32>,
    vocab_size: usize,
) -> Result<()> {
    if vocab_size == 0 || logits.len() % vocab_size != 0 {
        return Err(GenError::InvalidArgument(format!(
            "logits length {} is not a multiple of vocab size {}",
            logits.len(),
            vocab_size
        )));
    }
    let rows = logits.len() / vocab_size;
    if mask.len() != rows * words_per_row(vocab_size) {
        return Err(GenError::InvalidArgument(format!(
            "mask has {} words, expected {} for {} rows",
            mask.len(),
            rows * words_per_row(vocab_size),
            rows
        )));
    }
    Ok(())
}

fn ensure_same_device<T: Element>(
    expected: DeviceType,
    span: &DeviceSpan<T>,
) -> Result<()> {
    if span.device_type() != expected {
        return Err(GenError::DeviceMismatch {
            expected,
            actual: span.device_type(),
        });
    }
    Ok(())
}

/// Construct the backend for `device_type`.
pub fn create_device(device_type: DeviceType, options: &DeviceOptions) -> Arc<dyn DeviceInterface> {
    match device_type {
        DeviceType::Cpu => Arc::new(CpuDevice::new(options)),
        accel => Arc::new(AcceleratorDevice::new(accel, options)),
    }
}

/// Copy `size_in_bytes` bytes between two spans by staging through host memory.
///
/// Offsets are byte offsets into each span. Spans may live on different devices and
/// hold different element types; both streams are synchronized before the read.
pub fn copy_through_host<D: Element, S: Element>(
    dest: &DeviceSpan<D>,
    begin_dest: usize,
    source: &DeviceSpan<S>,
    begin_source: usize,
    size_in_bytes: usize,
) -> Result<()> {
    check_byte_range("source", source.size_in_bytes(), begin_source, size_in_bytes)?;
    check_byte_range("destination", dest.size_in_bytes(), begin_dest, size_in_bytes)?;
    if size_in_bytes == 0 {
        return Ok(());
    }

    source.stream().synchronize();
    dest.stream().synchronize();

    let mut staging = staging_pool::acquire(size_in_bytes);
    source.with_bytes(|bytes| {
        staging.copy_from_slice(&bytes[begin_source..begin_source + size_in_bytes])
    });
    dest.with_bytes_mut(|bytes| {
        bytes[begin_dest..begin_dest + size_in_bytes].copy_from_slice(&staging)
    });
    staging_pool::release(staging);
    Ok(())
}

fn check_byte_range(what: &str, span_bytes: usize, begin: usize, size: usize) -> Result<()> {
    match begin.checked_add(size) {
        Some(end) if end <= span_bytes => Ok(()),
        _ => Err(GenError::InvalidArgument(format!(
            "{} byte range [{}, {}+{}) exceeds span of {} bytes",
            what, begin, begin, size, span_bytes
        ))),
    }
}
