//! Captured-graph slots.
//!
//! A captured graph replays a fixed sequence of device work, so its input and output
//! buffers must stay at the same addresses for every step. Each slot holds those static
//! buffers for one maximum batch size; generators borrow a slot for their lifetime and
//! hand it back to the model's pool on drop, so the next generator reuses the capture.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::device::{DeviceInterface, DeviceSpan};
use crate::errors::{GenError, Result};

struct GraphSlot {
    max_batch_size: usize,
    vocab_size: usize,
    stream_id: u64,
    input_ids: DeviceSpan<i32>,
    logits: DeviceSpan<f32>,
}

/// Per-model pool of captured-graph slots keyed by max batch size.
#[derive(Default)]
pub struct CapturedGraphPool {
    free: Mutex<HashMap<usize, Vec<GraphSlot>>>,
    captures: AtomicUsize,
    largest_captured: AtomicUsize,
}

impl fmt::Debug for CapturedGraphPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedGraphPool")
            .field("captures", &self.captures())
            .field("largest_captured", &self.largest_captured())
            .finish()
    }
}

impl CapturedGraphPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of graphs captured so far (slot reuse does not count).
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::Acquire)
    }

    pub fn largest_captured(&self) -> usize {
        self.largest_captured.load(Ordering::Acquire)
    }

    /// Borrow a slot for `max_batch_size` rows on `device`, capturing a new one when
    /// none is free.
    pub fn acquire(
        self: &Arc<Self>,
        device: &Arc<dyn DeviceInterface>,
        max_batch_size: usize,
        vocab_size: usize,
    ) -> Result<CapturedGraph> {
        let stream_id = device.stream().id();
        let reused = {
            let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
            free.get_mut(&max_batch_size).and_then(|slots| {
                slots
                    .iter()
                    .position(|s| s.stream_id == stream_id && s.vocab_size == vocab_size)
                    .map(|i| slots.swap_remove(i))
            })
        };

        let slot = match reused {
            Some(slot) => {
                debug!(max_batch_size, "reusing captured graph");
                slot
            }
            None => {
                let slot = GraphSlot {
                    max_batch_size,
                    vocab_size,
                    stream_id,
                    input_ids: device.allocate::<i32>(max_batch_size)?,
                    logits: device.allocate::<f32>(max_batch_size * vocab_size)?,
                };
                self.captures.fetch_add(1, Ordering::AcqRel);
                self.largest_captured
                    .fetch_max(max_batch_size, Ordering::AcqRel);
                debug!(max_batch_size, device = %device.device_type(), "graph captured");
                slot
            }
        };

        Ok(CapturedGraph {
            slot: Some(slot),
            pool: Arc::clone(self),
        })
    }

    fn release(&self, slot: GraphSlot) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(slot.max_batch_size)
            .or_default()
            .push(slot);
    }
}

/// A borrowed graph slot; returned to its pool on drop.
pub struct CapturedGraph {
    slot: Option<GraphSlot>,
    pool: Arc<CapturedGraphPool>,
}

impl fmt::Debug for CapturedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedGraph")
            .field("max_batch_size", &self.max_batch_size())
            .finish()
    }
}

impl CapturedGraph {
    fn slot(&self) -> Result<&GraphSlot> {
        self.slot
            .as_ref()
            .ok_or_else(|| GenError::invalid_state("captured graph already released"))
    }

    pub fn max_batch_size(&self) -> usize {
        self.slot.as_ref().map_or(0, |s| s.max_batch_size)
    }

    /// Static input buffer, narrowed to `len` ids.
    pub fn input_ids(&self, len: usize) -> Result<DeviceSpan<i32>> {
        self.slot()?.input_ids.subspan(0, len)
    }

    /// Static logits buffer, narrowed to `len` scores.
    pub fn logits(&self, len: usize) -> Result<DeviceSpan<f32>> {
        self.slot()?.logits.subspan(0, len)
    }
}

impl Drop for CapturedGraph {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{create_device, DeviceOptions, DeviceType};

    #[test]
    fn slots_are_recycled_per_batch_size() {
        let device = create_device(DeviceType::Cuda, &DeviceOptions::default());
        let pool = Arc::new(CapturedGraphPool::new());

        let a = pool.acquire(&device, 4, 16).unwrap();
        let b = pool.acquire(&device, 4, 16).unwrap();
        assert_eq!(pool.captures(), 2);
        drop(a);
        let c = pool.acquire(&device, 4, 16).unwrap();
        assert_eq!(pool.captures(), 2);
        let _d = pool.acquire(&device, 8, 16).unwrap();
        assert_eq!(pool.captures(), 3);
        assert_eq!(pool.largest_captured(), 8);

        assert_eq!(c.logits(32).unwrap().len(), 32);
        assert!(c.input_ids(5).is_err());
        drop(b);
    }
}
