//! Accelerator backends (CUDA, DirectML, WebGPU).
//!
//! Device allocations live behind the buffer's device lock and are only reachable from
//! the host through explicit staging ([`DeviceSpan::to_cpu`],
//! [`DeviceSpan::with_cpu_mut`]). Kernels such as the mask merge run directly on device
//! memory and are issued on the device stream.

use std::sync::Arc;

use tracing::debug;

use super::{DeviceInterface, DeviceOptions, DeviceType};
use super::{MemoryTracker, Stream};

#[derive(Debug)]
pub struct AcceleratorDevice {
    device_type: DeviceType,
    stream: Arc<Stream>,
    memory: Arc<MemoryTracker>,
}

impl AcceleratorDevice {
    /// `device_type` must not be [`DeviceType::Cpu`]; use [`super::CpuDevice`] for that.
    pub fn new(device_type: DeviceType, options: &DeviceOptions) -> Self {
        debug_assert_ne!(device_type, DeviceType::Cpu);
        let stream = Arc::new(Stream::new(device_type));
        debug!(device = %device_type, stream = stream.id(), "accelerator stream created");
        Self {
            device_type,
            stream,
            memory: Arc::new(MemoryTracker::new(options.memory_limit_bytes)),
        }
    }
}

impl DeviceInterface for AcceleratorDevice {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    fn memory(&self) -> &Arc<MemoryTracker> {
        &self.memory
    }

    fn supports_graph_capture(&self) -> bool {
        matches!(self.device_type, DeviceType::Cuda | DeviceType::Dml)
    }

    fn supports_continuous_decoding(&self) -> bool {
        self.device_type != DeviceType::Dml
    }

    fn has_peer_copy(&self) -> bool {
        self.device_type == DeviceType::Cuda
    }
}
