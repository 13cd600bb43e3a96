//! CPU backend: device memory is host memory, so staging is a no-op.

use std::sync::Arc;

use super::{DeviceInterface, DeviceOptions, DeviceType};
use super::{MemoryTracker, Stream};

#[derive(Debug)]
pub struct CpuDevice {
    stream: Arc<Stream>,
    memory: Arc<MemoryTracker>,
}

impl CpuDevice {
    pub fn new(options: &DeviceOptions) -> Self {
        Self {
            stream: Arc::new(Stream::new(DeviceType::Cpu)),
            memory: Arc::new(MemoryTracker::new(options.memory_limit_bytes)),
        }
    }
}

impl DeviceInterface for CpuDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    fn memory(&self) -> &Arc<MemoryTracker> {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::TokenMask;

    #[test]
    fn cpu_mask_merge() {
        let dev: Arc<dyn DeviceInterface> = Arc::new(CpuDevice::new(&DeviceOptions::default()));
        let logits = dev.upload(&[0.5f32, 1.5, 2.5]).unwrap();
        let mask = dev
            .upload(TokenMask::from_allowed(3, [1]).words())
            .unwrap();
        dev.apply_mask(&logits, &mask, 3).unwrap();
        assert_eq!(logits.to_cpu(), vec![f32::NEG_INFINITY, 1.5, f32::NEG_INFINITY]);
    }

    #[test]
    fn cpu_mask_rejects_bad_shapes() {
        let dev: Arc<dyn DeviceInterface> = Arc::new(CpuDevice::new(&DeviceOptions::default()));
        let logits = dev.allocate::<f32>(7).unwrap();
        let mask = dev.allocate::<u32>(1).unwrap();
        assert!(dev.apply_mask(&logits, &mask, 3).is_err());
        let logits = dev.allocate::<f32>(6).unwrap();
        assert!(dev.apply_mask(&logits, &mask, 3).is_err());
    }

    #[test]
    fn mask_from_another_stream_is_rejected() {
        let dev: Arc<dyn DeviceInterface> = Arc::new(CpuDevice::new(&DeviceOptions::default()));
        let other: Arc<dyn DeviceInterface> = Arc::new(CpuDevice::new(&DeviceOptions::default()));
        let logits = dev.upload(&[0.5f32, 1.5, 2.5]).unwrap();
        let mask = other
            .upload(TokenMask::from_allowed(3, [1]).words())
            .unwrap();
        assert!(matches!(
            dev.apply_mask(&logits, &mask, 3),
            Err(crate::errors::GenError::InvalidArgument(_))
        ));
        assert_eq!(logits.to_cpu(), vec![0.5, 1.5, 2.5]);
    }
}
