//! Process-wide runtime state.
//!
//! One lazily created execution environment and one device interface per
//! [`DeviceType`]. Read by every generator; mutated only by [`shutdown`], after which
//! every runtime access fails with [`GenError::SessionTerminated`].

use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, info};

use crate::device::{create_device, DeviceInterface, DeviceOptions, DeviceType};
use crate::errors::{GenError, Result};

/// Handle to the external execution environment.
#[derive(Debug)]
pub struct EngineEnv {
    created_at: Instant,
}

impl EngineEnv {
    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Shared runtime: the environment plus per-device interfaces, created on first use.
#[derive(Debug)]
pub struct RuntimeGlobals {
    env: EngineEnv,
    devices: [OnceLock<Arc<dyn DeviceInterface>>; 4],
    device_options: Mutex<[DeviceOptions; 4]>,
}

impl RuntimeGlobals {
    fn new() -> Self {
        info!("runtime environment initialized");
        Self {
            env: EngineEnv {
                created_at: Instant::now(),
            },
            devices: Default::default(),
            device_options: Mutex::new(Default::default()),
        }
    }

    pub fn env(&self) -> &EngineEnv {
        &self.env
    }

    /// The shared interface for `device_type`, created on first request.
    pub fn device(&self, device_type: DeviceType) -> Arc<dyn DeviceInterface> {
        let slot = &self.devices[device_type.index()];
        Arc::clone(slot.get_or_init(|| {
            let options = self
                .device_options
                .lock()
                .unwrap_or_else(PoisonError::into_inner)[device_type.index()]
                .clone();
            debug!(device = %device_type, limit = ?options.memory_limit_bytes, "creating device interface");
            create_device(device_type, &options)
        }))
    }

    /// Set allocator options used when `device_type`'s interface is first created.
    /// Fails with InvalidState once that interface exists.
    pub fn configure_device(&self, device_type: DeviceType, options: DeviceOptions) -> Result<()> {
        if self.devices[device_type.index()].get().is_some() {
            return Err(GenError::InvalidState(format!(
                "device {} already initialized",
                device_type
            )));
        }
        self.device_options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[device_type.index()] = options;
        Ok(())
    }
}

enum GlobalState {
    Uninitialized,
    Live(Arc<RuntimeGlobals>),
    ShutDown,
}

static GLOBALS: RwLock<GlobalState> = RwLock::new(GlobalState::Uninitialized);

/// The process-wide runtime, initializing it on first call.
pub fn globals() -> Result<Arc<RuntimeGlobals>> {
    {
        let state = GLOBALS.read().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            GlobalState::Live(g) => return Ok(Arc::clone(g)),
            GlobalState::ShutDown => return Err(GenError::SessionTerminated),
            GlobalState::Uninitialized => {}
        }
    }
    let mut state = GLOBALS.write().unwrap_or_else(PoisonError::into_inner);
    match &*state {
        GlobalState::Live(g) => Ok(Arc::clone(g)),
        GlobalState::ShutDown => Err(GenError::SessionTerminated),
        GlobalState::Uninitialized => {
            let g = Arc::new(RuntimeGlobals::new());
            *state = GlobalState::Live(Arc::clone(&g));
            Ok(g)
        }
    }
}

/// Shared device interface for `device_type`.
pub fn device(device_type: DeviceType) -> Result<Arc<dyn DeviceInterface>> {
    Ok(globals()?.device(device_type))
}

/// True once [`shutdown`] has run.
pub fn is_shut_down() -> bool {
    matches!(
        *GLOBALS.read().unwrap_or_else(PoisonError::into_inner),
        GlobalState::ShutDown
    )
}

/// Tear down the runtime. Must not be called while any generator is active; all
/// later runtime access fails with [`GenError::SessionTerminated`].
pub fn shutdown() {
    let mut state = GLOBALS.write().unwrap_or_else(PoisonError::into_inner);
    if let GlobalState::Live(g) = &*state {
        info!(uptime_ms = g.env.uptime().as_millis() as u64, "runtime shut down");
    }
    *state = GlobalState::ShutDown;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_interfaces_are_shared() {
        let a = device(DeviceType::Cpu).unwrap();
        let b = device(DeviceType::Cpu).unwrap();
        assert_eq!(a.stream().id(), b.stream().id());
        assert!(!is_shut_down());
    }

    #[test]
    fn configure_after_creation_is_rejected() {
        let g = globals().unwrap();
        let _ = g.device(DeviceType::WebGpu);
        assert!(g
            .configure_device(DeviceType::WebGpu, DeviceOptions::default())
            .is_err());
    }
}
