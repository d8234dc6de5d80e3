//! GPU compute resource management
//!
//! Manages virtual address spaces, memory objects mapped into them, and
//! execution contexts owning hardware command rings and completion fences.
//! Everything is built on top of a lower memory/channel subsystem expressed
//! as the [`Platform`] trait; [`sim::SimPlatform`] implements it in software.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gpu_compute::{alloc_host_memory, BackendTable, Context, DeviceRegistry, Platform, Vas};
//! use gpu_compute::sim::{SimConfig, SimPlatform};
//!
//! let registry = DeviceRegistry::new(
//!     vec![Arc::new(SimPlatform::new(SimConfig::default())) as Arc<dyn Platform>],
//!     &BackendTable::with_defaults(),
//! );
//! let device = registry.open(0)?;
//! let vas = Vas::new(&device, 1 << 40)?;
//! let context = Context::new(&device, &vas)?;
//! let mem = alloc_host_memory(&vas, 0x10000)?;
//!
//! mem.free();
//! context.free();
//! vas.free().map_err(|(_, e)| e)?;
//! device.close();
//! # Ok::<(), gpu_compute::Error>(())
//! ```

pub mod backend;
pub mod context;
pub mod device;
mod error;
pub mod fence;
pub mod memory;
pub mod platform;
pub mod ring;
pub mod sim;
pub mod vas;

pub use backend::{BackendTable, ComputeBackend, Generation, QueryParam, QUERY_MP_COUNT};
pub use context::{Context, ContextConfig};
pub use device::{Device, DeviceHandle, DeviceRegistry};
pub use error::{Error, Result};
pub use fence::{Engine, Fence};
pub use memory::{
    alloc_device_memory, alloc_host_memory, free_device_memory, free_host_memory, MemoryObject,
};
pub use platform::{DomainFlags, MapTechnique, Platform};
pub use ring::{IndirectRing, PushRing, RingCursor};
pub use vas::{MemId, MemInfo, Vas};

/// Trace one construction step when `debug-logging` is enabled
#[doc(hidden)]
#[macro_export]
macro_rules! step_trace {
    ($($arg:tt)*) => {
        if cfg!(feature = "debug-logging") {
            log::trace!($($arg)*);
        }
    };
}
