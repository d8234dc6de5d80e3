//! Execution contexts
//!
//! A context is one GPU command channel together with everything the channel
//! needs to run: an indirect buffer ring, a push buffer ring, the FIFO
//! registration, the FIFO control registers and a fence page.
//!
//! Construction acquires these in a fixed order:
//!
//! 1. channel
//! 2. indirect buffer ring
//! 3. push buffer ring
//! 4. FIFO registration of the IB
//! 5. FIFO register view
//! 6. fence page
//! 7. backend per-context init
//!
//! Each acquired resource is a guard local to [`Context::with_config`]; an
//! early return drops the guards in reverse order, so a failed step leaves
//! nothing behind.

use std::mem::ManuallyDrop;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::device::DeviceHandle;
use crate::fence::Fence;
use crate::platform::{Channel, ChannelHandle, RegisterView, VspaceHandle};
use crate::ring::{IndirectRing, PushRing};
use crate::vas::{Vas, VasShared};
use crate::{Error, Result};

/// Default IB order (512 entries)
pub const DEFAULT_IB_ORDER: u32 = 9;

/// Default PB order (1 MiB)
pub const DEFAULT_PB_ORDER: u32 = 20;

/// Accepted IB orders
pub const IB_ORDER_RANGE: RangeInclusive<u32> = 1..=16;

/// Accepted PB orders
pub const PB_ORDER_RANGE: RangeInclusive<u32> = 12..=24;

/// Ring sizing of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    /// log2 of the IB entry count
    pub ib_order: u32,
    /// log2 of the PB size in bytes
    pub pb_order: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ib_order: DEFAULT_IB_ORDER,
            pb_order: DEFAULT_PB_ORDER,
        }
    }
}

impl ContextConfig {
    /// Set the IB order
    pub fn ib_order(mut self, order: u32) -> Self {
        self.ib_order = order;
        self
    }

    /// Set the PB order
    pub fn pb_order(mut self, order: u32) -> Self {
        self.pb_order = order;
        self
    }

    /// Check both orders against their accepted ranges
    pub fn validate(&self) -> Result<()> {
        if !IB_ORDER_RANGE.contains(&self.ib_order) || !PB_ORDER_RANGE.contains(&self.pb_order) {
            log::warn!("Invalid ring orders: {:?}", self);
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

/// Resources of a live context, in teardown order
struct Resources {
    fence: Fence,
    pb: PushRing,
    ib: IndirectRing,
    regs: RegisterView,
    channel: Channel,
}

/// GPU execution context
pub struct Context {
    vas: Arc<VasShared>,
    config: ContextConfig,
    resources: ManuallyDrop<Resources>,
}

impl Context {
    /// Create a context with the default ring sizes
    pub fn new(device: &DeviceHandle, vas: &Vas) -> Result<Self> {
        Self::with_config(device, vas, ContextConfig::default())
    }

    /// Create a context bound to `vas`
    pub fn with_config(device: &DeviceHandle, vas: &Vas, config: ContextConfig) -> Result<Self> {
        config.validate()?;
        if !vas.device().same_device(device) {
            log::warn!("VAS {:?} belongs to another device", vas.vspace());
            return Err(Error::InvalidParameter);
        }

        let backend = Arc::clone(device.supported_backend()?);
        let shared = vas.shared();
        let platform = shared.platform();
        let vspace = shared.vspace();

        let mut state = shared.lock();

        crate::step_trace!("ctx: creating channel in {:?}", vspace);
        let channel = Channel::create(platform, vspace)?;

        crate::step_trace!("ctx: IB order {}", config.ib_order);
        let ib = IndirectRing::new(platform, vspace, config.ib_order)?;

        crate::step_trace!("ctx: PB order {}", config.pb_order);
        let pb = PushRing::new(platform, vspace, config.pb_order)?;

        crate::step_trace!("ctx: FIFO init, IB at {:#x}", ib.base());
        platform
            .register_fifo(channel.handle(), ib.base(), ib.order())
            .map_err(|e| {
                log::warn!("FIFO init failed on channel {:?}: {}", channel.handle(), e);
                e
            })?;

        let regs = platform.fifo_registers(channel.handle()).map_err(|e| {
            log::warn!("No FIFO registers for channel {:?}: {}", channel.handle(), e);
            e
        })?;

        crate::step_trace!("ctx: fence page");
        let fence = Fence::new(platform, vspace)?;

        state.contexts += 1;
        drop(state);

        let context = Context {
            vas: Arc::clone(shared),
            config,
            resources: ManuallyDrop::new(Resources {
                fence,
                pb,
                ib,
                regs,
                channel,
            }),
        };

        // Runs unlocked so the backend may allocate in the same VAS.
        if let Err(e) = backend.init_context(&context) {
            log::error!("{}: context init failed: {}", backend.name(), e);
            return Err(e);
        }

        log::info!(
            "gpu{}: context on channel {:?} (IB {:#x}, PB {:#x}, fence {:#x})",
            device.index(),
            context.channel(),
            context.ib().base(),
            context.pb().base(),
            context.fence().address()
        );

        Ok(context)
    }

    /// Destroy the context
    pub fn free(self) {}

    /// Device the context runs on
    pub fn device(&self) -> &DeviceHandle {
        self.vas.device()
    }

    /// Virtual space the context is bound to
    pub fn vspace(&self) -> VspaceHandle {
        self.vas.vspace()
    }

    /// Ring sizing the context was built with
    pub fn config(&self) -> ContextConfig {
        self.config
    }

    /// Platform command channel
    pub fn channel(&self) -> ChannelHandle {
        self.resources.channel.handle()
    }

    /// Indirect buffer ring
    pub fn ib(&self) -> &IndirectRing {
        &self.resources.ib
    }

    /// Indirect buffer ring, for submission
    pub fn ib_mut(&mut self) -> &mut IndirectRing {
        &mut self.resources.ib
    }

    /// Push buffer ring
    pub fn pb(&self) -> &PushRing {
        &self.resources.pb
    }

    /// Push buffer ring, for writing commands
    pub fn pb_mut(&mut self) -> &mut PushRing {
        &mut self.resources.pb
    }

    /// FIFO control registers
    pub fn registers(&self) -> &RegisterView {
        &self.resources.regs
    }

    /// Per-engine completion fences
    pub fn fence(&self) -> &Fence {
        &self.resources.fence
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let mut state = self.vas.lock();
        // SAFETY: resources are never touched again.
        unsafe { ManuallyDrop::drop(&mut self.resources) };
        state.contexts -= 1;
        drop(state);

        log::debug!("Context in {:?} destroyed", self.vas.vspace());
    }
}
