//! Completion fences
//!
//! Every context owns one host-visible page holding a 16-byte record per
//! engine. The GPU writes the sequence number of the last completed job into
//! the engine's record; the CPU keeps the last issued number per engine.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use crate::memory::MappedBacking;
use crate::platform::{BufferHandle, MapTechnique, Platform, VspaceHandle, PAGE_SIZE};
use crate::Result;

/// Number of per-engine fences
pub const FENCE_COUNT: usize = 4;

/// Distance between two engine records in the fence page
pub const FENCE_STRIDE: u64 = 16;

/// Engine owning a fence slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Compute = 0,
    /// Memory-to-memory copy
    M2mf = 1,
    Pcopy0 = 2,
    Pcopy1 = 3,
}

impl Engine {
    pub const ALL: [Engine; FENCE_COUNT] =
        [Engine::Compute, Engine::M2mf, Engine::Pcopy0, Engine::Pcopy1];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Fence page of a context
pub struct Fence {
    backing: MappedBacking,
    sequence: [AtomicU32; FENCE_COUNT],
}

impl Fence {
    pub(crate) fn new(platform: &Arc<dyn Platform>, vspace: VspaceHandle) -> Result<Self> {
        let backing = MappedBacking::new(platform, vspace, PAGE_SIZE, MapTechnique::SinglePage)?;

        let fence = Self {
            backing,
            sequence: Default::default(),
        };
        for engine in Engine::ALL {
            unsafe { core::ptr::write_volatile(fence.record(engine), 0) };
        }

        Ok(fence)
    }

    fn record(&self, engine: Engine) -> *mut u32 {
        let page = self.backing.ptr().as_ptr();
        unsafe { page.add(engine.slot() * FENCE_STRIDE as usize).cast::<u32>() }
    }

    /// GPU address of the fence page
    pub fn address(&self) -> u64 {
        self.backing.gpu_addr()
    }

    /// GPU address of an engine's record
    pub fn gpu_address(&self, engine: Engine) -> u64 {
        self.address() + engine.slot() as u64 * FENCE_STRIDE
    }

    /// Platform buffer of the fence page
    pub fn buffer(&self) -> BufferHandle {
        self.backing.buffer()
    }

    /// Last issued sequence number
    pub fn sequence(&self, engine: Engine) -> u32 {
        self.sequence[engine.slot()].load(Ordering::Acquire)
    }

    /// All issued sequence numbers
    pub fn sequences(&self) -> [u32; FENCE_COUNT] {
        Engine::ALL.map(|engine| self.sequence(engine))
    }

    /// Issue the next sequence number for `engine`
    pub fn next_sequence(&self, engine: Engine) -> u32 {
        self.sequence[engine.slot()].fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Sequence number the GPU reported as completed
    pub fn completed(&self, engine: Engine) -> u32 {
        let value = unsafe { core::ptr::read_volatile(self.record(engine)) };
        fence(Ordering::Acquire);
        value
    }
}
