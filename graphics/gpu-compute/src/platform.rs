//! Memory/channel platform interface
//!
//! The compute layer never allocates GPU memory or channels itself; it drives
//! a [`Platform`] that owns buffer objects, virtual spaces and FIFO channels.
//! Every platform resource the layer acquires is held by a scoped guard in
//! this module, so dropping the guard releases it. Constructors that acquire
//! several resources in sequence rely on reverse drop order for rollback.

use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::{Error, Result};

/// CPU page size
pub const PAGE_SIZE: u64 = 4096;

/// Start of the user window of every address space
pub const VAS_USER_START: u64 = 0x2000_0000;

/// End of the user window of every address space
pub const VAS_USER_END: u64 = 1 << 40;

/// Range every buffer is mapped into
pub const VAS_USER_RANGE: Range<u64> = VAS_USER_START..VAS_USER_END;

bitflags! {
    /// Memory domain flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DomainFlags: u32 {
        /// Buffer lives in device memory
        const DEVICE_LOCAL = 1 << 0;
        /// Buffer is CPU accessible
        const HOST_VISIBLE = 1 << 1;
        /// CPU accesses are snooped by the GPU
        const SNOOPED = 1 << 2;
    }
}

impl DomainFlags {
    /// Device memory, small pages
    pub const VRAM: Self = Self::DEVICE_LOCAL;
    /// Snooped system memory
    pub const SYSRAM_SNOOP: Self = Self::HOST_VISIBLE.union(Self::SNOOPED);

    /// The CPU can map buffers of this domain
    pub fn is_host_visible(&self) -> bool {
        self.contains(DomainFlags::HOST_VISIBLE)
    }
}

/// Platform buffer object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

/// Platform virtual space handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VspaceHandle(pub u32);

/// Platform FIFO channel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u32);

/// Parameters answered by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformParam {
    /// Number of multiprocessors
    MpCount,
}

/// CPU mapping technique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapTechnique {
    /// Map the first page only
    SinglePage,
    /// Map every page into a contiguous window
    MultiPage,
}

impl MapTechnique {
    /// Technique used for a buffer of `size` bytes
    pub fn for_size(size: u64) -> Self {
        if size > PAGE_SIZE {
            MapTechnique::MultiPage
        } else {
            MapTechnique::SinglePage
        }
    }
}

/// Lower memory/channel subsystem
///
/// Release operations cannot fail. Views returned by the mapping primitives
/// cover the bytes actually backed by the mapping, must be page aligned and
/// stay valid until the matching unmap.
pub trait Platform: Send + Sync {
    /// Chipset identifier of the GPU behind this platform
    fn chipset(&self) -> u32;

    /// Allocate a buffer object
    fn allocate_buffer(&self, size: u64, flags: DomainFlags) -> Result<BufferHandle>;

    /// Release a buffer object
    fn free_buffer(&self, buffer: BufferHandle);

    /// Create a virtual space of `size` bytes
    fn vspace_new(&self, size: u64) -> Result<VspaceHandle>;

    /// Drop one reference to a virtual space
    fn vspace_unref(&self, vspace: VspaceHandle);

    /// Map a buffer somewhere inside `range`, returning its GPU address
    fn map_into_range(
        &self,
        vspace: VspaceHandle,
        buffer: BufferHandle,
        range: Range<u64>,
    ) -> Result<u64>;

    /// Remove the mapping at `gpu_addr`
    fn unmap(&self, vspace: VspaceHandle, gpu_addr: u64);

    /// Map the first page of a buffer for CPU access
    fn map_page(&self, buffer: BufferHandle) -> Result<NonNull<[u8]>>;

    /// Undo [`Platform::map_page`]
    fn unmap_page(&self, buffer: BufferHandle, ptr: NonNull<u8>);

    /// Map all pages of a buffer contiguously for CPU access
    fn map_pages(&self, buffer: BufferHandle) -> Result<NonNull<[u8]>>;

    /// Undo [`Platform::map_pages`]
    fn unmap_pages(&self, buffer: BufferHandle, ptr: NonNull<u8>);

    /// Create a command channel bound to a virtual space
    fn create_channel(&self, vspace: VspaceHandle) -> Result<ChannelHandle>;

    /// Destroy a command channel
    fn destroy_channel(&self, channel: ChannelHandle);

    /// Register an indirect buffer ring as the channel's hardware FIFO
    fn register_fifo(&self, channel: ChannelHandle, base: u64, order: u32) -> Result<()>;

    /// FIFO control registers of a channel
    fn fifo_registers(&self, channel: ChannelHandle) -> Result<RegisterView>;

    /// Query a device parameter
    fn get_param(&self, param: PlatformParam) -> Result<u64>;
}

/// Non-owning view of a channel's FIFO control registers
#[derive(Debug)]
pub struct RegisterView {
    base: NonNull<u32>,
    words: usize,
}

unsafe impl Send for RegisterView {}
unsafe impl Sync for RegisterView {}

impl RegisterView {
    /// Create a view over `words` 32-bit registers
    ///
    /// # Safety
    /// `base` must be valid for volatile reads and writes of `words` registers
    /// until the owning channel is destroyed.
    pub unsafe fn from_raw(base: NonNull<u32>, words: usize) -> Self {
        Self { base, words }
    }

    /// Number of registers
    pub fn len(&self) -> usize {
        self.words
    }

    /// The view has no registers
    pub fn is_empty(&self) -> bool {
        self.words == 0
    }

    /// Read register `index`
    pub fn read(&self, index: usize) -> Option<u32> {
        if index >= self.words {
            return None;
        }
        Some(unsafe { core::ptr::read_volatile(self.base.as_ptr().add(index)) })
    }

    /// Write register `index`
    pub fn write(&self, index: usize, value: u32) -> Result<()> {
        if index >= self.words {
            return Err(Error::InvalidParameter);
        }
        unsafe { core::ptr::write_volatile(self.base.as_ptr().add(index), value) };
        Ok(())
    }
}

/// Owned platform buffer object
pub(crate) struct Buffer {
    platform: Arc<dyn Platform>,
    handle: BufferHandle,
    size: u64,
}

impl Buffer {
    pub(crate) fn allocate(
        platform: &Arc<dyn Platform>,
        size: u64,
        flags: DomainFlags,
    ) -> Result<Self> {
        let handle = platform.allocate_buffer(size, flags).map_err(|e| {
            log::warn!("Failed to allocate buffer object ({} bytes): {}", size, e);
            Error::AllocationFailure
        })?;

        Ok(Self {
            platform: Arc::clone(platform),
            handle,
            size,
        })
    }

    pub(crate) fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.platform.free_buffer(self.handle);
    }
}

/// Mapping of a buffer into a virtual space
pub(crate) struct VasMapping {
    platform: Arc<dyn Platform>,
    vspace: VspaceHandle,
    gpu_addr: u64,
}

impl VasMapping {
    pub(crate) fn map(
        platform: &Arc<dyn Platform>,
        vspace: VspaceHandle,
        buffer: &Buffer,
    ) -> Result<Self> {
        let gpu_addr = platform
            .map_into_range(vspace, buffer.handle(), VAS_USER_RANGE)
            .map_err(|e| {
                log::warn!("Failed to map VAS: {}", e);
                Error::AllocationFailure
            })?;

        Ok(Self {
            platform: Arc::clone(platform),
            vspace,
            gpu_addr,
        })
    }

    pub(crate) fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }
}

impl Drop for VasMapping {
    fn drop(&mut self) {
        self.platform.unmap(self.vspace, self.gpu_addr);
    }
}

/// CPU mapping of a buffer
pub(crate) struct CpuMapping {
    platform: Arc<dyn Platform>,
    buffer: BufferHandle,
    ptr: NonNull<u8>,
    len: usize,
    technique: MapTechnique,
}

unsafe impl Send for CpuMapping {}
unsafe impl Sync for CpuMapping {}

impl CpuMapping {
    pub(crate) fn map(
        platform: &Arc<dyn Platform>,
        buffer: &Buffer,
        technique: MapTechnique,
    ) -> Result<Self> {
        let mapped = match technique {
            MapTechnique::SinglePage => platform.map_page(buffer.handle()),
            MapTechnique::MultiPage => platform.map_pages(buffer.handle()),
        };
        let view = mapped.map_err(|e| {
            log::warn!("Failed to map buffer {:?} for CPU access: {}", buffer.handle(), e);
            Error::MappingFailure
        })?;

        let wanted = match technique {
            MapTechnique::SinglePage => buffer.size().min(PAGE_SIZE),
            MapTechnique::MultiPage => buffer.size(),
        };

        let mut mapping = Self {
            platform: Arc::clone(platform),
            buffer: buffer.handle(),
            ptr: view.cast::<u8>(),
            len: view.len(),
            technique,
        };
        if (mapping.len as u64) < wanted {
            log::warn!(
                "CPU mapping of buffer {:?} covers {} of {} bytes",
                buffer.handle(),
                mapping.len,
                wanted
            );
            return Err(Error::MappingFailure);
        }

        mapping.len = wanted as usize;
        Ok(mapping)
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn technique(&self) -> MapTechnique {
        self.technique
    }
}

impl Drop for CpuMapping {
    fn drop(&mut self) {
        match self.technique {
            MapTechnique::SinglePage => self.platform.unmap_page(self.buffer, self.ptr),
            MapTechnique::MultiPage => self.platform.unmap_pages(self.buffer, self.ptr),
        }
    }
}

/// Owned command channel
pub(crate) struct Channel {
    platform: Arc<dyn Platform>,
    handle: ChannelHandle,
}

impl Channel {
    pub(crate) fn create(platform: &Arc<dyn Platform>, vspace: VspaceHandle) -> Result<Self> {
        let handle = platform.create_channel(vspace).map_err(|e| {
            log::warn!("Failed to create channel: {}", e);
            e
        })?;

        Ok(Self {
            platform: Arc::clone(platform),
            handle,
        })
    }

    pub(crate) fn handle(&self) -> ChannelHandle {
        self.handle
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.platform.destroy_channel(self.handle);
    }
}
