//! Software platform
//!
//! An in-process [`Platform`] backed by host memory. Buffers are charged
//! against a VRAM or GTT budget, virtual spaces place mappings in the first
//! free gap of the requested window, and channels carry a small block of FIFO
//! registers.
//!
//! Besides serving as a fallback device it keeps allocation accounting
//! ([`SimStats`]) and can be told to fail any primitive ([`FailPoint`]),
//! which is how the rollback paths of the compute layer are exercised.

use std::collections::BTreeMap;
use std::ops::Range;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::platform::{
    BufferHandle, ChannelHandle, DomainFlags, MapTechnique, Platform, PlatformParam,
    RegisterView, VspaceHandle, PAGE_SIZE,
};
use crate::{Error, Result};

/// Number of 32-bit FIFO control registers per channel
pub const FIFO_REGISTER_WORDS: usize = 64;

/// Software platform configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Chipset identifier reported to the compute layer
    pub chipset: u32,
    /// Device memory budget in bytes
    pub vram_size: u64,
    /// System memory budget in bytes
    pub gtt_size: u64,
    /// Multiprocessor count answered for [`PlatformParam::MpCount`]
    pub mp_count: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            chipset: 0xc0,
            vram_size: 512 * 1024 * 1024,
            gtt_size: 1024 * 1024 * 1024,
            mp_count: 14,
        }
    }
}

impl SimConfig {
    pub fn chipset(mut self, chipset: u32) -> Self {
        self.chipset = chipset;
        self
    }

    pub fn vram_size(mut self, size: u64) -> Self {
        self.vram_size = size;
        self
    }

    pub fn gtt_size(mut self, size: u64) -> Self {
        self.gtt_size = size;
        self
    }

    pub fn mp_count(mut self, count: u64) -> Self {
        self.mp_count = count;
        self
    }
}

/// Platform primitive that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    AllocateBuffer,
    VspaceNew,
    MapIntoRange,
    MapPage,
    MapPages,
    CreateChannel,
    RegisterFifo,
    FifoRegisters,
}

impl FailPoint {
    /// Error reported when no explicit one was given
    fn default_error(self) -> Error {
        match self {
            FailPoint::AllocateBuffer | FailPoint::VspaceNew | FailPoint::MapIntoRange => {
                Error::AllocationFailure
            }
            FailPoint::MapPage | FailPoint::MapPages => Error::MappingFailure,
            FailPoint::CreateChannel => Error::AllocationFailure,
            FailPoint::RegisterFifo | FailPoint::FifoRegisters => Error::UnsupportedHardware,
        }
    }
}

/// Live allocations and detected misuse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Live buffer objects
    pub buffers: usize,
    /// Live buffer mappings in virtual spaces
    pub vas_mappings: usize,
    /// Buffers CPU mapped with the single-page technique
    pub single_page_maps: usize,
    /// Buffers CPU mapped with the multi-page technique
    pub multi_page_maps: usize,
    /// Live channels
    pub channels: usize,
    /// Live virtual spaces
    pub vspaces: usize,
    /// CPU unmaps that used another technique than the map
    pub technique_mismatches: usize,
    /// Releases that happened before their dependents were released
    pub ordering_violations: usize,
}

struct Injection {
    point: FailPoint,
    skip: usize,
    error: Error,
}

/// Budget of one memory domain
struct MemoryPool {
    size: u64,
    used: u64,
}

impl MemoryPool {
    fn new(size: u64) -> Self {
        Self { size, used: 0 }
    }

    fn alloc(&mut self, size: u64) -> Result<u64> {
        let aligned_size = page_align(size).ok_or(Error::AllocationFailure)?;
        match self.used.checked_add(aligned_size) {
            Some(total) if total <= self.size => {}
            _ => return Err(Error::AllocationFailure),
        }
        self.used += aligned_size;
        Ok(aligned_size)
    }

    fn free(&mut self, aligned_size: u64) {
        self.used -= aligned_size;
    }
}

struct SimBuffer {
    flags: DomainFlags,
    charged: u64,
    storage: Box<[u64]>,
    cpu_map: Option<MapTechnique>,
    vas_maps: usize,
}

impl SimBuffer {
    /// CPU view of the first `len` bytes
    fn view(&mut self, len: usize) -> NonNull<[u8]> {
        let bytes = self.bytes();
        let len = len.min(bytes.len());
        NonNull::from(&mut bytes[..len])
    }

    fn bytes(&mut self) -> &mut [u8] {
        let len = self.storage.len() * 8;
        unsafe { std::slice::from_raw_parts_mut(self.storage.as_mut_ptr().cast::<u8>(), len) }
    }
}

struct SimMapping {
    buffer: BufferHandle,
    size: u64,
}

struct SimVspace {
    size: u64,
    mappings: BTreeMap<u64, SimMapping>,
    channels: usize,
}

impl SimVspace {
    /// Lowest address in `window` where `size` bytes fit between mappings
    fn find_gap(&self, window: Range<u64>, size: u64) -> Option<u64> {
        let mut start = window.start;
        for (&addr, mapping) in self.mappings.range(..window.end) {
            let end = addr.checked_add(mapping.size)?;
            if end <= start {
                continue;
            }
            if addr >= start.checked_add(size)? {
                break;
            }
            start = end;
        }

        match start.checked_add(size) {
            Some(end) if end <= window.end => Some(start),
            _ => None,
        }
    }
}

struct SimChannel {
    vspace: VspaceHandle,
    fifo: Option<(u64, u32)>,
    regs: Box<[u32]>,
}

struct SimState {
    buffers: BTreeMap<BufferHandle, SimBuffer>,
    vspaces: BTreeMap<VspaceHandle, SimVspace>,
    channels: BTreeMap<ChannelHandle, SimChannel>,
    vram_pool: MemoryPool,
    gtt_pool: MemoryPool,
    next_handle: u32,
    injections: Vec<Injection>,
    technique_mismatches: usize,
    ordering_violations: usize,
}

impl SimState {
    fn next_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn check(&mut self, point: FailPoint) -> Result<()> {
        let Some(index) = self.injections.iter().position(|i| i.point == point) else {
            return Ok(());
        };

        let injection = &mut self.injections[index];
        if injection.skip > 0 {
            injection.skip -= 1;
            return Ok(());
        }

        let error = injection.error;
        self.injections.remove(index);
        log::debug!("sim: injected {:?} failure ({})", point, error);
        Err(error)
    }

    fn violation(&mut self, what: &str) {
        log::error!("sim: release order violated: {}", what);
        self.ordering_violations += 1;
    }
}

/// In-process GPU platform
pub struct SimPlatform {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimPlatform {
    /// Create a platform with one device described by `config`
    pub fn new(config: SimConfig) -> Self {
        log::info!(
            "sim: NV{:x}, {} MiB VRAM, {} MiB GTT",
            config.chipset,
            config.vram_size / (1024 * 1024),
            config.gtt_size / (1024 * 1024)
        );

        Self {
            config,
            state: Mutex::new(SimState {
                buffers: BTreeMap::new(),
                vspaces: BTreeMap::new(),
                channels: BTreeMap::new(),
                vram_pool: MemoryPool::new(config.vram_size),
                gtt_pool: MemoryPool::new(config.gtt_size),
                next_handle: 1,
                injections: Vec::new(),
                technique_mismatches: 0,
                ordering_violations: 0,
            }),
        }
    }

    /// Configuration the platform was built with
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Fail the next call of `point`
    pub fn fail_next(&self, point: FailPoint) {
        self.fail_nth(point, 0);
    }

    /// Let `skip` calls of `point` succeed, then fail the one after
    pub fn fail_nth(&self, point: FailPoint, skip: usize) {
        self.fail_with(point, skip, point.default_error());
    }

    /// Like [`SimPlatform::fail_nth`], reporting `error`
    pub fn fail_with(&self, point: FailPoint, skip: usize, error: Error) {
        self.state.lock().injections.push(Injection { point, skip, error });
    }

    /// Drop all pending injections
    pub fn clear_failures(&self) {
        self.state.lock().injections.clear();
    }

    /// Snapshot of the live resource counters
    pub fn stats(&self) -> SimStats {
        let state = self.state.lock();
        let mut stats = SimStats {
            buffers: state.buffers.len(),
            channels: state.channels.len(),
            vspaces: state.vspaces.len(),
            technique_mismatches: state.technique_mismatches,
            ordering_violations: state.ordering_violations,
            ..SimStats::default()
        };

        for buffer in state.buffers.values() {
            stats.vas_mappings += buffer.vas_maps;
            match buffer.cpu_map {
                Some(MapTechnique::SinglePage) => stats.single_page_maps += 1,
                Some(MapTechnique::MultiPage) => stats.multi_page_maps += 1,
                None => {}
            }
        }
        stats
    }

    /// Technique a buffer is currently CPU mapped with
    pub fn mapping_technique(&self, buffer: BufferHandle) -> Option<MapTechnique> {
        self.state.lock().buffers.get(&buffer)?.cpu_map
    }

    /// Bytes charged against the VRAM and GTT budgets
    pub fn pool_usage(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.vram_pool.used, state.gtt_pool.used)
    }

    /// Store a word into a buffer the way the GPU would
    pub fn write_u32(&self, buffer: BufferHandle, offset: usize, value: u32) {
        let mut state = self.state.lock();
        let Some(buffer) = state.buffers.get_mut(&buffer) else {
            log::warn!("sim: write to unknown buffer {:?}", buffer);
            return;
        };
        let bytes = buffer.bytes();
        if offset + 4 > bytes.len() {
            log::warn!("sim: write at {:#x} out of bounds", offset);
            return;
        }
        bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Indirect buffer registered for a channel
    pub fn fifo_of(&self, channel: ChannelHandle) -> Option<(u64, u32)> {
        self.state.lock().channels.get(&channel)?.fifo
    }

    fn has_fifo(&self) -> bool {
        matches!(self.config.chipset & 0xf0, 0x50 | 0x80 | 0x90 | 0xa0 | 0xc0)
    }

    fn has_fifo_registers(&self) -> bool {
        self.config.chipset & 0xf0 == 0xc0
    }
}

fn page_align(size: u64) -> Option<u64> {
    Some(size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

impl Platform for SimPlatform {
    fn chipset(&self) -> u32 {
        self.config.chipset
    }

    fn allocate_buffer(&self, size: u64, flags: DomainFlags) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::AllocateBuffer)?;
        if size == 0 {
            return Err(Error::InvalidParameter);
        }

        let charged = if flags.contains(DomainFlags::DEVICE_LOCAL) {
            state.vram_pool.alloc(size)?
        } else {
            state.gtt_pool.alloc(size)?
        };

        let handle = BufferHandle(state.next_handle());
        state.buffers.insert(
            handle,
            SimBuffer {
                flags,
                charged,
                storage: vec![0u64; (charged / 8) as usize].into_boxed_slice(),
                cpu_map: None,
                vas_maps: 0,
            },
        );
        Ok(handle)
    }

    fn free_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        let Some(obj) = state.buffers.remove(&buffer) else {
            log::warn!("sim: free of unknown buffer {:?}", buffer);
            return;
        };

        if obj.cpu_map.is_some() || obj.vas_maps > 0 {
            state.violation("buffer freed while mapped");
        }
        if obj.flags.contains(DomainFlags::DEVICE_LOCAL) {
            state.vram_pool.free(obj.charged);
        } else {
            state.gtt_pool.free(obj.charged);
        }
    }

    fn vspace_new(&self, size: u64) -> Result<VspaceHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::VspaceNew)?;
        if size == 0 {
            return Err(Error::InvalidParameter);
        }

        let handle = VspaceHandle(state.next_handle());
        state.vspaces.insert(
            handle,
            SimVspace {
                size,
                mappings: BTreeMap::new(),
                channels: 0,
            },
        );
        Ok(handle)
    }

    fn vspace_unref(&self, vspace: VspaceHandle) {
        let mut state = self.state.lock();
        let Some(space) = state.vspaces.remove(&vspace) else {
            log::warn!("sim: unref of unknown vspace {:?}", vspace);
            return;
        };

        if !space.mappings.is_empty() || space.channels > 0 {
            state.violation("vspace released while in use");
        }
    }

    fn map_into_range(
        &self,
        vspace: VspaceHandle,
        buffer: BufferHandle,
        range: Range<u64>,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        state.check(FailPoint::MapIntoRange)?;

        let size = match state.buffers.get(&buffer) {
            Some(obj) => obj.charged,
            None => return Err(Error::InvalidParameter),
        };
        let space = state
            .vspaces
            .get_mut(&vspace)
            .ok_or(Error::InvalidParameter)?;

        let window = range.start..range.end.min(space.size);
        let start = space
            .find_gap(window, size)
            .ok_or(Error::AllocationFailure)?;

        space.mappings.insert(start, SimMapping { buffer, size });
        if let Some(obj) = state.buffers.get_mut(&buffer) {
            obj.vas_maps += 1;
        }
        Ok(start)
    }

    fn unmap(&self, vspace: VspaceHandle, gpu_addr: u64) {
        let mut state = self.state.lock();
        let removed = state
            .vspaces
            .get_mut(&vspace)
            .and_then(|space| space.mappings.remove(&gpu_addr));
        let Some(SimMapping { buffer, .. }) = removed else {
            log::warn!("sim: no mapping at {:#x} in {:?}", gpu_addr, vspace);
            return;
        };

        let cpu_mapped = match state.buffers.get_mut(&buffer) {
            Some(obj) => {
                obj.vas_maps -= 1;
                obj.cpu_map.is_some()
            }
            None => false,
        };
        if cpu_mapped {
            state.violation("VAS mapping removed while CPU mapped");
        }
    }

    fn map_page(&self, buffer: BufferHandle) -> Result<NonNull<[u8]>> {
        let mut state = self.state.lock();
        state.check(FailPoint::MapPage)?;
        let obj = state.buffers.get_mut(&buffer).ok_or(Error::InvalidParameter)?;
        if obj.cpu_map.is_some() {
            return Err(Error::MappingFailure);
        }
        obj.cpu_map = Some(MapTechnique::SinglePage);
        Ok(obj.view(PAGE_SIZE as usize))
    }

    fn unmap_page(&self, buffer: BufferHandle, _ptr: NonNull<u8>) {
        let mut state = self.state.lock();
        let previous = state.buffers.get_mut(&buffer).and_then(|obj| obj.cpu_map.take());
        if previous != Some(MapTechnique::SinglePage) {
            log::error!("sim: {:?} unmapped as single page, mapped as {:?}", buffer, previous);
            state.technique_mismatches += 1;
        }
    }

    fn map_pages(&self, buffer: BufferHandle) -> Result<NonNull<[u8]>> {
        let mut state = self.state.lock();
        state.check(FailPoint::MapPages)?;
        let obj = state.buffers.get_mut(&buffer).ok_or(Error::InvalidParameter)?;
        if obj.cpu_map.is_some() {
            return Err(Error::MappingFailure);
        }
        obj.cpu_map = Some(MapTechnique::MultiPage);
        Ok(obj.view(usize::MAX))
    }

    fn unmap_pages(&self, buffer: BufferHandle, _ptr: NonNull<u8>) {
        let mut state = self.state.lock();
        let previous = state.buffers.get_mut(&buffer).and_then(|obj| obj.cpu_map.take());
        if previous != Some(MapTechnique::MultiPage) {
            log::error!("sim: {:?} unmapped as multi page, mapped as {:?}", buffer, previous);
            state.technique_mismatches += 1;
        }
    }

    fn create_channel(&self, vspace: VspaceHandle) -> Result<ChannelHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateChannel)?;
        let space = state
            .vspaces
            .get_mut(&vspace)
            .ok_or(Error::InvalidParameter)?;
        space.channels += 1;

        let handle = ChannelHandle(state.next_handle());
        state.channels.insert(
            handle,
            SimChannel {
                vspace,
                fifo: None,
                regs: vec![0u32; FIFO_REGISTER_WORDS].into_boxed_slice(),
            },
        );
        Ok(handle)
    }

    fn destroy_channel(&self, channel: ChannelHandle) {
        let mut state = self.state.lock();
        let Some(chan) = state.channels.remove(&channel) else {
            log::warn!("sim: destroy of unknown channel {:?}", channel);
            return;
        };

        match state.vspaces.get_mut(&chan.vspace) {
            Some(space) => space.channels -= 1,
            None => state.violation("channel outlived its vspace"),
        }
    }

    fn register_fifo(&self, channel: ChannelHandle, base: u64, order: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::RegisterFifo)?;
        if !self.has_fifo() {
            return Err(Error::UnsupportedHardware);
        }

        let chan = state
            .channels
            .get_mut(&channel)
            .ok_or(Error::InvalidParameter)?;
        chan.fifo = Some((base, order));
        Ok(())
    }

    fn fifo_registers(&self, channel: ChannelHandle) -> Result<RegisterView> {
        let mut state = self.state.lock();
        state.check(FailPoint::FifoRegisters)?;
        if !self.has_fifo_registers() {
            return Err(Error::UnsupportedHardware);
        }

        let chan = state
            .channels
            .get_mut(&channel)
            .ok_or(Error::InvalidParameter)?;
        if chan.fifo.is_none() {
            return Err(Error::InvalidParameter);
        }

        let base = NonNull::new(chan.regs.as_mut_ptr()).ok_or(Error::InvalidParameter)?;
        // SAFETY: the register block lives until the channel is destroyed.
        Ok(unsafe { RegisterView::from_raw(base, chan.regs.len()) })
    }

    fn get_param(&self, param: PlatformParam) -> Result<u64> {
        match param {
            PlatformParam::MpCount => Ok(self.config.mp_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_budget() {
        let sim = SimPlatform::new(SimConfig::default().vram_size(2 * PAGE_SIZE));
        let a = sim.allocate_buffer(1, DomainFlags::VRAM).unwrap();
        let b = sim.allocate_buffer(PAGE_SIZE, DomainFlags::VRAM).unwrap();
        assert_eq!(
            sim.allocate_buffer(1, DomainFlags::VRAM),
            Err(Error::AllocationFailure)
        );
        assert_eq!(sim.pool_usage(), (2 * PAGE_SIZE, 0));

        sim.free_buffer(a);
        sim.free_buffer(b);
        assert_eq!(sim.pool_usage(), (0, 0));
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_fail_nth() {
        let sim = SimPlatform::new(SimConfig::default());
        sim.fail_nth(FailPoint::VspaceNew, 1);
        let first = sim.vspace_new(1 << 32).unwrap();
        assert_eq!(sim.vspace_new(1 << 32), Err(Error::AllocationFailure));
        let third = sim.vspace_new(1 << 32).unwrap();

        sim.fail_with(FailPoint::CreateChannel, 0, Error::BackendFailure);
        assert_eq!(sim.create_channel(first), Err(Error::BackendFailure));
        sim.fail_next(FailPoint::CreateChannel);
        sim.clear_failures();
        let chan = sim.create_channel(first).unwrap();

        sim.destroy_channel(chan);
        sim.vspace_unref(first);
        sim.vspace_unref(third);
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_map_into_range() {
        let sim = SimPlatform::new(SimConfig::default());
        let space = sim.vspace_new(0x3000_0000).unwrap();
        let buf = sim.allocate_buffer(0x1800, DomainFlags::SYSRAM_SNOOP).unwrap();

        let first = sim.map_into_range(space, buf, 0x2000_0000..1 << 40).unwrap();
        let second = sim.map_into_range(space, buf, 0x2000_0000..1 << 40).unwrap();
        assert_eq!(first, 0x2000_0000);
        assert_eq!(second, first + 0x2000);
        assert_eq!(sim.stats().vas_mappings, 2);

        // Window ends at the vspace size
        let big = sim.allocate_buffer(0x1000_0000, DomainFlags::SYSRAM_SNOOP).unwrap();
        assert_eq!(
            sim.map_into_range(space, big, 0x2000_0000..1 << 40),
            Err(Error::AllocationFailure)
        );

        sim.unmap(space, second);
        sim.unmap(space, first);
        sim.free_buffer(big);
        sim.free_buffer(buf);
        sim.vspace_unref(space);
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_ordering_violations() {
        let sim = SimPlatform::new(SimConfig::default());
        let space = sim.vspace_new(1 << 40).unwrap();
        let buf = sim.allocate_buffer(PAGE_SIZE, DomainFlags::SYSRAM_SNOOP).unwrap();
        let addr = sim.map_into_range(space, buf, 0x2000_0000..1 << 40).unwrap();
        let ptr = sim.map_page(buf).unwrap();

        sim.unmap(space, addr);
        assert_eq!(sim.stats().ordering_violations, 1);
        sim.unmap_pages(buf, ptr.cast());
        assert_eq!(sim.stats().technique_mismatches, 1);
        sim.free_buffer(buf);
        sim.vspace_unref(space);
        assert_eq!(sim.stats().ordering_violations, 1);
    }

    #[test]
    fn test_fifo_support_by_family() {
        let families = [
            (0x50, true, false),
            (0xa8, true, false),
            (0xc0, true, true),
            (0xe4, false, false),
        ];
        for (chipset, fifo, regs) in families {
            let sim = SimPlatform::new(SimConfig::default().chipset(chipset));
            let space = sim.vspace_new(1 << 40).unwrap();
            let chan = sim.create_channel(space).unwrap();

            assert_eq!(sim.register_fifo(chan, 0x2000_0000, 9).is_ok(), fifo);
            match sim.fifo_registers(chan) {
                Ok(view) => {
                    assert!(regs);
                    assert_eq!(view.len(), FIFO_REGISTER_WORDS);
                }
                Err(e) => {
                    assert!(!regs);
                    assert_eq!(e, Error::UnsupportedHardware);
                }
            }

            sim.destroy_channel(chan);
            sim.vspace_unref(space);
            assert_eq!(sim.stats(), SimStats::default());
        }
    }

    #[test]
    fn test_write_u32_visible_through_mapping() {
        let sim = SimPlatform::new(SimConfig::default());
        let buf = sim.allocate_buffer(PAGE_SIZE, DomainFlags::SYSRAM_SNOOP).unwrap();
        let view = sim.map_page(buf).unwrap();
        assert_eq!(view.len(), PAGE_SIZE as usize);

        sim.write_u32(buf, 16, 0x1234_5678);
        let ptr = view.cast::<u8>();
        let value = unsafe { core::ptr::read_volatile(ptr.as_ptr().add(16).cast::<u32>()) };
        assert_eq!(value, 0x1234_5678);

        sim.unmap_page(buf, ptr);
        sim.free_buffer(buf);
    }

    #[test]
    fn test_mapped_length_matches_backing() {
        let sim = SimPlatform::new(SimConfig::default());
        let small = sim.allocate_buffer(100, DomainFlags::SYSRAM_SNOOP).unwrap();
        let large = sim.allocate_buffer(3 * PAGE_SIZE + 1, DomainFlags::SYSRAM_SNOOP).unwrap();

        let first_page = sim.map_page(small).unwrap();
        let all_pages = sim.map_pages(large).unwrap();
        assert_eq!(first_page.len(), PAGE_SIZE as usize);
        assert_eq!(all_pages.len(), 4 * PAGE_SIZE as usize);

        sim.unmap_page(small, first_page.cast());
        sim.unmap_pages(large, all_pages.cast());
        sim.free_buffer(small);
        sim.free_buffer(large);
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let sim = SimPlatform::new(SimConfig::default());
        assert_eq!(
            sim.allocate_buffer(u64::MAX - 100, DomainFlags::VRAM),
            Err(Error::AllocationFailure)
        );

        // Aligns to 2^64 - 4096, which wraps the budget sum to zero
        let page = sim.allocate_buffer(PAGE_SIZE, DomainFlags::VRAM).unwrap();
        assert_eq!(
            sim.allocate_buffer(u64::MAX - (PAGE_SIZE - 1), DomainFlags::VRAM),
            Err(Error::AllocationFailure)
        );
        assert_eq!(sim.pool_usage(), (PAGE_SIZE, 0));

        sim.free_buffer(page);
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_freed_ranges_are_reused() {
        let sim = SimPlatform::new(SimConfig::default());
        let space = sim.vspace_new(1 << 40).unwrap();
        let window = 0x2000_0000..1 << 40;
        let bufs: Vec<_> = (0..3)
            .map(|_| sim.allocate_buffer(PAGE_SIZE, DomainFlags::VRAM).unwrap())
            .collect();

        let addrs: Vec<_> = bufs
            .iter()
            .map(|&b| sim.map_into_range(space, b, window.clone()).unwrap())
            .collect();
        assert_eq!(addrs, [0x2000_0000, 0x2000_1000, 0x2000_2000]);

        // The hole left by the middle mapping is filled first
        sim.unmap(space, addrs[1]);
        let refill = sim.map_into_range(space, bufs[1], window.clone()).unwrap();
        assert_eq!(refill, addrs[1]);

        // Too big for the hole, goes after the last mapping
        sim.unmap(space, refill);
        let wide = sim.allocate_buffer(2 * PAGE_SIZE, DomainFlags::VRAM).unwrap();
        let wide_addr = sim.map_into_range(space, wide, window.clone()).unwrap();
        assert_eq!(wide_addr, 0x2000_3000);

        sim.unmap(space, wide_addr);
        sim.unmap(space, addrs[0]);
        sim.unmap(space, addrs[2]);
        sim.free_buffer(wide);
        for buf in bufs {
            sim.free_buffer(buf);
        }
        sim.vspace_unref(space);
        assert_eq!(sim.stats(), SimStats::default());
    }

    #[test]
    fn test_small_window_survives_map_unmap_cycles() {
        let sim = SimPlatform::new(SimConfig::default());
        // 1 MiB above the user window start
        let space = sim.vspace_new(0x2010_0000).unwrap();
        let buf = sim.allocate_buffer(0x80000, DomainFlags::SYSRAM_SNOOP).unwrap();

        for _ in 0..16 {
            let addr = sim.map_into_range(space, buf, 0x2000_0000..1 << 40).unwrap();
            assert_eq!(addr, 0x2000_0000);
            sim.unmap(space, addr);
        }

        sim.free_buffer(buf);
        sim.vspace_unref(space);
        assert_eq!(sim.stats(), SimStats::default());
    }
}
