//! Memory objects
//!
//! A memory object is a platform buffer mapped into exactly one address space,
//! optionally mapped for CPU access as well. Teardown runs in the reverse
//! order of allocation: CPU mapping, VAS mapping, buffer.

use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::platform::{
    Buffer, BufferHandle, CpuMapping, DomainFlags, MapTechnique, Platform, VasMapping,
    VspaceHandle,
};
use crate::vas::{MemId, MemInfo, Vas, VasShared};
use crate::{Error, Result};

/// Buffer mapped into a virtual space, optionally CPU mapped
///
/// Fields drop in declaration order, which is the teardown order.
pub(crate) struct Backing {
    cpu: Option<CpuMapping>,
    mapping: VasMapping,
    buffer: Buffer,
}

impl Backing {
    /// Allocate, map into `vspace` and, with a `technique`, map for the CPU.
    pub(crate) fn new(
        platform: &Arc<dyn Platform>,
        vspace: VspaceHandle,
        size: u64,
        flags: DomainFlags,
        technique: Option<MapTechnique>,
    ) -> Result<Self> {
        let buffer = Buffer::allocate(platform, size, flags)?;
        let mapping = VasMapping::map(platform, vspace, &buffer)?;
        let cpu = match technique {
            Some(technique) => Some(CpuMapping::map(platform, &buffer, technique)?),
            None => None,
        };

        Ok(Self {
            cpu,
            mapping,
            buffer,
        })
    }

    pub(crate) fn gpu_addr(&self) -> u64 {
        self.mapping.gpu_addr()
    }

    pub(crate) fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub(crate) fn buffer(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub(crate) fn technique(&self) -> Option<MapTechnique> {
        self.cpu.as_ref().map(CpuMapping::technique)
    }

    pub(crate) fn cpu(&self) -> Option<&CpuMapping> {
        self.cpu.as_ref()
    }
}

/// Snooped system memory buffer, mapped into a virtual space and for the CPU
///
/// Backs the rings and the fence page of a context.
pub(crate) struct MappedBacking {
    cpu: CpuMapping,
    mapping: VasMapping,
    buffer: Buffer,
}

impl MappedBacking {
    pub(crate) fn new(
        platform: &Arc<dyn Platform>,
        vspace: VspaceHandle,
        size: u64,
        technique: MapTechnique,
    ) -> Result<Self> {
        let buffer = Buffer::allocate(platform, size, DomainFlags::SYSRAM_SNOOP)?;
        let mapping = VasMapping::map(platform, vspace, &buffer)?;
        let cpu = CpuMapping::map(platform, &buffer, technique)?;

        Ok(Self {
            cpu,
            mapping,
            buffer,
        })
    }

    pub(crate) fn gpu_addr(&self) -> u64 {
        self.mapping.gpu_addr()
    }

    pub(crate) fn buffer(&self) -> BufferHandle {
        self.buffer.handle()
    }

    /// Start of the CPU mapping
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.cpu.ptr()
    }
}

/// Memory object mapped into a [`Vas`]
pub struct MemoryObject {
    vas: Arc<VasShared>,
    id: MemId,
    flags: DomainFlags,
    backing: ManuallyDrop<Backing>,
}

impl MemoryObject {
    /// Allocate `size` bytes in `vas`
    ///
    /// Host-visible objects are mapped for the CPU with the single-page
    /// technique up to one page and the multi-page technique above that.
    pub fn alloc(vas: &Vas, size: u64, flags: DomainFlags) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidParameter);
        }

        let shared = vas.shared();
        let technique = flags
            .is_host_visible()
            .then(|| MapTechnique::for_size(size));

        let mut state = shared.lock();
        let backing = Backing::new(shared.platform(), shared.vspace(), size, flags, technique)?;

        let id = state.next_id();
        state.objects.insert(
            id,
            MemInfo {
                id,
                gpu_addr: backing.gpu_addr(),
                size,
                flags,
            },
        );
        drop(state);

        crate::step_trace!(
            "mem {} in {:?}: {} bytes at {:#x} ({:?})",
            id,
            shared.vspace(),
            size,
            backing.gpu_addr(),
            technique
        );

        Ok(Self {
            vas: Arc::clone(shared),
            id,
            flags,
            backing: ManuallyDrop::new(backing),
        })
    }

    /// Free the object
    pub fn free(self) {}

    /// Key inside the owning address space
    pub fn id(&self) -> MemId {
        self.id
    }

    /// GPU virtual address
    pub fn gpu_addr(&self) -> u64 {
        self.backing.gpu_addr()
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.backing.size()
    }

    /// Memory domain
    pub fn flags(&self) -> DomainFlags {
        self.flags
    }

    /// Platform buffer handle
    pub fn buffer(&self) -> BufferHandle {
        self.backing.buffer()
    }

    /// CPU mapping technique, if the object is host visible
    pub fn map_technique(&self) -> Option<MapTechnique> {
        self.backing.technique()
    }

    /// The object has a CPU mapping
    pub fn is_mapped(&self) -> bool {
        self.backing.cpu().is_some()
    }

    /// CPU view of the object
    pub fn as_slice(&self) -> Option<&[u8]> {
        let cpu = self.backing.cpu()?;
        let len = cpu.len().min(self.size() as usize);
        Some(unsafe { std::slice::from_raw_parts(cpu.ptr().as_ptr(), len) })
    }

    /// Mutable CPU view of the object
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let cpu = self.backing.cpu()?;
        let len = cpu.len().min(self.size() as usize);
        Some(unsafe { std::slice::from_raw_parts_mut(cpu.ptr().as_ptr(), len) })
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        let mut state = self.vas.lock();
        state.objects.remove(&self.id);
        // SAFETY: backing is never touched again.
        unsafe { ManuallyDrop::drop(&mut self.backing) };
        drop(state);

        crate::step_trace!("mem {} in {:?} freed", self.id, self.vas.vspace());
    }
}

/// Allocate device-local memory
pub fn alloc_device_memory(vas: &Vas, size: u64) -> Result<MemoryObject> {
    MemoryObject::alloc(vas, size, DomainFlags::VRAM)
}

/// Free device-local memory
pub fn free_device_memory(mem: MemoryObject) {
    mem.free()
}

/// Allocate snooped host memory, mapped for the CPU
pub fn alloc_host_memory(vas: &Vas, size: u64) -> Result<MemoryObject> {
    MemoryObject::alloc(vas, size, DomainFlags::SYSRAM_SNOOP)
}

/// Free host memory
pub fn free_host_memory(mem: MemoryObject) {
    mem.free()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendTable;
    use crate::device::DeviceRegistry;
    use crate::platform::PAGE_SIZE;
    use crate::sim::{FailPoint, SimConfig, SimPlatform};

    fn setup() -> (Arc<SimPlatform>, DeviceRegistry) {
        let sim = Arc::new(SimPlatform::new(SimConfig::default()));
        let registry = DeviceRegistry::new(
            vec![sim.clone() as Arc<dyn Platform>],
            &BackendTable::with_defaults(),
        );
        (sim, registry)
    }

    #[test]
    fn test_device_memory_not_mapped() {
        let (sim, registry) = setup();
        let dev = registry.open(0).unwrap();
        let vas = Vas::new(&dev, 1 << 32).unwrap();

        let mem = alloc_device_memory(&vas, 0x100000).unwrap();
        assert!(!mem.is_mapped());
        assert!(mem.as_slice().is_none());
        assert!(mem.gpu_addr() >= crate::platform::VAS_USER_START);

        let stats = sim.stats();
        assert_eq!(stats.buffers, 1);
        assert_eq!(stats.vas_mappings, 1);
        assert_eq!(stats.single_page_maps + stats.multi_page_maps, 0);

        free_device_memory(mem);
        assert_eq!(sim.stats().buffers, 0);
    }

    #[test]
    fn test_host_memory_technique_by_size() {
        let (sim, registry) = setup();
        let dev = registry.open(0).unwrap();
        let vas = Vas::new(&dev, 1 << 32).unwrap();

        let small = alloc_host_memory(&vas, PAGE_SIZE).unwrap();
        let large = alloc_host_memory(&vas, PAGE_SIZE + 1).unwrap();
        assert_eq!(small.map_technique(), Some(MapTechnique::SinglePage));
        assert_eq!(large.map_technique(), Some(MapTechnique::MultiPage));
        assert_eq!(sim.mapping_technique(small.buffer()), Some(MapTechnique::SinglePage));
        assert_eq!(sim.mapping_technique(large.buffer()), Some(MapTechnique::MultiPage));

        let stats = sim.stats();
        assert_eq!(stats.single_page_maps, 1);
        assert_eq!(stats.multi_page_maps, 1);

        // Teardown order of an unrelated object does not change the technique
        free_host_memory(large);
        free_host_memory(small);
        let stats = sim.stats();
        assert_eq!(stats.single_page_maps, 0);
        assert_eq!(stats.multi_page_maps, 0);
        assert_eq!(stats.technique_mismatches, 0);
        assert_eq!(stats.ordering_violations, 0);
    }

    #[test]
    fn test_host_memory_cpu_access() {
        let (_sim, registry) = setup();
        let dev = registry.open(0).unwrap();
        let vas = Vas::new(&dev, 1 << 32).unwrap();

        let mut mem = alloc_host_memory(&vas, 3 * PAGE_SIZE).unwrap();
        let data = mem.as_mut_slice().unwrap();
        assert_eq!(data.len(), 3 * PAGE_SIZE as usize);
        data[0] = 0xaa;
        data[2 * PAGE_SIZE as usize + 7] = 0x55;

        let view = mem.as_slice().unwrap();
        assert_eq!(view[0], 0xaa);
        assert_eq!(view[2 * PAGE_SIZE as usize + 7], 0x55);
    }

    #[test]
    fn test_zero_size_rejected() {
        let (sim, registry) = setup();
        let dev = registry.open(0).unwrap();
        let vas = Vas::new(&dev, 1 << 32).unwrap();
        assert!(matches!(alloc_host_memory(&vas, 0), Err(Error::InvalidParameter)));
        assert_eq!(sim.stats().buffers, 0);
    }

    #[test]
    fn test_oversized_allocation_rejected() {
        let (sim, registry) = setup();
        let dev = registry.open(0).unwrap();
        let vas = Vas::new(&dev, 1 << 40).unwrap();

        assert!(matches!(
            alloc_device_memory(&vas, u64::MAX - 100),
            Err(Error::AllocationFailure)
        ));
        assert!(matches!(
            alloc_host_memory(&vas, u64::MAX - (PAGE_SIZE - 1)),
            Err(Error::AllocationFailure)
        ));
        assert_eq!(vas.object_count(), 0);
        assert_eq!(sim.pool_usage(), (0, 0));

        // Later objects still get distinct, fully backed ranges
        let a = alloc_host_memory(&vas, 2 * PAGE_SIZE).unwrap();
        let b = alloc_host_memory(&vas, 2 * PAGE_SIZE).unwrap();
        assert_ne!(a.gpu_addr(), b.gpu_addr());
        assert_eq!(a.as_slice().map(<[u8]>::len), Some(2 * PAGE_SIZE as usize));
    }

    #[test]
    fn test_buffer_failure() {
        let (sim, registry) = setup();
        let dev = registry.open(0).unwrap();
        let vas = Vas::new(&dev, 1 << 32).unwrap();

        sim.fail_next(FailPoint::AllocateBuffer);
        assert!(matches!(alloc_device_memory(&vas, 0x1000), Err(Error::AllocationFailure)));
        assert_eq!(vas.object_count(), 0);
    }

    #[test]
    fn test_vas_map_failure_rolls_back() {
        let (sim, registry) = setup();
        let dev = registry.open(0).unwrap();
        let vas = Vas::new(&dev, 1 << 32).unwrap();

        sim.fail_next(FailPoint::MapIntoRange);
        assert!(matches!(alloc_host_memory(&vas, 0x1000), Err(Error::AllocationFailure)));
        let stats = sim.stats();
        assert_eq!(stats.buffers, 0);
        assert_eq!(stats.vas_mappings, 0);
        assert_eq!(vas.object_count(), 0);
    }

    #[test]
    fn test_cpu_map_failure_rolls_back() {
        let (sim, registry) = setup();
        let dev = registry.open(0).unwrap();
        let vas = Vas::new(&dev, 1 << 32).unwrap();

        sim.fail_next(FailPoint::MapPage);
        assert!(matches!(alloc_host_memory(&vas, 0x800), Err(Error::MappingFailure)));
        sim.fail_next(FailPoint::MapPages);
        assert!(matches!(alloc_host_memory(&vas, 0x8000), Err(Error::MappingFailure)));

        let stats = sim.stats();
        assert_eq!(stats.buffers, 0);
        assert_eq!(stats.vas_mappings, 0);
        assert_eq!(stats.ordering_violations, 0);
        assert_eq!(vas.object_count(), 0);
    }
}
