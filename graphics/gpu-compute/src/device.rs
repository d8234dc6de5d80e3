//! GPU device management

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::backend::{BackendTable, ComputeBackend, Generation, QueryParam};
use crate::platform::Platform;
use crate::{Error, Result};

/// One physical GPU
pub struct Device {
    index: usize,
    chipset: u32,
    generation: Generation,
    platform: Arc<dyn Platform>,
    backend: Option<Arc<dyn ComputeBackend>>,
    use_count: AtomicU32,
}

impl Device {
    fn new(index: usize, platform: Arc<dyn Platform>, backends: &BackendTable) -> Self {
        let chipset = platform.chipset();
        let generation = Generation::from_chipset(chipset);
        let backend = backends.lookup(generation);

        match &backend {
            Some(backend) => log::info!(
                "gpu{}: NV{:x} ({:?}) using {}",
                index,
                chipset,
                generation,
                backend.name()
            ),
            None => log::warn!("gpu{}: NV{:x} has no compute backend", index, chipset),
        }

        Self {
            index,
            chipset,
            generation,
            platform,
            backend,
            use_count: AtomicU32::new(0),
        }
    }

    /// Position in the registry
    pub fn index(&self) -> usize {
        self.index
    }

    /// Chipset identifier reported by the platform
    pub fn chipset(&self) -> u32 {
        self.chipset
    }

    /// Hardware generation decoded from the chipset
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Platform the device is driven through
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Compute backend, if the generation is supported
    pub fn backend(&self) -> Option<&Arc<dyn ComputeBackend>> {
        self.backend.as_ref()
    }

    /// Number of open handles
    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    pub(crate) fn supported_backend(&self) -> Result<&Arc<dyn ComputeBackend>> {
        self.backend.as_ref().ok_or_else(|| {
            log::error!("NV{:x} not supported", self.chipset);
            Error::UnsupportedHardware
        })
    }

    /// Initialize the compute engine
    pub fn compute_init(&self) -> Result<()> {
        self.supported_backend()?.init(self)
    }

    /// Query a device parameter by id
    pub fn query(&self, param_id: u32) -> Result<u64> {
        let param = QueryParam::try_from(param_id)?;
        self.supported_backend()?.query(self, param)
    }
}

/// Open reference to a [`Device`]
///
/// Holding a handle keeps the use-count raised; dropping it closes the device.
pub struct DeviceHandle {
    device: Arc<Device>,
}

impl DeviceHandle {
    fn acquire(device: &Arc<Device>) -> Self {
        device.use_count.fetch_add(1, Ordering::AcqRel);
        Self {
            device: Arc::clone(device),
        }
    }

    /// Close the device
    pub fn close(self) {}

    pub(crate) fn same_device(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.device, &other.device)
    }
}

impl Clone for DeviceHandle {
    fn clone(&self) -> Self {
        Self::acquire(&self.device)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.device.use_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Deref for DeviceHandle {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

/// Table of the devices known to the process
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
}

impl DeviceRegistry {
    /// Build the registry, one device per platform
    pub fn new(platforms: Vec<Arc<dyn Platform>>, backends: &BackendTable) -> Self {
        let devices = platforms
            .into_iter()
            .enumerate()
            .map(|(index, platform)| Arc::new(Device::new(index, platform, backends)))
            .collect::<Vec<_>>();

        log::info!("Device registry initialized with {} device(s)", devices.len());

        Self { devices }
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// No devices are registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device at `index` without opening it
    pub fn device(&self, index: usize) -> Option<&Arc<Device>> {
        self.devices.get(index)
    }

    /// Open the device at `index`
    pub fn open(&self, index: usize) -> Result<DeviceHandle> {
        self.devices
            .get(index)
            .map(DeviceHandle::acquire)
            .ok_or(Error::DeviceNotFound)
    }

    /// Tear the registry down
    ///
    /// Fails while any device is still open. Afterwards the registry is empty.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(busy) = self.devices.iter().find(|d| d.use_count() > 0) {
            log::warn!(
                "gpu{}: still open ({} handle(s)), refusing shutdown",
                busy.index,
                busy.use_count()
            );
            return Err(Error::ResourceInUse);
        }

        self.devices.clear();
        log::info!("Device registry shut down");
        Ok(())
    }
}
