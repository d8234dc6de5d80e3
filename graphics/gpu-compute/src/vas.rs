//! Virtual address spaces
//!
//! A [`Vas`] owns one platform virtual space and tracks the memory objects
//! and contexts living in it. Objects and contexts keep the space alive
//! through a shared handle, so the platform space is only released once the
//! last of them is gone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::device::DeviceHandle;
use crate::platform::{DomainFlags, Platform, VspaceHandle};
use crate::{Error, Result};

/// Key of a memory object inside its address space
pub type MemId = u64;

/// Snapshot of one memory object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    /// Key inside the address space
    pub id: MemId,
    /// GPU virtual address
    pub gpu_addr: u64,
    /// Requested size in bytes
    pub size: u64,
    /// Memory domain
    pub flags: DomainFlags,
}

/// State guarded by the per-VAS lock
pub(crate) struct VasState {
    pub(crate) objects: BTreeMap<MemId, MemInfo>,
    pub(crate) contexts: usize,
    next_id: MemId,
}

impl VasState {
    pub(crate) fn next_id(&mut self) -> MemId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

pub(crate) struct VasShared {
    device: DeviceHandle,
    vspace: VspaceHandle,
    size: u64,
    state: Mutex<VasState>,
}

impl VasShared {
    pub(crate) fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub(crate) fn platform(&self) -> &Arc<dyn Platform> {
        self.device.platform()
    }

    pub(crate) fn vspace(&self) -> VspaceHandle {
        self.vspace
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VasState> {
        self.state.lock()
    }
}

impl Drop for VasShared {
    fn drop(&mut self) {
        log::debug!("Releasing vspace {:?}", self.vspace);
        self.device.platform().vspace_unref(self.vspace);
    }
}

/// GPU virtual address space
pub struct Vas {
    shared: Arc<VasShared>,
}

impl Vas {
    /// Create an address space of `size` bytes on `device`
    pub fn new(device: &DeviceHandle, size: u64) -> Result<Self> {
        let vspace = device.platform().vspace_new(size).map_err(|e| {
            log::warn!("Failed to create vspace of {} bytes: {}", size, e);
            Error::AllocationFailure
        })?;

        log::info!("gpu{}: new VAS {:?} ({} bytes)", device.index(), vspace, size);

        Ok(Self {
            shared: Arc::new(VasShared {
                device: device.clone(),
                vspace,
                size,
                state: Mutex::new(VasState {
                    objects: BTreeMap::new(),
                    contexts: 0,
                    next_id: 1,
                }),
            }),
        })
    }

    /// Free the address space
    ///
    /// While memory objects or contexts still live in it the handle is
    /// handed back together with [`Error::ResourceInUse`] and nothing is
    /// released.
    pub fn free(self) -> Result<(), (Self, Error)> {
        let in_use = {
            let state = self.shared.lock();
            let in_use = !state.objects.is_empty() || state.contexts > 0;
            if in_use {
                log::warn!(
                    "VAS {:?} still holds {} object(s) and {} context(s)",
                    self.shared.vspace,
                    state.objects.len(),
                    state.contexts
                );
            }
            in_use
        };
        if in_use {
            return Err((self, Error::ResourceInUse));
        }

        log::info!("Freeing VAS {:?}", self.shared.vspace);
        Ok(())
    }

    /// Device the space was created on
    pub fn device(&self) -> &DeviceHandle {
        &self.shared.device
    }

    /// Platform virtual space handle
    pub fn vspace(&self) -> VspaceHandle {
        self.shared.vspace
    }

    /// Requested size in bytes
    pub fn size(&self) -> u64 {
        self.shared.size
    }

    /// Snapshot of the memory objects mapped into this space
    pub fn objects(&self) -> Vec<MemInfo> {
        self.shared.lock().objects.values().copied().collect()
    }

    /// Number of live memory objects
    pub fn object_count(&self) -> usize {
        self.shared.lock().objects.len()
    }

    /// Number of live contexts
    pub fn context_count(&self) -> usize {
        self.shared.lock().contexts
    }

    pub(crate) fn shared(&self) -> &Arc<VasShared> {
        &self.shared
    }
}

impl fmt::Debug for Vas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vas")
            .field("vspace", &self.shared.vspace)
            .field("size", &self.shared.size)
            .finish()
    }
}
