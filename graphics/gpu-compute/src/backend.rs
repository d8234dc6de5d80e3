//! Compute engine backends
//!
//! A backend knows how to bring up the compute engine of one hardware
//! generation. Devices pick their backend from a [`BackendTable`] keyed by
//! [`Generation`]; a generation without an entry is unsupported.

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::RwLock;

use crate::context::Context;
use crate::device::Device;
use crate::platform::PlatformParam;
use crate::{Error, Result};

/// Query id for the multiprocessor count
pub const QUERY_MP_COUNT: u32 = 1;

/// GPU hardware generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Generation {
    /// NV50 (Tesla)
    Nv50,
    /// NV80 family
    Nv80,
    /// NV90 family
    Nv90,
    /// NVA0 family
    Nva0,
    /// NVC0 (Fermi)
    Nvc0,
    /// Unrecognized family bits
    Unknown(u32),
}

impl Generation {
    /// Decode the family of a chipset identifier
    pub fn from_chipset(chipset: u32) -> Self {
        match chipset & 0xf0 {
            0x50 => Generation::Nv50,
            0x80 => Generation::Nv80,
            0x90 => Generation::Nv90,
            0xa0 => Generation::Nva0,
            0xc0 => Generation::Nvc0,
            family => Generation::Unknown(family),
        }
    }
}

/// Device parameter that can be queried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryParam {
    /// Number of multiprocessors
    MpCount,
}

impl TryFrom<u32> for QueryParam {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self> {
        match id {
            QUERY_MP_COUNT => Ok(QueryParam::MpCount),
            _ => Err(Error::InvalidParameter),
        }
    }
}

/// Generation-specific compute engine support
pub trait ComputeBackend: Send + Sync {
    /// Backend name
    fn name(&self) -> &'static str;

    /// One-time compute engine setup for a device
    fn init(&self, device: &Device) -> Result<()>;

    /// Program engine state of a freshly built context
    fn init_context(&self, context: &Context) -> Result<()>;

    /// Answer a device query
    fn query(&self, device: &Device, param: QueryParam) -> Result<u64>;
}

/// Generation to backend lookup table
pub struct BackendTable {
    backends: RwLock<BTreeMap<Generation, Arc<dyn ComputeBackend>>>,
}

impl BackendTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a table with the built-in backends
    pub fn with_defaults() -> Self {
        let table = Self::new();
        table.register(Generation::Nvc0, Arc::new(FermiCompute));
        table
    }

    /// Register a backend, returning the one it replaces
    pub fn register(
        &self,
        generation: Generation,
        backend: Arc<dyn ComputeBackend>,
    ) -> Option<Arc<dyn ComputeBackend>> {
        log::debug!("Registering {} backend for {:?}", backend.name(), generation);
        self.backends.write().insert(generation, backend)
    }

    /// Backend for a generation
    pub fn lookup(&self, generation: Generation) -> Option<Arc<dyn ComputeBackend>> {
        self.backends.read().get(&generation).cloned()
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    /// No backend is registered
    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }
}

impl Default for BackendTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// NVC0 compute backend
pub struct FermiCompute;

impl ComputeBackend for FermiCompute {
    fn name(&self) -> &'static str {
        "nvc0-compute"
    }

    fn init(&self, device: &Device) -> Result<()> {
        log::info!("NV{:x}: compute engine ready", device.chipset());
        Ok(())
    }

    fn init_context(&self, context: &Context) -> Result<()> {
        // Engine state is pushed through the PB by the submission path; the
        // channel only has to be registered at this point.
        crate::step_trace!(
            "nvc0: context on channel {:?}, IB at {:#x}",
            context.channel(),
            context.ib().base()
        );
        Ok(())
    }

    fn query(&self, device: &Device, param: QueryParam) -> Result<u64> {
        match param {
            QueryParam::MpCount => device.platform().get_param(PlatformParam::MpCount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_decode() {
        assert_eq!(Generation::from_chipset(0x50), Generation::Nv50);
        assert_eq!(Generation::from_chipset(0x84), Generation::Nv80);
        assert_eq!(Generation::from_chipset(0x98), Generation::Nv90);
        assert_eq!(Generation::from_chipset(0xa3), Generation::Nva0);
        assert_eq!(Generation::from_chipset(0xc1), Generation::Nvc0);
        assert_eq!(Generation::from_chipset(0xe4), Generation::Unknown(0xe0));
        assert_eq!(Generation::from_chipset(0x04), Generation::Unknown(0x00));
    }

    #[test]
    fn test_query_param_ids() {
        assert_eq!(QueryParam::try_from(QUERY_MP_COUNT), Ok(QueryParam::MpCount));
        assert_eq!(QueryParam::try_from(0), Err(Error::InvalidParameter));
        assert_eq!(QueryParam::try_from(0xffff), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_default_table() {
        let table = BackendTable::with_defaults();
        assert_eq!(table.len(), 1);
        assert!(table.lookup(Generation::Nvc0).is_some());
        assert!(table.lookup(Generation::Nv50).is_none());
        assert!(table.lookup(Generation::Unknown(0xe0)).is_none());
    }

    #[test]
    fn test_register_replaces() {
        let table = BackendTable::new();
        assert!(table.register(Generation::Nva0, Arc::new(FermiCompute)).is_none());
        assert!(table.register(Generation::Nva0, Arc::new(FermiCompute)).is_some());
        assert_eq!(table.len(), 1);
    }
}
