//! Command rings
//!
//! Both rings of a context share [`RingCursor`]: a power-of-two ring with a
//! `put` cursor owned by software and a `get` cursor reported back by the
//! hardware. One slot is always left free, so `put == get` means empty and
//! `advance(put) == get` means full. All cursor arithmetic goes through the
//! stored mask.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::memory::MappedBacking;
use crate::platform::{BufferHandle, MapTechnique, Platform, VspaceHandle};
use crate::{Error, Result};

/// Size of one indirect buffer entry
pub const IB_ENTRY_SIZE: u64 = 8;

/// Largest order a cursor can mask
pub const MAX_RING_ORDER: u32 = 31;

/// Put/get cursors of a power-of-two ring
#[derive(Debug)]
pub struct RingCursor {
    order: u32,
    mask: u32,
    put: AtomicU32,
    get: AtomicU32,
}

impl RingCursor {
    /// Cursor pair for a ring of `2^order` slots
    ///
    /// Orders above [`MAX_RING_ORDER`] are rejected with
    /// [`Error::InvalidParameter`].
    pub fn new(order: u32) -> Result<Self> {
        if order > MAX_RING_ORDER {
            return Err(Error::InvalidParameter);
        }

        Ok(Self {
            order,
            mask: (1u32 << order) - 1,
            put: AtomicU32::new(0),
            get: AtomicU32::new(0),
        })
    }

    /// log2 of the slot count
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Slot count minus one
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Number of slots
    pub fn capacity(&self) -> u64 {
        u64::from(self.mask) + 1
    }

    /// Slot following `cursor`
    pub fn advance(&self, cursor: u32) -> u32 {
        self.advance_by(cursor, 1)
    }

    /// Slot `n` positions after `cursor`
    pub fn advance_by(&self, cursor: u32, n: u32) -> u32 {
        cursor.wrapping_add(n) & self.mask
    }

    /// Last published put
    pub fn put(&self) -> u32 {
        self.put.load(Ordering::Acquire)
    }

    /// Last reported get
    pub fn get(&self) -> u32 {
        self.get.load(Ordering::Acquire)
    }

    /// Publish a new put, masked into the ring
    ///
    /// Release ordering makes every slot write before it visible to whoever
    /// observes the new value.
    pub fn publish_put(&self, put: u32) {
        self.put.store(put & self.mask, Ordering::Release);
    }

    /// Record the consumer position reported by the hardware, masked into
    /// the ring
    pub fn update_get(&self, get: u32) {
        self.get.store(get & self.mask, Ordering::Release);
    }

    /// Slots between `get` and `cursor`
    pub fn used_from(&self, cursor: u32) -> u32 {
        cursor.wrapping_sub(self.get()) & self.mask
    }

    /// Slots still writable after `cursor`
    pub fn free_from(&self, cursor: u32) -> u32 {
        self.mask - self.used_from(cursor)
    }

    /// `put == get`
    pub fn is_empty(&self) -> bool {
        self.put() == self.get()
    }

    /// Advancing `put` would reach `get`
    pub fn is_full(&self) -> bool {
        self.advance(self.put()) == self.get()
    }
}

/// Indirect buffer ring
///
/// Each 8-byte entry references one command segment.
pub struct IndirectRing {
    backing: MappedBacking,
    cursor: RingCursor,
}

impl IndirectRing {
    pub(crate) fn new(
        platform: &Arc<dyn Platform>,
        vspace: VspaceHandle,
        order: u32,
    ) -> Result<Self> {
        let cursor = RingCursor::new(order)?;
        let size = IB_ENTRY_SIZE << order;
        let backing = MappedBacking::new(platform, vspace, size, MapTechnique::MultiPage)?;

        Ok(Self { backing, cursor })
    }

    /// GPU base address
    pub fn base(&self) -> u64 {
        self.backing.gpu_addr()
    }

    /// log2 of the entry count
    pub fn order(&self) -> u32 {
        self.cursor.order()
    }

    /// Entry count minus one
    pub fn mask(&self) -> u32 {
        self.cursor.mask()
    }

    /// Next entry the CPU writes
    pub fn put(&self) -> u32 {
        self.cursor.put()
    }

    /// Next entry the hardware reads
    pub fn get(&self) -> u32 {
        self.cursor.get()
    }

    /// Put/get state
    pub fn cursor(&self) -> &RingCursor {
        &self.cursor
    }

    /// Platform buffer holding the entries
    pub fn buffer(&self) -> BufferHandle {
        self.backing.buffer()
    }

    fn slots(&self) -> *mut u64 {
        self.backing.ptr().as_ptr().cast::<u64>()
    }

    /// Append an entry and publish it
    pub fn push(&mut self, entry: u64) -> Result<()> {
        let put = self.cursor.put();
        let next = self.cursor.advance(put);
        if next == self.cursor.get() {
            return Err(Error::RingFull);
        }

        unsafe { core::ptr::write_volatile(self.slots().add(put as usize), entry) };
        self.cursor.publish_put(next);
        Ok(())
    }

    /// Entry stored in slot `index`
    pub fn entry(&self, index: u32) -> u64 {
        let slot = index & self.cursor.mask();
        unsafe { core::ptr::read_volatile(self.slots().add(slot as usize)) }
    }

    /// Record the hardware's consumer position
    pub fn update_get(&self, get: u32) {
        self.cursor.update_get(get);
    }
}

/// Push buffer ring holding the command stream
///
/// Cursors count bytes. Words are staged at `pos` and become visible to the
/// consumer on [`PushRing::flush`].
pub struct PushRing {
    backing: MappedBacking,
    cursor: RingCursor,
    size: u64,
    pos: u32,
}

impl PushRing {
    pub(crate) fn new(
        platform: &Arc<dyn Platform>,
        vspace: VspaceHandle,
        order: u32,
    ) -> Result<Self> {
        let cursor = RingCursor::new(order)?;
        let size = 1u64 << order;
        let backing = MappedBacking::new(platform, vspace, size, MapTechnique::MultiPage)?;

        Ok(Self {
            backing,
            cursor,
            size,
            pos: 0,
        })
    }

    /// GPU base address
    pub fn base(&self) -> u64 {
        self.backing.gpu_addr()
    }

    /// log2 of the size in bytes
    pub fn order(&self) -> u32 {
        self.cursor.order()
    }

    /// Size in bytes minus one
    pub fn mask(&self) -> u32 {
        self.cursor.mask()
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write position
    pub fn pos(&self) -> u32 {
        self.pos
    }

    /// Byte offset published to the hardware
    pub fn put(&self) -> u32 {
        self.cursor.put()
    }

    /// Byte offset the hardware has consumed up to
    pub fn get(&self) -> u32 {
        self.cursor.get()
    }

    /// Put/get state
    pub fn cursor(&self) -> &RingCursor {
        &self.cursor
    }

    /// Platform buffer holding the command stream
    pub fn buffer(&self) -> BufferHandle {
        self.backing.buffer()
    }

    fn bytes(&self) -> *mut u8 {
        self.backing.ptr().as_ptr()
    }

    /// Stage `words` at the write position
    pub fn write(&mut self, words: &[u32]) -> Result<()> {
        let bytes = words.len() as u64 * 4;
        if bytes > u64::from(self.cursor.free_from(self.pos)) {
            return Err(Error::RingFull);
        }

        for &word in words {
            unsafe {
                let slot = self.bytes().add(self.pos as usize).cast::<u32>();
                core::ptr::write_volatile(slot, word);
            }
            self.pos = self.cursor.advance_by(self.pos, 4);
        }
        Ok(())
    }

    /// Publish staged words, returning the new put
    pub fn flush(&mut self) -> u32 {
        self.cursor.publish_put(self.pos);
        self.pos
    }

    /// Word at byte offset `offset`
    pub fn word(&self, offset: u32) -> u32 {
        let offset = offset & self.cursor.mask() & !3;
        unsafe { core::ptr::read_volatile(self.bytes().add(offset as usize).cast::<u32>()) }
    }

    /// Record the hardware's consumer position
    pub fn update_get(&self, get: u32) {
        self.cursor.update_get(get);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks() {
        assert_eq!(RingCursor::new(9).unwrap().mask(), 511);
        assert_eq!(RingCursor::new(20).unwrap().mask(), (1 << 20) - 1);
        assert_eq!(RingCursor::new(9).unwrap().capacity(), 512);
    }

    #[test]
    fn test_order_bounds() {
        assert_eq!(RingCursor::new(MAX_RING_ORDER).unwrap().mask(), u32::MAX >> 1);
        assert_eq!(
            RingCursor::new(MAX_RING_ORDER + 1).err(),
            Some(Error::InvalidParameter)
        );
        assert!(RingCursor::new(u32::MAX).is_err());
    }

    #[test]
    fn test_out_of_range_cursor_is_masked() {
        let ring = RingCursor::new(3).unwrap();
        ring.publish_put(9);
        ring.update_get(15);
        assert_eq!(ring.put(), 1);
        assert_eq!(ring.get(), 7);
    }

    #[test]
    fn test_advance_wraps() {
        let ring = RingCursor::new(9).unwrap();
        assert_eq!(ring.advance(0), 1);
        assert_eq!(ring.advance(510), 511);
        assert_eq!(ring.advance(511), 0);
        for cursor in 0..=ring.mask() {
            let next = ring.advance(cursor);
            assert_eq!(next, (cursor + 1) & ring.mask());
            assert!(next <= ring.mask());
        }
        assert_eq!(ring.advance_by(508, 8), 4);
    }

    #[test]
    fn test_full_keeps_one_slot() {
        let ring = RingCursor::new(2).unwrap();
        assert!(ring.is_empty());
        assert_eq!(ring.free_from(ring.put()), 3);

        ring.publish_put(3);
        assert!(ring.is_full());
        assert_eq!(ring.free_from(ring.put()), 0);

        ring.update_get(2);
        assert!(!ring.is_full());
        assert_eq!(ring.used_from(ring.put()), 1);

        ring.update_get(3);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_cursors_stay_masked() {
        let ring = RingCursor::new(4).unwrap();
        let mut put = 0;
        for _ in 0..100 {
            put = ring.advance(put);
            ring.publish_put(put);
            ring.update_get(put);
            assert!(ring.put() <= ring.mask());
            assert!(ring.get() <= ring.mask());
        }
    }
}
