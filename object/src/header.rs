use std::sync::atomic::{AtomicU8, Ordering};

use crate::types::TypeId;

/// Size of the GC header preceding every object payload.
pub const GC_HEADER_BYTES: u64 = 8;

/// GC-managed prefix of a hybrid object: an 8-byte var-length word
/// followed by the 8-byte header.
pub const HYBRID_HEADER_BYTES: u64 = 16;

const MARK_BIT: u8 = 1 << 0;

/// The 8-byte header at `payload - 8` of every heap object.
///
/// ```text
/// bytes 0‥4: type id (index into the heap's TypeTable)
/// byte  4:   flags (atomic) — bit 0 = mark
/// bytes 5‥8: reserved (zero)
/// ```
///
/// For hybrids the 8 bytes at `payload - 16` hold the var-part length.
#[repr(C)]
pub struct Header {
    type_id: u32,
    flags: AtomicU8,
    _reserved: [u8; 3],
}

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    pub fn new(type_id: TypeId) -> Self {
        Self {
            type_id: type_id.0,
            flags: AtomicU8::new(0),
            _reserved: [0; 3],
        }
    }

    #[inline(always)]
    pub fn type_id(&self) -> TypeId {
        TypeId(self.type_id)
    }

    // The mark bit is only written by the collector while every mutator
    // is stopped at the safepoint, so relaxed ordering suffices.

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & MARK_BIT != 0
    }

    #[inline(always)]
    pub fn set_mark(&self) {
        self.flags.fetch_or(MARK_BIT, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn clear_mark(&self) {
        self.flags.fetch_and(!MARK_BIT, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type_id", &self.type_id)
            .field("marked", &self.is_marked())
            .finish()
    }
}
