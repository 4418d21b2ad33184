//! The contract between the lock engines and their host.
//!
//! Queue blocks live in per-worker storage owned by the host, never in the
//! lock or in this crate. The engines address a block anywhere in the system
//! with a packed `(thread id, block index)` pair, the *tail code*, and leave
//! the actual resolution of that pair to an [`Adaptor`] implementation. The
//! host also provides the per-worker block counter and, for the write-write
//! lock, the single per-worker `waiting` flag that waiters spin on.
//!
//! See [`mock`] for an arena-backed implementation suitable for tests and
//! examples.
//!
//! [`mock`]: crate::mock

use crate::cfg::atomic::AtomicBool;
use crate::ww::McsWwBlock;

/// Identifies a worker thread. Occupies the upper half of a tail code.
pub type ThreadId = u16;

/// Identifies one lock acquisition within a worker, issued monotonically per
/// transaction. Zero is reserved as "none"; the first issued index is 1.
pub type BlockIndex = u16;

/// Packs a thread id and a block index into a 32-bit tail code.
#[inline]
pub const fn tail_code(id: ThreadId, index: BlockIndex) -> u32 {
    ((id as u32) << 16) | index as u32
}

/// The thread id half of a tail code.
#[inline]
pub const fn tail_thread_id(code: u32) -> ThreadId {
    (code >> 16) as ThreadId
}

/// The block index half of a tail code.
#[inline]
pub const fn tail_block_index(code: u32) -> BlockIndex {
    code as BlockIndex
}

/// Host interface handing out and resolving queue blocks.
///
/// An adaptor instance represents one worker thread. All engines are
/// parameterized by an adaptor so that the same protocol code runs against
/// any block storage scheme the host chooses; resolution must be stable for
/// as long as any issued block may still be referenced by a peer.
///
/// # Contract
///
/// - `issue_new_block` is monotonic within a worker and never returns 0 nor
///   wraps past `0xFFFE` within one transaction epoch.
/// - A block resolved through `other_*` may be observed by any thread while
///   its index is at most the issuer's `current_block_index`.
/// - A worker has at most one in-flight acquisition at any instant: a single
///   `waiting` flag and a single newest pending block participate in the
///   hand-off and cancellation protocols.
pub trait Adaptor {
    /// The reader-writer block type this host stores, either
    /// [`McsRwSimpleBlock`] or [`McsRwExtendedBlock`].
    ///
    /// [`McsRwSimpleBlock`]: crate::rw::simple::McsRwSimpleBlock
    /// [`McsRwExtendedBlock`]: crate::rw::extended::McsRwExtendedBlock
    type RwBlock;

    /// This worker's thread id.
    fn my_id(&self) -> ThreadId;

    /// Issues a fresh block index for the next acquisition.
    fn issue_new_block(&self) -> BlockIndex;

    /// The most recently issued block index of this worker.
    fn current_block_index(&self) -> BlockIndex;

    /// The most recently issued block index of another worker.
    fn other_current_block_index(&self, id: ThreadId) -> BlockIndex;

    /// Resolves one of this worker's write-write blocks.
    fn my_ww_block(&self, index: BlockIndex) -> &McsWwBlock;

    /// Resolves a write-write block of any worker.
    fn other_ww_block(&self, id: ThreadId, index: BlockIndex) -> &McsWwBlock;

    /// Resolves one of this worker's reader-writer blocks.
    fn my_rw_block(&self, index: BlockIndex) -> &Self::RwBlock;

    /// Resolves a reader-writer block of any worker.
    fn other_rw_block(&self, id: ThreadId, index: BlockIndex) -> &Self::RwBlock;

    /// This worker's write-write waiting flag.
    fn me_waiting(&self) -> &AtomicBool;

    /// Another worker's write-write waiting flag.
    fn other_waiting(&self, id: ThreadId) -> &AtomicBool;

    /// Resolves a reader-writer block from a packed tail code.
    #[inline]
    fn dereference_rw_tail(&self, code: u32) -> &Self::RwBlock {
        self.other_rw_block(tail_thread_id(code), tail_block_index(code))
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{tail_block_index, tail_code, tail_thread_id};

    #[test]
    fn tail_code_packing() {
        assert_eq!(tail_code(0, 0), 0);
        assert_eq!(tail_code(0x1234, 0x5678), 0x1234_5678);
        assert_eq!(tail_thread_id(0x1234_5678), 0x1234);
        assert_eq!(tail_block_index(0x1234_5678), 0x5678);
        // The guest sentinel must never collide with a real pair: it decodes
        // to the all-ones thread id, which the host never assigns.
        assert_eq!(tail_code(0xFFFF, 0xFFFF), u32::MAX);
    }
}
