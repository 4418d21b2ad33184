//! Arena-backed [`Adaptor`] implementation for tests and examples.
//!
//! The arena owns one storage strip per worker thread: a fixed array of
//! write-write blocks, a fixed array of reader-writer blocks, the monotonic
//! block counter and the write-write waiting flag. Handles into the arena
//! implement [`Adaptor`] by plain indexing, which makes this the
//! "arena of thread-local blocks addressed by `(thread id, block index)`"
//! storage scheme in its most literal form.
//!
//! Hosts embedding the engines into their own worker runtime are expected
//! to provide their own adaptor; nothing in the engines depends on this
//! module.

use core::sync::atomic::Ordering::{Acquire, SeqCst};

use std::sync::Arc;
use std::vec::Vec;

use crate::adaptor::{Adaptor, BlockIndex, ThreadId};
use crate::cfg::atomic::{AtomicBool, AtomicU16};
use crate::rw::extended::McsRwExtendedBlock;
use crate::rw::simple::McsRwSimpleBlock;
use crate::ww::McsWwBlock;

/// A [`MockArena`] storing [`McsRwSimpleBlock`]s.
pub type SimpleArena = MockArena<McsRwSimpleBlock>;

/// A [`MockArena`] storing [`McsRwExtendedBlock`]s.
pub type ExtendedArena = MockArena<McsRwExtendedBlock>;

struct ThreadStorage<RW> {
    ww: Box<[McsWwBlock]>,
    rw: Box<[RW]>,
    current: AtomicU16,
    waiting: AtomicBool,
}

impl<RW: Default> ThreadStorage<RW> {
    fn new(capacity: usize) -> Self {
        // Slot zero stays unused: block index zero is reserved as "none".
        let slots = capacity + 1;
        let ww = (0..slots).map(|_| McsWwBlock::default()).collect();
        let rw = (0..slots).map(|_| RW::default()).collect();
        Self { ww, rw, current: AtomicU16::new(0), waiting: AtomicBool::new(false) }
    }
}

/// Shared block storage for a fixed set of worker threads.
///
/// Cloning is shallow; all clones refer to the same storage. Each worker
/// obtains its [`MockAdaptor`] handle through [`adaptor`].
///
/// [`adaptor`]: MockArena::adaptor
pub struct MockArena<RW> {
    threads: Arc<[ThreadStorage<RW>]>,
}

impl<RW> Clone for MockArena<RW> {
    fn clone(&self) -> Self {
        Self { threads: Arc::clone(&self.threads) }
    }
}

impl<RW: Default> MockArena<RW> {
    /// Creates an arena for `threads` workers, each with storage for
    /// `capacity` block issues.
    ///
    /// # Panics
    ///
    /// Panics if `threads` exceeds the thread id space or `capacity` the
    /// block index space.
    pub fn with_capacity(threads: usize, capacity: usize) -> Self {
        assert!(threads <= usize::from(ThreadId::MAX));
        assert!(capacity < usize::from(BlockIndex::MAX));
        let strips: Vec<_> = (0..threads).map(|_| ThreadStorage::new(capacity)).collect();
        Self { threads: strips.into() }
    }

    /// Returns the adaptor handle representing worker `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range for this arena.
    pub fn adaptor(&self, id: ThreadId) -> MockAdaptor<RW> {
        assert!(usize::from(id) < self.threads.len());
        MockAdaptor { id, threads: Arc::clone(&self.threads) }
    }
}

/// One worker's handle into a [`MockArena`].
pub struct MockAdaptor<RW> {
    id: ThreadId,
    threads: Arc<[ThreadStorage<RW>]>,
}

impl<RW> MockAdaptor<RW> {
    fn storage(&self, id: ThreadId) -> &ThreadStorage<RW> {
        &self.threads[usize::from(id)]
    }
}

impl<RW> Adaptor for MockAdaptor<RW> {
    type RwBlock = RW;

    fn my_id(&self) -> ThreadId {
        self.id
    }

    fn issue_new_block(&self) -> BlockIndex {
        let index = self.storage(self.id).current.fetch_add(1, SeqCst) + 1;
        assert!(usize::from(index) < self.storage(self.id).rw.len(), "block storage exhausted");
        index
    }

    fn current_block_index(&self) -> BlockIndex {
        self.storage(self.id).current.load(Acquire)
    }

    fn other_current_block_index(&self, id: ThreadId) -> BlockIndex {
        self.storage(id).current.load(Acquire)
    }

    fn my_ww_block(&self, index: BlockIndex) -> &McsWwBlock {
        &self.storage(self.id).ww[usize::from(index)]
    }

    fn other_ww_block(&self, id: ThreadId, index: BlockIndex) -> &McsWwBlock {
        &self.storage(id).ww[usize::from(index)]
    }

    fn my_rw_block(&self, index: BlockIndex) -> &Self::RwBlock {
        &self.storage(self.id).rw[usize::from(index)]
    }

    fn other_rw_block(&self, id: ThreadId, index: BlockIndex) -> &Self::RwBlock {
        &self.storage(id).rw[usize::from(index)]
    }

    fn me_waiting(&self) -> &AtomicBool {
        &self.storage(self.id).waiting
    }

    fn other_waiting(&self, id: ThreadId) -> &AtomicBool {
        &self.storage(id).waiting
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::SimpleArena;
    use crate::adaptor::Adaptor;

    #[test]
    fn issues_monotonic_indexes() {
        let arena = SimpleArena::with_capacity(2, 4);
        let adaptor = arena.adaptor(0);
        assert_eq!(adaptor.current_block_index(), 0);
        assert_eq!(adaptor.issue_new_block(), 1);
        assert_eq!(adaptor.issue_new_block(), 2);
        assert_eq!(adaptor.current_block_index(), 2);

        // Another worker's counter is independent but readable.
        let other = arena.adaptor(1);
        assert_eq!(other.issue_new_block(), 1);
        assert_eq!(adaptor.other_current_block_index(1), 1);
    }

    #[test]
    #[should_panic(expected = "block storage exhausted")]
    fn exhausting_block_storage_panics() {
        let arena = SimpleArena::with_capacity(1, 2);
        let adaptor = arena.adaptor(0);
        for _ in 0..3 {
            adaptor.issue_new_block();
        }
    }

    #[test]
    fn resolves_foreign_blocks() {
        let arena = SimpleArena::with_capacity(2, 4);
        let a0 = arena.adaptor(0);
        let a1 = arena.adaptor(1);
        a1.issue_new_block();
        // Same storage through either handle.
        let lhs = a0.other_rw_block(1, 1) as *const _;
        let rhs = a1.my_rw_block(1) as *const _;
        assert_eq!(lhs, rhs);
    }
}
