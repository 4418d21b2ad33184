//! Reader-writer MCS locks.
//!
//! Two engines share the same 64-bit lock word: [`simple`], which supports
//! unconditional, try and (degenerate) async acquisition, and [`extended`],
//! which adds timeouts and mid-queue cancellation. A host picks one flavor
//! per lock by the block type its [`Adaptor`] stores; the engines never mix.
//!
//! [`Adaptor`]: crate::adaptor::Adaptor

use core::sync::atomic::Ordering::{Acquire, Relaxed, SeqCst};

use crate::adaptor::{BlockIndex, ThreadId};
use crate::cfg::atomic::AtomicU64;

pub mod extended;
pub mod simple;

/// `next_writer` value when no writer is parked waiting for readers to drain.
pub const NEXT_WRITER_NONE: ThreadId = 0xFFFF;

const TAIL_MASK: u64 = 0xFFFF_FFFF;
const NREADERS_SHIFT: u32 = 32;
const NREADERS_UNIT: u64 = 1 << NREADERS_SHIFT;
const NREADERS_MASK: u64 = 0xFFFF << NREADERS_SHIFT;
const NEXT_WRITER_SHIFT: u32 = 48;
const NEXT_WRITER_MASK: u64 = 0xFFFF << NEXT_WRITER_SHIFT;

/// The lock word value of a fully released lock.
const EMPTY_WORD: u64 = (NEXT_WRITER_NONE as u64) << NEXT_WRITER_SHIFT;

pub(crate) const fn word_tail(word: u64) -> u32 {
    (word & TAIL_MASK) as u32
}

pub(crate) const fn word_nreaders(word: u64) -> u16 {
    ((word & NREADERS_MASK) >> NREADERS_SHIFT) as u16
}

pub(crate) const fn word_next_writer(word: u64) -> ThreadId {
    (word >> NEXT_WRITER_SHIFT) as ThreadId
}

/// Composes a whole lock word from its three subfields.
pub(crate) const fn make_word(tail: u32, nreaders: u16, next_writer: ThreadId) -> u64 {
    tail as u64 | ((nreaders as u64) << NREADERS_SHIFT) | ((next_writer as u64) << NEXT_WRITER_SHIFT)
}

/// A reader-writer MCS lock word.
///
/// A single naturally-aligned 64-bit atomic cell packing three subfields,
/// loadable (and CAS-able) as one word:
///
/// - bits 0..32: `tail`, the tail code of the queue tail, zero if the queue
///   is empty;
/// - bits 32..48: `nreaders`, the count of currently granted readers;
/// - bits 48..64: `next_writer`, the thread id of a writer parked waiting
///   for readers to drain, or [`NEXT_WRITER_NONE`].
///
/// Subfield updates are whole-word read-modify-writes that leave the other
/// subfields untouched; weak compare-exchanges only ever run inside retry
/// loops.
#[derive(Debug)]
#[repr(transparent)]
pub struct McsRwLock {
    word: AtomicU64,
}

impl McsRwLock {
    /// Creates a new unlocked lock word.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub const fn new() -> Self {
        Self { word: AtomicU64::new(EMPTY_WORD) }
    }

    /// Creates a new unlocked lock word with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self { word: AtomicU64::new(EMPTY_WORD) }
    }

    /// Returns `true` if any reader or writer currently holds or waits for
    /// the lock.
    ///
    /// This method does not provide any synchronization guarantees, so its
    /// only useful as a heuristic, and so must be considered not up to date.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(Relaxed) != EMPTY_WORD
    }

    /// The count of currently granted readers.
    #[inline]
    pub fn nreaders(&self) -> u16 {
        word_nreaders(self.word.load(Acquire))
    }

    /// Whole-word snapshot.
    pub(crate) fn snapshot(&self) -> u64 {
        self.word.load(Acquire)
    }

    /// Single-shot weak CAS over the whole word.
    pub(crate) fn cas_word_weak(&self, expected: u64, desired: u64) -> bool {
        self.word.compare_exchange_weak(expected, desired, SeqCst, Acquire).is_ok()
    }

    pub(crate) fn tail(&self) -> u32 {
        word_tail(self.word.load(Acquire))
    }

    /// Atomically replaces the tail subfield, returning the previous tail.
    /// This is the enqueue linearization point.
    pub(crate) fn xchg_tail(&self, tail: u32) -> u32 {
        let mut cur = self.word.load(Relaxed);
        loop {
            let new = (cur & !TAIL_MASK) | u64::from(tail);
            match self.word.compare_exchange_weak(cur, new, SeqCst, Relaxed) {
                Ok(_) => return word_tail(cur),
                Err(observed) => cur = observed,
            }
        }
    }

    /// CASes the tail subfield only; the other subfields may change
    /// concurrently without failing the operation.
    pub(crate) fn cas_tail(&self, expected: u32, desired: u32) -> bool {
        let mut cur = self.word.load(Relaxed);
        loop {
            if word_tail(cur) != expected {
                return false;
            }
            let new = (cur & !TAIL_MASK) | u64::from(desired);
            match self.word.compare_exchange_weak(cur, new, SeqCst, Relaxed) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Increments `nreaders`, returning the previous count.
    pub(crate) fn increment_nreaders(&self) -> u16 {
        let prev = self.word.fetch_add(NREADERS_UNIT, SeqCst);
        debug_assert!(word_nreaders(prev) < u16::MAX);
        word_nreaders(prev)
    }

    /// Decrements `nreaders`, returning the previous count.
    pub(crate) fn decrement_nreaders(&self) -> u16 {
        let prev = self.word.fetch_sub(NREADERS_UNIT, SeqCst);
        debug_assert!(word_nreaders(prev) > 0);
        word_nreaders(prev)
    }

    pub(crate) fn next_writer(&self) -> ThreadId {
        word_next_writer(self.word.load(Acquire))
    }

    /// Blindly replaces the `next_writer` subfield.
    pub(crate) fn set_next_writer(&self, id: ThreadId) {
        self.xchg_next_writer(id);
    }

    /// Replaces the `next_writer` subfield, returning the previous value.
    pub(crate) fn xchg_next_writer(&self, id: ThreadId) -> ThreadId {
        let mut cur = self.word.load(Relaxed);
        loop {
            let new = (cur & !NEXT_WRITER_MASK) | ((id as u64) << NEXT_WRITER_SHIFT);
            match self.word.compare_exchange_weak(cur, new, SeqCst, Relaxed) {
                Ok(_) => return word_next_writer(cur),
                Err(observed) => cur = observed,
            }
        }
    }

    /// CASes the `next_writer` subfield only.
    pub(crate) fn cas_next_writer(&self, expected: ThreadId, desired: ThreadId) -> bool {
        let mut cur = self.word.load(Relaxed);
        loop {
            if word_next_writer(cur) != expected {
                return false;
            }
            let new = (cur & !NEXT_WRITER_MASK) | ((desired as u64) << NEXT_WRITER_SHIFT);
            match self.word.compare_exchange_weak(cur, new, SeqCst, Relaxed) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }
}

impl Default for McsRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound on how long an extended-lock acquisition may wait before it turns
/// into a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until granted, however long that takes.
    Never,
    /// Check exactly once; if not granted, leave the block queued and report
    /// [`AcquireResult::Requested`]. This is the asynchronous-acquire mode.
    Immediate,
    /// Spin for at most this many probes before cancelling.
    Spins(u32),
}

/// Outcome of an extended-lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// The lock is held; the block must eventually be released.
    Granted,
    /// The block is queued but not granted; the caller must later retry it
    /// to grant, or cancel it.
    Requested,
    /// The block has been withdrawn from the queue without ownership.
    Cancelled,
}

/// Result of an asynchronous acquisition: the issued block together with
/// whether it was granted on the spot.
///
/// When `acquired` is `false` the block is enqueued and the caller owes it a
/// [`retry_async`] that returns `true` followed by a release, or a
/// [`cancel_async`], before its adaptor may be torn down.
///
/// [`retry_async`]: extended::McsRwExtended::retry_async_reader
/// [`cancel_async`]: extended::McsRwExtended::cancel_async_reader
#[derive(Debug, Clone, Copy)]
pub struct AcquireAsync {
    /// Whether the lock was granted immediately.
    pub acquired: bool,
    /// The issued block index backing this acquisition.
    pub block_index: BlockIndex,
}

#[cfg(all(not(loom), test))]
mod test {
    use super::*;

    #[test]
    fn word_layout() {
        assert_eq!(core::mem::size_of::<McsRwLock>(), 8);
        assert_eq!(core::mem::align_of::<McsRwLock>(), 8);
        assert_eq!(EMPTY_WORD, 0xFFFF_0000_0000_0000);
        assert_eq!(make_word(0xAAAA_BBBB, 0xCCCC, 0xDDDD), 0xDDDD_CCCC_AAAA_BBBB);
        assert_eq!(word_tail(0xDDDD_CCCC_AAAA_BBBB), 0xAAAA_BBBB);
        assert_eq!(word_nreaders(0xDDDD_CCCC_AAAA_BBBB), 0xCCCC);
        assert_eq!(word_next_writer(0xDDDD_CCCC_AAAA_BBBB), 0xDDDD);
    }

    #[test]
    fn subfield_ops_do_not_clobber() {
        let lock = McsRwLock::new();
        assert!(!lock.is_locked());

        assert_eq!(lock.xchg_tail(0x0001_0002), 0);
        assert_eq!(lock.increment_nreaders(), 0);
        assert_eq!(lock.increment_nreaders(), 1);
        assert_eq!(lock.next_writer(), NEXT_WRITER_NONE);
        assert!(lock.cas_next_writer(NEXT_WRITER_NONE, 7));
        assert!(!lock.cas_next_writer(NEXT_WRITER_NONE, 8));

        assert_eq!(lock.tail(), 0x0001_0002);
        assert_eq!(lock.nreaders(), 2);
        assert_eq!(lock.next_writer(), 7);

        assert_eq!(lock.decrement_nreaders(), 2);
        assert_eq!(lock.decrement_nreaders(), 1);
        assert_eq!(lock.xchg_next_writer(NEXT_WRITER_NONE), 7);
        assert!(lock.cas_tail(0x0001_0002, 0));
        assert!(!lock.is_locked());
    }

    #[test]
    fn whole_word_cas() {
        let lock = McsRwLock::new();
        let desired = make_word(0x0003_0004, 1, NEXT_WRITER_NONE);
        // Weak CAS may fail spuriously; it must succeed within a few tries
        // on any platform this test runs on.
        let mut done = false;
        for _ in 0..1000 {
            if lock.cas_word_weak(EMPTY_WORD, desired) {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(lock.snapshot(), desired);
        assert_eq!(lock.tail(), 0x0003_0004);
        assert_eq!(lock.nreaders(), 1);
    }
}
