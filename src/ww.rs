//! Write-write exclusive MCS lock.
//!
//! The `ww` lock is fair, that is, it guarantees that threads that have
//! waited for longer will be granted first (FIFO). Each waiting thread spins
//! against its own worker-local `waiting` flag, which avoids the network
//! contention of probing a shared lock word.
//!
//! The lock word is a single 32-bit cell holding the tail code of the queue
//! tail, zero when unlocked, or the reserved [`MCS_GUEST_ID`] sentinel when
//! the holder is the owner-less *guest*: a path with no worker block
//! available (recovery and administrative code). Guest acquisition does not
//! enqueue; it spins on the word itself, and regular acquirers that collide
//! with a guest give the sentinel back and retry.
//!
//! Acquisition never fails and release is infallible. Both are generic over
//! the relax policy applied while spinning, see [`Relax`].
//!
//! [`Relax`]: crate::relax::Relax

use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};

use tracing::trace;

use crate::adaptor::{tail_block_index, tail_code, tail_thread_id, Adaptor, BlockIndex, ThreadId};
use crate::cfg::atomic::AtomicU32;
use crate::relax::{spin_until, Relax};

/// Tail code of the owner-less guest holder.
///
/// Decodes to the all-ones `(thread id, block index)` pair, which no host
/// ever issues.
pub const MCS_GUEST_ID: u32 = u32::MAX;

/// A write-write exclusive MCS lock word.
///
/// One 32-bit atomic cell: zero when unlocked, otherwise the tail code of
/// the last enqueued waiter (or [`MCS_GUEST_ID`]). The word must be 4-byte
/// aligned, which the type guarantees; hosts embed it freely in their own
/// record structures.
#[derive(Debug)]
#[repr(transparent)]
pub struct McsLock {
    data: AtomicU32,
}

impl McsLock {
    /// Creates a new unlocked lock word.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub const fn new() -> Self {
        Self { data: AtomicU32::new(0) }
    }

    /// Creates a new unlocked lock word with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self { data: AtomicU32::new(0) }
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// This method does not provide any synchronization guarantees, so its
    /// only useful as a heuristic, and so must be considered not up to date.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.data.load(Relaxed) != 0
    }

    /// Returns `true` if the lock is currently held by the guest.
    #[inline]
    pub fn is_guest_locked(&self) -> bool {
        self.data.load(Relaxed) == MCS_GUEST_ID
    }

    /// Current tail code, zero if unlocked.
    pub(crate) fn tail(&self) -> u32 {
        self.data.load(Acquire)
    }
}

impl Default for McsLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-waiter record of the write-write queue.
///
/// Holds only the successor link, written once by the next arriving waiter
/// and consumed by the holder on release. The waiter itself spins on its
/// worker-wide `waiting` flag, not on the block. Blocks live in host storage
/// and are addressed by `(thread id, block index)`, see [`Adaptor`].
#[derive(Debug)]
#[repr(C, align(8))]
pub struct McsWwBlock {
    /// Tail code of the successor, zero while none has linked.
    successor: AtomicU32,
}

impl McsWwBlock {
    /// Creates a new block with no successor.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub const fn new() -> Self {
        Self { successor: AtomicU32::new(0) }
    }

    /// Creates a new block with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self { successor: AtomicU32::new(0) }
    }

    fn clear_successor(&self) {
        self.successor.store(0, Release);
    }

    fn has_successor(&self) -> bool {
        self.successor.load(Acquire) != 0
    }

    fn set_successor(&self, id: ThreadId, index: BlockIndex) {
        self.successor.store(tail_code(id, index), Release);
    }

    fn successor_thread_id(&self) -> ThreadId {
        tail_thread_id(self.successor.load(Acquire))
    }
}

impl Default for McsWwBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// The write-write MCS lock engine.
///
/// One engine instance belongs to one worker thread and wraps that worker's
/// [`Adaptor`] handle. It is generic over the relax policy `R` applied in
/// its wait loops.
///
/// # Example
///
/// ```
/// use mcsrw::mock::ExtendedArena;
/// use mcsrw::relax::Spin;
/// use mcsrw::ww::{McsLock, McsWw};
///
/// let arena = ExtendedArena::with_capacity(1, 8);
/// let engine: McsWw<_, Spin> = McsWw::new(arena.adaptor(0));
///
/// let lock = McsLock::new();
/// let block = engine.acquire_unconditional(&lock);
/// assert!(lock.is_locked());
/// engine.release(&lock, block);
/// assert!(!lock.is_locked());
/// ```
pub struct McsWw<A, R> {
    adaptor: A,
    marker: PhantomData<R>,
}

impl<A: Adaptor, R: Relax> McsWw<A, R> {
    /// Creates an engine for the worker represented by `adaptor`.
    #[inline]
    pub const fn new(adaptor: A) -> Self {
        Self { adaptor, marker: PhantomData }
    }

    /// Returns a reference to the underlying adaptor handle.
    #[inline]
    pub fn adaptor(&self) -> &A {
        &self.adaptor
    }

    /// Acquires the lock, blocking (spinning) until it is granted.
    ///
    /// Issues and returns the block index backing this acquisition; the same
    /// index must be handed back to [`release`]. Always succeeds eventually.
    ///
    /// [`release`]: Self::release
    pub fn acquire_unconditional(&self, lock: &McsLock) -> BlockIndex {
        debug_assert!(!self.adaptor.me_waiting().load(Relaxed));
        debug_assert!(self.adaptor.current_block_index() < BlockIndex::MAX);
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        self.adaptor.my_ww_block(block_index).clear_successor();
        self.adaptor.me_waiting().store(true, Release);
        let id = self.adaptor.my_id();
        let desired = tail_code(id, block_index);
        let mut group_tail = desired;

        let pred = loop {
            // If it's obviously held by a guest, wait for it to go away
            // before even trying to enqueue.
            if lock.data.load(Acquire) == MCS_GUEST_ID {
                spin_until::<R, _>(|| lock.data.load(Acquire) != MCS_GUEST_ID);
            }
            debug_assert!(group_tail != 0 && group_tail != MCS_GUEST_ID);
            let pred = lock.data.swap(group_tail, SeqCst);
            debug_assert!(pred != desired);
            if pred == 0 {
                // Uncontended.
                self.adaptor.me_waiting().store(false, Release);
                return block_index;
            } else if pred == MCS_GUEST_ID {
                // We must not keep the guest's sentinel: swap it back in and
                // retry with whatever queue accumulated behind us as the new
                // group tail.
                group_tail = lock.data.swap(MCS_GUEST_ID, SeqCst);
                debug_assert!(group_tail != 0 && group_tail != MCS_GUEST_ID);
            } else {
                break pred;
            }
        };

        let pred_id = tail_thread_id(pred);
        trace!(id, pred_id, "contended; waiting for hand-off");
        debug_assert!(pred_id != id);
        debug_assert!(self.adaptor.other_current_block_index(pred_id) >= tail_block_index(pred));
        let pred_block = self.adaptor.other_ww_block(pred_id, tail_block_index(pred));
        debug_assert!(!pred_block.has_successor());
        pred_block.set_successor(id, block_index);

        spin_until::<R, _>(|| !self.adaptor.me_waiting().load(Acquire));
        debug_assert!(lock.is_locked());
        block_index
    }

    /// Releases the lock, handing it to the successor if one has enqueued.
    pub fn release(&self, lock: &McsLock, block_index: BlockIndex) {
        debug_assert!(!self.adaptor.me_waiting().load(Relaxed));
        debug_assert!(lock.is_locked());
        debug_assert!(block_index > 0);
        debug_assert!(self.adaptor.current_block_index() >= block_index);
        let id = self.adaptor.my_id();
        let myself = tail_code(id, block_index);
        let block = self.adaptor.my_ww_block(block_index);

        if !block.has_successor() {
            // Successor "seems" absent, but only the tail CAS can make sure.
            if lock.data.compare_exchange(myself, 0, SeqCst, Acquire).is_ok() {
                return;
            }
            trace!(id, "release contended; waiting for successor to link");
            spin_until::<R, _>(|| block.has_successor());
        }

        let successor_id = block.successor_thread_id();
        debug_assert!(successor_id != id);
        debug_assert!(self.adaptor.other_waiting(successor_id).load(Acquire));
        self.adaptor.other_waiting(successor_id).store(false, Release);
    }

    /// Uncontended fast path that stamps this worker as the initial holder.
    ///
    /// The lock must be observably unlocked and unreachable by concurrent
    /// acquirers, such as a record the caller has just created.
    pub fn initial(&self, lock: &McsLock) -> BlockIndex {
        debug_assert!(!self.adaptor.me_waiting().load(Relaxed));
        debug_assert!(!lock.is_locked());
        debug_assert!(self.adaptor.current_block_index() < BlockIndex::MAX);
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        self.adaptor.my_ww_block(block_index).clear_successor();
        lock.data.store(tail_code(self.adaptor.my_id(), block_index), Release);
        block_index
    }
}

/// Acquires `lock` as the owner-less guest, spinning until granted.
///
/// The guest does not enqueue a block: it CASes the word from unlocked to
/// [`MCS_GUEST_ID`] and retries on failure, so it does not take part in the
/// FIFO order.
pub fn ownerless_acquire_unconditional<R: Relax>(lock: &McsLock) {
    let mut relax = R::new();
    while lock.data.compare_exchange_weak(0, MCS_GUEST_ID, SeqCst, Relaxed).is_err() {
        relax.relax();
    }
    trace!("guest acquired");
    debug_assert!(lock.is_locked());
}

/// Releases a lock held by the owner-less guest.
pub fn ownerless_release<R: Relax>(lock: &McsLock) {
    debug_assert!(lock.is_locked());
    let mut relax = R::new();
    while lock.data.compare_exchange_weak(MCS_GUEST_ID, 0, SeqCst, Relaxed).is_err() {
        relax.relax();
    }
    trace!("guest released");
}

/// Uncontended fast path that stamps the guest as the initial holder.
pub fn ownerless_initial(lock: &McsLock) {
    debug_assert!(!lock.is_locked());
    lock.data.store(MCS_GUEST_ID, Release);
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::{McsLock, McsWw, MCS_GUEST_ID};
    use crate::adaptor::{tail_code, Adaptor};
    use crate::mock::SimpleArena;
    use crate::relax::Yield;
    use crate::test::RaceCell;

    type Engine = McsWw<crate::mock::MockAdaptor<crate::rw::simple::McsRwSimpleBlock>, Yield>;

    #[test]
    fn block_layout() {
        use super::McsWwBlock;
        assert_eq!(core::mem::size_of::<McsWwBlock>(), 8);
        assert_eq!(core::mem::align_of::<McsWwBlock>(), 8);
    }

    #[test]
    fn uncontended_roundtrip() {
        let arena = SimpleArena::with_capacity(1, 8);
        let engine: Engine = McsWw::new(arena.adaptor(0));
        let lock = McsLock::new();

        let block = engine.acquire_unconditional(&lock);
        assert_eq!(block, 1);
        assert_eq!(lock.tail(), tail_code(0, 1));
        assert!(lock.is_locked());
        assert!(!lock.is_guest_locked());

        engine.release(&lock, block);
        assert!(!lock.is_locked());
        assert_eq!(lock.tail(), 0);
    }

    #[test]
    fn initial_stamps_holder() {
        let arena = SimpleArena::with_capacity(1, 8);
        let engine: Engine = McsWw::new(arena.adaptor(0));
        let lock = McsLock::new();

        let block = engine.initial(&lock);
        assert_eq!(lock.tail(), tail_code(0, block));
        engine.release(&lock, block);
        assert!(!lock.is_locked());
    }

    #[test]
    fn ownerless_roundtrip() {
        let lock = McsLock::new();
        super::ownerless_acquire_unconditional::<Yield>(&lock);
        assert!(lock.is_guest_locked());
        assert_eq!(lock.tail(), MCS_GUEST_ID);
        super::ownerless_release::<Yield>(&lock);
        assert!(!lock.is_locked());

        super::ownerless_initial(&lock);
        assert!(lock.is_guest_locked());
        super::ownerless_release::<Yield>(&lock);
        assert!(!lock.is_locked());
    }

    #[test]
    fn two_thread_handoff() {
        let arena = SimpleArena::with_capacity(2, 8);
        let lock = Arc::new(McsLock::new());
        let barrier = Arc::new(Barrier::new(2));

        let engine: Engine = McsWw::new(arena.adaptor(0));
        let t0_block = engine.acquire_unconditional(&lock);

        let (tx, rx) = channel();
        let handle = {
            let arena = arena.clone();
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let engine: Engine = McsWw::new(arena.adaptor(1));
                barrier.wait();
                // Blocks until the main thread releases.
                let block = engine.acquire_unconditional(&lock);
                tx.send(()).unwrap();
                engine.release(&lock, block);
            })
        };

        barrier.wait();
        // Give the second thread a chance to enqueue, then hand off.
        thread::yield_now();
        engine.release(&lock, t0_block);
        rx.recv().unwrap();
        handle.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn lots_and_lots() {
        const THREADS: u16 = 4;
        const ITERS: u64 = 300;

        let arena = SimpleArena::with_capacity(THREADS as usize, (ITERS + 1) as usize);
        let lock = Arc::new(McsLock::new());
        let data = Arc::new(RaceCell::new());

        let handles = (0..THREADS)
            .map(|id| {
                let arena = arena.clone();
                let lock = Arc::clone(&lock);
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let engine: Engine = McsWw::new(arena.adaptor(id));
                    for _ in 0..ITERS {
                        let block = engine.acquire_unconditional(&lock);
                        // Non-atomic increment: correct only under mutual
                        // exclusion, which is what is being tested.
                        unsafe { data.incr() };
                        engine.release(&lock, block);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { data.get() }, u64::from(THREADS) * ITERS);
        assert!(!lock.is_locked());
    }

    #[test]
    fn guest_and_threads_interleave() {
        const ITERS: u64 = 100;

        let arena = SimpleArena::with_capacity(2, (ITERS + 1) as usize);
        let lock = Arc::new(McsLock::new());
        let data = Arc::new(RaceCell::new());

        let workers = (0..2u16)
            .map(|id| {
                let arena = arena.clone();
                let lock = Arc::clone(&lock);
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let engine: Engine = McsWw::new(arena.adaptor(id));
                    for _ in 0..ITERS {
                        let block = engine.acquire_unconditional(&lock);
                        unsafe { data.incr() };
                        engine.release(&lock, block);
                    }
                })
            })
            .collect::<Vec<_>>();
        let guest = {
            let lock = Arc::clone(&lock);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                for _ in 0..ITERS {
                    super::ownerless_acquire_unconditional::<Yield>(&lock);
                    unsafe { data.incr() };
                    super::ownerless_release::<Yield>(&lock);
                }
            })
        };

        for handle in workers {
            handle.join().unwrap();
        }
        guest.join().unwrap();
        assert_eq!(unsafe { data.get() }, 3 * ITERS);
        assert!(!lock.is_locked());
    }

    #[test]
    fn waiting_flag_is_clear_after_acquire() {
        let arena = SimpleArena::with_capacity(1, 8);
        let engine: Engine = McsWw::new(arena.adaptor(0));
        let lock = McsLock::new();

        let block = engine.acquire_unconditional(&lock);
        assert!(!engine.adaptor().me_waiting().load(Relaxed));
        engine.release(&lock, block);
        assert!(!engine.adaptor().me_waiting().load(Relaxed));
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;

    #[test]
    fn ww_exclusion_join() {
        models::ww_exclusion_join();
    }

    #[test]
    fn ww_guest_vs_worker() {
        models::ww_guest_vs_worker();
    }
}
