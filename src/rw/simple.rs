//! Simple reader-writer MCS lock.
//!
//! The `simple` flavor supports unconditional and try acquisition for both
//! roles. Its asynchronous entry points are the try paths under another
//! name: a failed try leaves no queue state behind, so retrying is a fresh
//! attempt and cancellation has nothing to undo. Waiters that do enqueue
//! spin on the `blocked` bit of their own block until a predecessor grants
//! them.
//!
//! Readers chain: an arriving reader joins an already granted reader
//! predecessor without waiting, and a granted reader finishes its own
//! acquisition by granting a reader successor that managed to register
//! before the grant (the *finalize* cascade). A writer that finds the queue
//! empty while readers are active parks its thread id in the lock word's
//! `next_writer` subfield and is woken by the last departing reader.

use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Release, SeqCst};

use tracing::trace;

use crate::adaptor::{tail_block_index, tail_code, tail_thread_id, Adaptor, BlockIndex, ThreadId};
use crate::cfg::atomic::{AtomicU16, AtomicU32};
use crate::relax::{spin_until, Relax};
use crate::rw::{
    make_word, word_nreaders, word_next_writer, word_tail, AcquireAsync, McsRwLock, EMPTY_WORD,
    NEXT_WRITER_NONE,
};

/// `state` bit: set while the waiter has not been granted.
const STATE_BLOCKED: u16 = 1 << 0;
/// `state` bit: set when the block belongs to a writer.
const STATE_WRITER: u16 = 1 << 1;
/// `state` bit: set once the post-grant reader cascade has completed.
const STATE_FINALIZED: u16 = 1 << 2;

const SUCC_SHIFT: u16 = 3;
const SUCC_MASK: u16 = 0b11 << SUCC_SHIFT;
const SUCC_READER: u16 = 0b01 << SUCC_SHIFT;
const SUCC_WRITER: u16 = 0b10 << SUCC_SHIFT;

/// Per-waiter record of the simple reader-writer queue.
///
/// Eight bytes: a 16-bit `state` word (blocked, role, successor class,
/// finalized) and a 32-bit successor tail code. The successor class and the
/// blocked bit live in the same cell but are only ever changed by
/// read-modify-writes, so the role-specific handshakes cannot clobber each
/// other.
#[derive(Debug)]
#[repr(C, align(8))]
pub struct McsRwSimpleBlock {
    state: AtomicU16,
    successor: AtomicU32,
}

impl McsRwSimpleBlock {
    /// Creates a new, unqueued block.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub const fn new() -> Self {
        Self { state: AtomicU16::new(0), successor: AtomicU32::new(0) }
    }

    /// Creates a new block with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self { state: AtomicU16::new(0), successor: AtomicU32::new(0) }
    }

    fn init_reader(&self) {
        self.state.store(STATE_BLOCKED, Release);
        self.successor.store(0, Release);
    }

    fn init_writer(&self) {
        self.state.store(STATE_BLOCKED | STATE_WRITER, Release);
        self.successor.store(0, Release);
    }

    fn is_reader(&self) -> bool {
        self.state.load(Acquire) & STATE_WRITER == 0
    }

    fn is_blocked(&self) -> bool {
        self.state.load(Acquire) & STATE_BLOCKED != 0
    }

    fn is_granted(&self) -> bool {
        !self.is_blocked()
    }

    /// Grants the waiter. Leaves role, class and finalized bits untouched.
    fn unblock(&self) {
        debug_assert!(self.is_blocked());
        self.state.fetch_and(!STATE_BLOCKED, SeqCst);
    }

    fn is_finalized(&self) -> bool {
        self.state.load(Acquire) & STATE_FINALIZED != 0
    }

    fn set_finalized(&self) {
        self.state.fetch_or(STATE_FINALIZED, SeqCst);
    }

    /// Registers a reader successor on a still-blocked reader, failing if
    /// the block has been granted (or already carries a successor class).
    fn try_register_reader_successor(&self) -> bool {
        let expected = STATE_BLOCKED;
        let desired = STATE_BLOCKED | SUCC_READER;
        self.state.compare_exchange(expected, desired, SeqCst, Acquire).is_ok()
    }

    /// Registers a writer successor. Writers always wait, so this is an
    /// unconditional flag update rather than a CAS.
    fn set_successor_class_writer(&self) {
        debug_assert!(self.state.load(Acquire) & SUCC_MASK == 0);
        self.state.fetch_or(SUCC_WRITER, SeqCst);
    }

    fn has_successor(&self) -> bool {
        self.state.load(Acquire) & SUCC_MASK != 0
    }

    fn has_reader_successor(&self) -> bool {
        self.state.load(Acquire) & SUCC_MASK == SUCC_READER
    }

    fn has_writer_successor(&self) -> bool {
        self.state.load(Acquire) & SUCC_MASK == SUCC_WRITER
    }

    /// Publishes the successor link. Separate from the class registration:
    /// the class tells the owner *what* will link, this tells it *who* has.
    fn set_successor(&self, id: ThreadId, index: BlockIndex) {
        self.successor.store(tail_code(id, index), Release);
    }

    fn successor_is_ready(&self) -> bool {
        self.successor.load(Acquire) != 0
    }

    fn successor_thread_id(&self) -> ThreadId {
        tail_thread_id(self.successor.load(Acquire))
    }

    fn successor_block_index(&self) -> BlockIndex {
        tail_block_index(self.successor.load(Acquire))
    }
}

impl Default for McsRwSimpleBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// The simple reader-writer MCS lock engine.
///
/// One engine instance belongs to one worker thread and wraps that worker's
/// [`Adaptor`] handle; the host must store [`McsRwSimpleBlock`]s. Generic
/// over the relax policy `R` applied in its wait loops.
///
/// # Example
///
/// ```
/// use mcsrw::mock::SimpleArena;
/// use mcsrw::relax::Spin;
/// use mcsrw::rw::simple::McsRwSimple;
/// use mcsrw::rw::McsRwLock;
///
/// let arena = SimpleArena::with_capacity(1, 8);
/// let engine: McsRwSimple<_, Spin> = McsRwSimple::new(arena.adaptor(0));
///
/// let lock = McsRwLock::new();
/// let block = engine.acquire_unconditional_reader(&lock);
/// assert_eq!(lock.nreaders(), 1);
/// engine.release_reader(&lock, block);
/// assert!(!lock.is_locked());
/// ```
pub struct McsRwSimple<A, R> {
    adaptor: A,
    marker: PhantomData<R>,
}

impl<A, R> McsRwSimple<A, R>
where
    A: Adaptor<RwBlock = McsRwSimpleBlock>,
    R: Relax,
{
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

    /// Acquires the lock in reader mode, blocking (spinning) until granted.
    pub fn acquire_unconditional_reader(&self, lock: &McsRwLock) -> BlockIndex {
        debug_assert!(self.adaptor.current_block_index() < BlockIndex::MAX);
        let id = self.adaptor.my_id();
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        let my_block = self.adaptor.my_rw_block(block_index);
        my_block.init_reader();
        debug_assert!(my_block.is_blocked() && my_block.is_reader());
        debug_assert!(!my_block.has_successor());

        let pred_tail = lock.xchg_tail(tail_code(id, block_index));
        if pred_tail == 0 {
            lock.increment_nreaders();
            // Reader successors will know they don't need to wait.
            my_block.unblock();
        } else {
            let pred_block = self.adaptor.dereference_rw_tail(pred_tail);
            if !pred_block.is_reader() || pred_block.try_register_reader_successor() {
                // Predecessor is a writer, or a reader that is itself still
                // waiting: wait to be granted.
                pred_block.set_successor(id, block_index);
                spin_until::<R, _>(|| my_block.is_granted());
            } else {
                // Join the active reader predecessor.
                debug_assert!(!pred_block.is_blocked());
                lock.increment_nreaders();
                pred_block.set_successor(id, block_index);
                my_block.unblock();
            }
        }
        self.finalize_acquire_reader(lock, my_block);
        debug_assert!(my_block.is_finalized());
        block_index
    }

    /// Releases a reader-mode acquisition.
    pub fn release_reader(&self, lock: &McsRwLock, block_index: BlockIndex) {
        let id = self.adaptor.my_id();
        debug_assert!(block_index > 0);
        debug_assert!(self.adaptor.current_block_index() >= block_index);
        let my_block = self.adaptor.my_rw_block(block_index);
        debug_assert!(my_block.is_finalized());

        // Make sure there is really no successor, or wait for it to link.
        if my_block.successor_is_ready() || !lock.cas_tail(tail_code(id, block_index), 0) {
            // Checking the class bits is not enough: they say a successor
            // committed to linking, not that the link has been published.
            spin_until::<R, _>(|| my_block.successor_is_ready());
            if my_block.has_writer_successor() {
                lock.set_next_writer(my_block.successor_thread_id());
            }
        }

        if lock.decrement_nreaders() == 1 {
            // Last active reader out wakes the parked writer, if any.
            let next_writer = lock.next_writer();
            if next_writer != NEXT_WRITER_NONE
                && lock.nreaders() == 0
                && lock.cas_next_writer(next_writer, NEXT_WRITER_NONE)
            {
                // A worker waits for one lock at a time, so the parked
                // writer's newest block is the one spinning on this lock.
                let next_index = self.adaptor.other_current_block_index(next_writer);
                let writer_block = self.adaptor.other_rw_block(next_writer, next_index);
                debug_assert!(writer_block.is_blocked());
                debug_assert!(!writer_block.is_reader());
                trace!(id, next_writer, "last reader out; waking parked writer");
                writer_block.unblock();
            }
        }
    }

    /// Acquires the lock in writer mode, blocking (spinning) until granted.
    pub fn acquire_unconditional_writer(&self, lock: &McsRwLock) -> BlockIndex {
        debug_assert!(self.adaptor.current_block_index() < BlockIndex::MAX);
        let id = self.adaptor.my_id();
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        let my_block = self.adaptor.my_rw_block(block_index);
        my_block.init_writer();
        debug_assert!(my_block.is_blocked() && !my_block.is_reader());
        debug_assert!(!my_block.has_successor());

        let my_tail = tail_code(id, block_index);
        let pred_tail = lock.xchg_tail(my_tail);
        debug_assert!(pred_tail != my_tail);
        if pred_tail == 0 {
            // Queue was empty, but readers may be active: park in
            // `next_writer` and claim the grant back if they are not.
            debug_assert_eq!(lock.next_writer(), NEXT_WRITER_NONE);
            lock.set_next_writer(id);
            if lock.nreaders() == 0 && lock.xchg_next_writer(NEXT_WRITER_NONE) == id {
                my_block.unblock();
                return block_index;
            }
            trace!(id, "writer parked for readers to drain");
        } else {
            let pred_block = self.adaptor.dereference_rw_tail(pred_tail);
            pred_block.set_successor_class_writer();
            pred_block.set_successor(id, block_index);
        }
        spin_until::<R, _>(|| my_block.is_granted());
        block_index
    }

    /// Releases a writer-mode acquisition.
    pub fn release_writer(&self, lock: &McsRwLock, block_index: BlockIndex) {
        let id = self.adaptor.my_id();
        debug_assert!(block_index > 0);
        debug_assert!(self.adaptor.current_block_index() >= block_index);
        let my_block = self.adaptor.my_rw_block(block_index);

        if my_block.successor_is_ready() || !lock.cas_tail(tail_code(id, block_index), 0) {
            spin_until::<R, _>(|| my_block.successor_is_ready());
            let successor = self.adaptor.other_rw_block(
                my_block.successor_thread_id(),
                my_block.successor_block_index(),
            );
            debug_assert!(successor.is_blocked());
            if successor.is_reader() {
                lock.increment_nreaders();
            }
            successor.unblock();
        }
    }

    /// Tries to acquire the lock in writer mode without ever waiting.
    ///
    /// A single whole-word CAS from the fully released state; leaves no
    /// queue state behind on failure.
    pub fn acquire_try_writer(&self, lock: &McsRwLock) -> Option<BlockIndex> {
        let block_index = self.adaptor.issue_new_block();
        self.retry_async_writer(lock, block_index).then_some(block_index)
    }

    /// Tries to acquire the lock in reader mode without ever waiting.
    ///
    /// Succeeds only when the lock is free or held by granted readers with
    /// no writer parked; leaves no queue state behind on failure.
    pub fn acquire_try_reader(&self, lock: &McsRwLock) -> Option<BlockIndex> {
        let block_index = self.adaptor.issue_new_block();
        let granted = self.retry_async_reader(lock, block_index);
        #[cfg(debug_assertions)]
        if granted {
            let my_block = self.adaptor.my_rw_block(block_index);
            debug_assert!(my_block.is_finalized());
            debug_assert!(my_block.is_granted());
        }
        granted.then_some(block_index)
    }

    /// Asynchronous reader acquisition.
    ///
    /// In the simple flavor this is the try path: on failure the block is
    /// not queued, a later [`retry_async_reader`] is a fresh attempt and
    /// [`cancel_async_reader`] has nothing to undo.
    ///
    /// [`retry_async_reader`]: Self::retry_async_reader
    /// [`cancel_async_reader`]: Self::cancel_async_reader
    pub fn acquire_async_reader(&self, lock: &McsRwLock) -> AcquireAsync {
        let block_index = self.adaptor.issue_new_block();
        AcquireAsync { acquired: self.retry_async_reader(lock, block_index), block_index }
    }

    /// Asynchronous writer acquisition. See [`acquire_async_reader`].
    ///
    /// [`acquire_async_reader`]: Self::acquire_async_reader
    pub fn acquire_async_writer(&self, lock: &McsRwLock) -> AcquireAsync {
        let block_index = self.adaptor.issue_new_block();
        AcquireAsync { acquired: self.retry_async_writer(lock, block_index), block_index }
    }

    /// Retries a reader acquisition for the given block.
    ///
    /// Snapshots the whole lock word and CASes in a joined reader if the
    /// word is reader-compatible. Keeping this single-shot matters: a retry
    /// loop here could spin forever on a lock whose `next_writer` was
    /// consumed by a writer that now waits on a lock *this* worker holds.
    pub fn retry_async_reader(&self, lock: &McsRwLock, block_index: BlockIndex) -> bool {
        let id = self.adaptor.my_id();
        let word = lock.snapshot();
        if word_next_writer(word) != NEXT_WRITER_NONE {
            return false;
        }
        let tail = word_tail(word);
        let pred_block = (tail != 0).then(|| self.adaptor.dereference_rw_tail(tail));
        if let Some(pred) = pred_block {
            if !(pred.is_granted() && pred.is_reader()) {
                return false;
            }
        }
        let desired = make_word(tail_code(id, block_index), word_nreaders(word) + 1, NEXT_WRITER_NONE);
        let my_block = self.adaptor.my_rw_block(block_index);
        my_block.init_reader();
        if lock.cas_word_weak(word, desired) {
            if let Some(pred) = pred_block {
                pred.set_successor(id, block_index);
            }
            my_block.unblock();
            self.finalize_acquire_reader(lock, my_block);
            return true;
        }
        false
    }

    /// Retries a writer acquisition for the given block: one whole-word CAS
    /// from the fully released state.
    pub fn retry_async_writer(&self, lock: &McsRwLock, block_index: BlockIndex) -> bool {
        let id = self.adaptor.my_id();
        let my_block = self.adaptor.my_rw_block(block_index);
        my_block.init_writer();
        let desired = make_word(tail_code(id, block_index), 0, NEXT_WRITER_NONE);
        my_block.unblock();
        lock.cas_word_weak(EMPTY_WORD, desired)
    }

    /// Cancels an asynchronous reader acquisition.
    ///
    /// The simple flavor never leaves a failed async block in the queue, so
    /// there is nothing to withdraw.
    pub fn cancel_async_reader(&self, _lock: &McsRwLock, _block_index: BlockIndex) {}

    /// Cancels an asynchronous writer acquisition. See
    /// [`cancel_async_reader`].
    ///
    /// [`cancel_async_reader`]: Self::cancel_async_reader
    pub fn cancel_async_writer(&self, _lock: &McsRwLock, _block_index: BlockIndex) {}

    /// Completes a granted reader acquisition: grants a reader successor
    /// that registered while this block was still waiting, then marks the
    /// block finalized. Must run before the block may be released.
    fn finalize_acquire_reader(&self, lock: &McsRwLock, my_block: &McsRwSimpleBlock) {
        debug_assert!(!my_block.is_finalized());
        if my_block.has_reader_successor() {
            spin_until::<R, _>(|| my_block.successor_is_ready());
            let successor = self.adaptor.other_rw_block(
                my_block.successor_thread_id(),
                my_block.successor_block_index(),
            );
            lock.increment_nreaders();
            successor.unblock();
        }
        my_block.set_finalized();
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;

    use super::{McsRwSimple, McsRwSimpleBlock};
    use crate::mock::{MockAdaptor, SimpleArena};
    use crate::relax::Yield;
    use crate::rw::McsRwLock;
    use crate::test::Occupancy;

    type Engine = McsRwSimple<MockAdaptor<McsRwSimpleBlock>, Yield>;

    #[test]
    fn block_layout() {
        assert_eq!(core::mem::size_of::<McsRwSimpleBlock>(), 8);
        assert_eq!(core::mem::align_of::<McsRwSimpleBlock>(), 8);
        // Must stay interchangeable with the write-write block in host
        // storage layouts.
        assert_eq!(
            core::mem::size_of::<McsRwSimpleBlock>(),
            core::mem::size_of::<crate::ww::McsWwBlock>(),
        );
    }

    #[test]
    fn readers_share() {
        let arena = SimpleArena::with_capacity(3, 8);
        let lock = McsRwLock::new();
        let engines: Vec<Engine> =
            (0..3).map(|id| McsRwSimple::new(arena.adaptor(id))).collect();

        let blocks: Vec<_> =
            engines.iter().map(|e| e.acquire_unconditional_reader(&lock)).collect();
        assert_eq!(lock.nreaders(), 3);

        // Release in an order different from acquisition.
        engines[1].release_reader(&lock, blocks[1]);
        engines[0].release_reader(&lock, blocks[0]);
        engines[2].release_reader(&lock, blocks[2]);
        assert_eq!(lock.nreaders(), 0);
        assert!(!lock.is_locked());
    }

    #[test]
    fn writer_waits_for_readers() {
        let arena = SimpleArena::with_capacity(3, 8);
        let lock = Arc::new(McsRwLock::new());

        let r1: Engine = McsRwSimple::new(arena.adaptor(0));
        let r2: Engine = McsRwSimple::new(arena.adaptor(1));
        let b1 = r1.acquire_unconditional_reader(&lock);
        let b2 = r2.acquire_unconditional_reader(&lock);
        assert_eq!(lock.nreaders(), 2);
        let readers_tail = lock.tail();

        let (tx, rx) = channel();
        let writer = {
            let arena = arena.clone();
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let w: Engine = McsRwSimple::new(arena.adaptor(2));
                let block = w.acquire_unconditional_writer(&lock);
                assert_eq!(lock.nreaders(), 0);
                tx.send(()).unwrap();
                w.release_writer(&lock, block);
            })
        };

        // Wait for the writer to enqueue; it cannot be granted while the
        // readers are active.
        while lock.tail() == readers_tail {
            thread::yield_now();
        }
        assert!(rx.try_recv().is_err());

        r1.release_reader(&lock, b1);
        r2.release_reader(&lock, b2);
        rx.recv().unwrap();
        writer.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_writer_is_single_shot() {
        let arena = SimpleArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e0: Engine = McsRwSimple::new(arena.adaptor(0));
        let e1: Engine = McsRwSimple::new(arena.adaptor(1));

        let block = e0.acquire_try_writer(&lock).expect("uncontended try must win");
        assert!(e1.acquire_try_writer(&lock).is_none());
        assert!(e1.acquire_try_reader(&lock).is_none());
        e0.release_writer(&lock, block);
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_reader_joins_granted_reader() {
        let arena = SimpleArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e0: Engine = McsRwSimple::new(arena.adaptor(0));
        let e1: Engine = McsRwSimple::new(arena.adaptor(1));

        let b0 = e0.acquire_unconditional_reader(&lock);
        let b1 = e1.acquire_try_reader(&lock).expect("reader-held lock admits try readers");
        assert_eq!(lock.nreaders(), 2);

        e0.release_reader(&lock, b0);
        e1.release_reader(&lock, b1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_reader_respects_waiting_writer() {
        let arena = SimpleArena::with_capacity(3, 8);
        let lock = Arc::new(McsRwLock::new());
        let e0: Engine = McsRwSimple::new(arena.adaptor(0));
        let b0 = e0.acquire_unconditional_reader(&lock);
        let reader_tail = lock.tail();

        let writer = {
            let arena = arena.clone();
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let w: Engine = McsRwSimple::new(arena.adaptor(1));
                let block = w.acquire_unconditional_writer(&lock);
                w.release_writer(&lock, block);
            })
        };
        // Wait for the writer to become the queue tail.
        while lock.tail() == reader_tail {
            thread::yield_now();
        }

        // A waiting writer blocks new try readers even though a reader
        // still holds.
        let e2: Engine = McsRwSimple::new(arena.adaptor(2));
        assert!(e2.acquire_try_reader(&lock).is_none());

        e0.release_reader(&lock, b0);
        writer.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn async_is_try() {
        let arena = SimpleArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e0: Engine = McsRwSimple::new(arena.adaptor(0));
        let e1: Engine = McsRwSimple::new(arena.adaptor(1));

        let w = e0.acquire_async_writer(&lock);
        assert!(w.acquired);
        let r = e1.acquire_async_reader(&lock);
        assert!(!r.acquired);
        // Nothing was queued; cancel is a no-op and the lock word is
        // untouched by it.
        e1.cancel_async_reader(&lock, r.block_index);
        e0.release_writer(&lock, w.block_index);

        let r2 = e1.acquire_async_reader(&lock);
        assert!(r2.acquired);
        e1.release_reader(&lock, r2.block_index);
        assert!(!lock.is_locked());
    }

    #[test]
    fn readers_and_writers_exclude() {
        const THREADS: u16 = 4;
        const ITERS: u32 = 200;

        let arena = SimpleArena::with_capacity(THREADS as usize, (ITERS + 1) as usize);
        let lock = Arc::new(McsRwLock::new());
        let occupancy = Arc::new(Occupancy::new());

        let handles = (0..THREADS)
            .map(|id| {
                let arena = arena.clone();
                let lock = Arc::clone(&lock);
                let occupancy = Arc::clone(&occupancy);
                thread::spawn(move || {
                    let engine: Engine = McsRwSimple::new(arena.adaptor(id));
                    for i in 0..ITERS {
                        if (i + u32::from(id)) % 3 == 0 {
                            let block = engine.acquire_unconditional_writer(&lock);
                            occupancy.enter_writer();
                            occupancy.exit_writer();
                            engine.release_writer(&lock, block);
                        } else {
                            let block = engine.acquire_unconditional_reader(&lock);
                            occupancy.enter_reader();
                            occupancy.exit_reader();
                            engine.release_reader(&lock, block);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!lock.is_locked());
        assert_eq!(lock.nreaders(), 0);
    }
}
