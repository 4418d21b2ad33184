//! Extended reader-writer MCS lock.
//!
//! The `extended` flavor supports everything the [`simple`] one does, plus
//! acquisition with a timeout, true asynchronous acquisition, and mid-queue
//! cancellation: a waiter can atomically withdraw from the middle of the
//! FIFO queue while its neighbours concurrently arrive, pass ownership or
//! also withdraw.
//!
//! Each waiter block carries two atomic words. The *pred* half is written
//! by the predecessor (or by the owner when it consumes a hand-off); the
//! *next* half is written by the owner, with a single exception: a direct
//! successor that is cancelling CASes the [`SUCC_ID_SUCCESSOR_LEAVING`]
//! beacon into the owner's successor id so that the owner will not try to
//! wake it. Cancellation then either repairs the lock tail (no successor
//! yet) or relinks the successor to the predecessor and hands the
//! registered successor class over.
//!
//! A cancellation can lose the race against a predecessor that is already
//! granting: the withdrawal then turns into an ordinary acquisition that
//! the caller must release. Every wait inside the protocol is on a field
//! that another thread is obligated to update before it can make progress
//! of its own, so cancellation resolves in a bounded number of steps.
//!
//! [`simple`]: crate::rw::simple

use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};

use tracing::trace;

use crate::adaptor::{tail_code, tail_thread_id, Adaptor, BlockIndex};
use crate::cfg::atomic::{AtomicU32, AtomicU64};
use crate::relax::{spin_until, Relax};
use crate::rw::{
    make_word, word_nreaders, word_next_writer, word_tail, AcquireAsync, AcquireResult, McsRwLock,
    Timeout, EMPTY_WORD, NEXT_WRITER_NONE,
};

/// `pred_id` value stored by a predecessor that has granted the lock to
/// this block unconditionally. Never a valid tail code: block index 1 of
/// thread 0 would be code `0x0001_0000`.
pub const PRED_ID_ACQUIRED: u32 = 0x0000_0001;

/// `next` id recording that no successor will arrive through this block;
/// release may skip the successor examination.
pub const SUCC_ID_NO_SUCCESSOR: u32 = 0xFFFF_FFFE;

/// `next` id beacon: the direct successor is mid-cancellation, do not wake
/// it.
pub const SUCC_ID_SUCCESSOR_LEAVING: u32 = 0xFFFF_FFFF;

/// `pred_flags` bit: the block has been granted the lock.
const PRED_GRANTED: u32 = 1 << 0;

/// Lock-state field of the next flags, two bits. The granted bit composes:
/// `leaving` that is granted mid-cancel becomes `leaving_granted`.
const STATE_MASK: u32 = 0b11;
const STATE_WAITING: u32 = 0b00;
const STATE_GRANTED_BIT: u32 = 0b01;
const STATE_DIRECT_GRANTED: u32 = 0b01;
const STATE_LEAVING: u32 = 0b10;
const STATE_LEAVING_GRANTED: u32 = 0b11;

/// Next flags bit: set through release/finalize; a set busy bit keeps any
/// successor from leaving.
const FLAG_BUSY: u32 = 1 << 2;

/// Successor-class field of the next flags, two bits.
const SUCC_SHIFT: u32 = 3;
const SUCC_MASK: u32 = 0b11 << SUCC_SHIFT;
const SUCC_READER: u32 = 0b01 << SUCC_SHIFT;
const SUCC_WRITER: u32 = 0b10 << SUCC_SHIFT;

/// Next flags bit: the block's own role.
const FLAG_READER: u32 = 1 << 5;

const fn compose_next(id: u32, flags: u32) -> u64 {
    ((id as u64) << 32) | flags as u64
}

const fn next_id_of(next: u64) -> u32 {
    (next >> 32) as u32
}

const fn next_flags_of(next: u64) -> u32 {
    next as u32
}

/// The exact next-flags value of a waiting block with no successor class.
const fn waiting_no_successor_flags(reader: bool) -> u32 {
    if reader {
        STATE_WAITING | FLAG_READER
    } else {
        STATE_WAITING
    }
}

/// The exact next-flags value of a waiting block with a reader successor.
const fn waiting_reader_successor_flags(reader: bool) -> u32 {
    waiting_no_successor_flags(reader) | SUCC_READER
}

/// Per-waiter record of the extended reader-writer queue.
///
/// Sixteen bytes, eight-byte aligned so each half is one atomic word:
///
/// - *pred half*: `pred_id`, the predecessor's tail code (zero when none or
///   consumed, [`PRED_ID_ACQUIRED`] when the predecessor has granted), and
///   `pred_flags`, the waiting/granted state the owner spins on;
/// - *next half*: one 64-bit word with the successor id in the upper half
///   ([`SUCC_ID_NO_SUCCESSOR`], [`SUCC_ID_SUCCESSOR_LEAVING`], zero, or a
///   tail code) and the flags (lock state, successor class, own role,
///   busy) in the lower half.
#[derive(Debug)]
#[repr(C, align(8))]
pub struct McsRwExtendedBlock {
    pred_id: AtomicU32,
    pred_flags: AtomicU32,
    next: AtomicU64,
}

impl McsRwExtendedBlock {
    /// Creates a new, unqueued block.
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub const fn new() -> Self {
        Self {
            pred_id: AtomicU32::new(0),
            pred_flags: AtomicU32::new(0),
            next: AtomicU64::new(0),
        }
    }

    /// Creates a new block with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        Self {
            pred_id: AtomicU32::new(0),
            pred_flags: AtomicU32::new(0),
            next: AtomicU64::new(0),
        }
    }

    fn init_reader(&self) {
        self.pred_id.store(0, Release);
        self.pred_flags.store(0, Release);
        self.next.store(compose_next(0, FLAG_READER), Release);
    }

    fn init_writer(&self) {
        self.pred_id.store(0, Release);
        self.pred_flags.store(0, Release);
        self.next.store(compose_next(0, 0), Release);
    }

    fn is_reader(&self) -> bool {
        self.read_next_flags() & FLAG_READER != 0
    }

    fn is_writer(&self) -> bool {
        !self.is_reader()
    }

    fn get_pred_id(&self) -> u32 {
        self.pred_id.load(Acquire)
    }

    fn set_pred_id(&self, id: u32) {
        self.pred_id.store(id, Release);
    }

    fn xchg_pred_id(&self, id: u32) -> u32 {
        self.pred_id.swap(id, SeqCst)
    }

    /// Weak CAS on the pred id; callers always retry in a loop.
    fn cas_pred_id(&self, expected: u32, desired: u32) -> bool {
        self.pred_id.compare_exchange_weak(expected, desired, SeqCst, Relaxed).is_ok()
    }

    fn pred_flag_is_waiting(&self) -> bool {
        !self.pred_flag_is_granted()
    }

    fn pred_flag_is_granted(&self) -> bool {
        self.pred_flags.load(Acquire) & PRED_GRANTED != 0
    }

    fn set_pred_flag_granted(&self) {
        self.pred_flags.store(PRED_GRANTED, Release);
    }

    fn get_next(&self) -> u64 {
        self.next.load(Acquire)
    }

    fn get_next_id(&self) -> u32 {
        next_id_of(self.get_next())
    }

    fn read_next_flags(&self) -> u32 {
        next_flags_of(self.get_next())
    }

    /// Replaces the successor id, leaving the flags untouched.
    fn set_next_id(&self, id: u32) {
        let mut cur = self.next.load(Relaxed);
        loop {
            let new = compose_next(id, next_flags_of(cur));
            match self.next.compare_exchange_weak(cur, new, SeqCst, Relaxed) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Strong CAS over the whole next word.
    fn cas_next(&self, expected: u64, desired: u64) -> Result<u64, u64> {
        self.next.compare_exchange(expected, desired, SeqCst, Acquire)
    }

    /// CAS constrained to the flags half: fails only when the flags differ
    /// from `expected`, regardless of concurrent id changes.
    fn cas_next_flags(&self, expected: u32, desired: u32) -> Result<u32, u32> {
        let mut cur = self.next.load(Relaxed);
        loop {
            if next_flags_of(cur) != expected {
                return Err(next_flags_of(cur));
            }
            let new = compose_next(next_id_of(cur), desired);
            match self.next.compare_exchange_weak(cur, new, SeqCst, Relaxed) {
                Ok(_) => return Ok(expected),
                Err(observed) => cur = observed,
            }
        }
    }

    fn next_state(&self) -> u32 {
        self.read_next_flags() & STATE_MASK
    }

    fn next_flag_is_granted(&self) -> bool {
        self.next_state() & STATE_GRANTED_BIT != 0
    }

    fn next_flag_is_waiting(&self) -> bool {
        self.next_state() == STATE_WAITING
    }

    fn next_flag_is_leaving(&self) -> bool {
        self.next_state() == STATE_LEAVING
    }

    fn next_flag_is_leaving_granted(&self) -> bool {
        self.next_state() == STATE_LEAVING_GRANTED
    }

    fn set_next_flag_granted(&self) {
        self.next.fetch_or(STATE_GRANTED_BIT as u64, SeqCst);
    }

    fn set_next_flag_leaving(&self) {
        debug_assert!(!self.next_flag_is_granted());
        self.next.fetch_or(STATE_LEAVING as u64, SeqCst);
    }

    fn next_flag_is_busy(&self) -> bool {
        self.read_next_flags() & FLAG_BUSY != 0
    }

    fn set_next_flag_busy(&self) {
        self.next.fetch_or(FLAG_BUSY as u64, SeqCst);
    }

    fn set_next_flag_busy_granted(&self) {
        self.next.fetch_or((FLAG_BUSY | STATE_GRANTED_BIT) as u64, SeqCst);
    }

    fn unset_next_flag_busy(&self) {
        self.next.fetch_and(!(FLAG_BUSY as u64), SeqCst);
    }

    fn set_next_flag_reader_successor(&self) {
        debug_assert!(self.read_next_flags() & SUCC_MASK == 0);
        self.next.fetch_or(SUCC_READER as u64, SeqCst);
    }

    fn set_next_flag_writer_successor(&self) {
        debug_assert!(self.read_next_flags() & SUCC_MASK == 0);
        self.next.fetch_or(SUCC_WRITER as u64, SeqCst);
    }

    fn set_next_flag_no_successor(&self) {
        self.next.fetch_and(!(SUCC_MASK as u64), SeqCst);
    }

    fn next_flag_has_successor(&self) -> bool {
        self.read_next_flags() & SUCC_MASK != 0
    }

    fn next_flag_has_reader_successor(&self) -> bool {
        self.read_next_flags() & SUCC_MASK == SUCC_READER
    }

    fn next_flag_has_writer_successor(&self) -> bool {
        self.read_next_flags() & SUCC_MASK == SUCC_WRITER
    }

    /// Spins on the pred flags within the given budget. Returns whether the
    /// lock was granted.
    fn wait_granted<R: Relax>(&self, timeout: Timeout) -> bool {
        match timeout {
            Timeout::Never => {
                spin_until::<R, _>(|| self.pred_flag_is_granted());
                true
            }
            Timeout::Immediate => self.pred_flag_is_granted(),
            Timeout::Spins(budget) => {
                let mut relax = R::new();
                for _ in 0..budget {
                    if self.pred_flag_is_granted() {
                        return true;
                    }
                    relax.relax();
                }
                self.pred_flag_is_granted()
            }
        }
    }
}

impl Default for McsRwExtendedBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// The extended reader-writer MCS lock engine.
///
/// One engine instance belongs to one worker thread and wraps that worker's
/// [`Adaptor`] handle; the host must store [`McsRwExtendedBlock`]s. Generic
/// over the relax policy `R` applied in its wait loops.
///
/// # Example
///
/// ```
/// use mcsrw::mock::ExtendedArena;
/// use mcsrw::relax::Spin;
/// use mcsrw::rw::extended::McsRwExtended;
/// use mcsrw::rw::McsRwLock;
///
/// let arena = ExtendedArena::with_capacity(1, 8);
/// let engine: McsRwExtended<_, Spin> = McsRwExtended::new(arena.adaptor(0));
///
/// let lock = McsRwLock::new();
/// let asked = engine.acquire_async_writer(&lock);
/// assert!(asked.acquired);
/// engine.release_writer(&lock, asked.block_index);
/// assert!(!lock.is_locked());
/// ```
pub struct McsRwExtended<A, R> {
    adaptor: A,
    marker: PhantomData<R>,
}

impl<A, R> McsRwExtended<A, R>
where
    A: Adaptor<RwBlock = McsRwExtendedBlock>,
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
        let (result, block_index) = self.acquire_reader(lock, Timeout::Never);
        debug_assert_eq!(result, AcquireResult::Granted);
        #[cfg(debug_assertions)]
        {
            let my_block = self.adaptor.my_rw_block(block_index);
            debug_assert!(my_block.pred_flag_is_granted());
            debug_assert!(my_block.next_flag_is_granted());
        }
        block_index
    }

    /// Acquires the lock in writer mode, blocking (spinning) until granted.
    pub fn acquire_unconditional_writer(&self, lock: &McsRwLock) -> BlockIndex {
        let (result, block_index) = self.acquire_writer(lock, Timeout::Never);
        debug_assert_eq!(result, AcquireResult::Granted);
        #[cfg(debug_assertions)]
        {
            let my_block = self.adaptor.my_rw_block(block_index);
            debug_assert!(my_block.pred_flag_is_granted());
            debug_assert!(my_block.next_flag_is_granted());
        }
        block_index
    }

    /// Acquires the lock in reader mode within the given spin budget.
    ///
    /// Returns [`Granted`] with the block to release, [`Cancelled`] after a
    /// timed-out acquisition has been withdrawn from the queue, or, only
    /// with [`Timeout::Immediate`], [`Requested`] with the block still
    /// queued, which the caller then owns as an async acquisition.
    ///
    /// [`Granted`]: AcquireResult::Granted
    /// [`Cancelled`]: AcquireResult::Cancelled
    /// [`Requested`]: AcquireResult::Requested
    pub fn acquire_timeout_reader(
        &self,
        lock: &McsRwLock,
        timeout: Timeout,
    ) -> (AcquireResult, BlockIndex) {
        self.acquire_reader(lock, timeout)
    }

    /// Acquires the lock in writer mode within the given spin budget. See
    /// [`acquire_timeout_reader`].
    ///
    /// [`acquire_timeout_reader`]: Self::acquire_timeout_reader
    pub fn acquire_timeout_writer(
        &self,
        lock: &McsRwLock,
        timeout: Timeout,
    ) -> (AcquireResult, BlockIndex) {
        self.acquire_writer(lock, timeout)
    }

    /// Tries to acquire the lock in writer mode without ever waiting: one
    /// whole-word CAS from the fully released state. Leaves no queue state
    /// behind on failure.
    pub fn acquire_try_writer(&self, lock: &McsRwLock) -> Option<BlockIndex> {
        let id = self.adaptor.my_id();
        let block_index = self.adaptor.issue_new_block();
        let my_block = self.adaptor.my_rw_block(block_index);
        my_block.init_writer();
        my_block.set_pred_flag_granted();
        my_block.set_next_flag_granted();
        let desired = make_word(tail_code(id, block_index), 0, NEXT_WRITER_NONE);
        lock.cas_word_weak(EMPTY_WORD, desired).then_some(block_index)
    }

    /// Tries to acquire the lock in reader mode without ever waiting.
    ///
    /// Succeeds only while the lock is free or held by granted readers with
    /// no writer parked; retries its snapshot on CAS interference but never
    /// enqueues, so failure leaves no queue state behind.
    pub fn acquire_try_reader(&self, lock: &McsRwLock) -> Option<BlockIndex> {
        let id = self.adaptor.my_id();
        let block_index = self.adaptor.issue_new_block();
        loop {
            let word = lock.snapshot();
            if word_next_writer(word) != NEXT_WRITER_NONE {
                return None;
            }
            let tail = word_tail(word);
            let pred_block = (tail != 0).then(|| self.adaptor.dereference_rw_tail(tail));
            if let Some(pred) = pred_block {
                if !(pred.pred_flag_is_granted() && pred.is_reader()) {
                    return None;
                }
            }
            let my_tail = tail_code(id, block_index);
            let desired = make_word(my_tail, word_nreaders(word) + 1, NEXT_WRITER_NONE);
            let my_block = self.adaptor.my_rw_block(block_index);
            my_block.init_reader();
            if lock.cas_word_weak(word, desired) {
                if let Some(pred) = pred_block {
                    // The join already counted us; release of the old tail
                    // must not examine a successor.
                    pred.set_next_id(SUCC_ID_NO_SUCCESSOR);
                }
                my_block.set_pred_flag_granted();
                let result = self.finish_acquire_reader(lock, my_block, my_tail);
                debug_assert_eq!(result, AcquireResult::Granted);
                return Some(block_index);
            }
        }
    }

    /// Releases a reader-mode acquisition.
    pub fn release_reader(&self, lock: &McsRwLock, block_index: BlockIndex) {
        let id = self.adaptor.my_id();
        debug_assert!(block_index > 0);
        debug_assert!(self.adaptor.current_block_index() >= block_index);
        let my_tail = tail_code(id, block_index);
        let my_block = self.adaptor.my_rw_block(block_index);
        debug_assert!(my_block.next_flag_is_granted());

        // Successors must not leave during release; readers can still join
        // as usual by seeing the granted state.
        my_block.set_next_flag_busy();
        spin_until::<R, _>(|| my_block.get_next_id() != SUCC_ID_SUCCESSOR_LEAVING);

        let mut next_id = my_block.get_next_id();
        while next_id == 0 {
            if lock.cas_tail(my_tail, 0) {
                // Really no one behind us.
                self.finish_release_reader(lock);
                return;
            }
            next_id = my_block.get_next_id();
        }
        debug_assert!(next_id != SUCC_ID_SUCCESSOR_LEAVING);
        if next_id != SUCC_ID_NO_SUCCESSOR {
            let succ_block = self.adaptor.dereference_rw_tail(next_id);
            debug_assert!(my_block.next_flag_has_successor());
            debug_assert!(!succ_block.pred_flag_is_granted());
            if succ_block.is_reader() {
                // A successor that has not joined by itself, e.g. handed
                // over by a cancelled block in between: grant it.
                debug_assert!(my_block.next_flag_is_busy());
                lock.increment_nreaders();
                while !succ_block.cas_pred_id(my_tail, PRED_ID_ACQUIRED) {}
                succ_block.set_pred_flag_granted();
            } else {
                debug_assert!(my_block.next_flag_has_writer_successor());
                debug_assert_eq!(lock.next_writer(), NEXT_WRITER_NONE);
                // Park the writer and detach it from this block.
                lock.set_next_writer(tail_thread_id(next_id));
                spin_until::<R, _>(|| succ_block.cas_pred_id(my_tail, 0));
            }
        }
        self.finish_release_reader(lock);
    }

    /// Releases a writer-mode acquisition.
    pub fn release_writer(&self, lock: &McsRwLock, block_index: BlockIndex) {
        let id = self.adaptor.my_id();
        debug_assert!(block_index > 0);
        debug_assert!(self.adaptor.current_block_index() >= block_index);
        let my_tail = tail_code(id, block_index);
        let my_block = self.adaptor.my_rw_block(block_index);
        debug_assert!(my_block.pred_flag_is_granted());
        debug_assert!(my_block.next_flag_is_granted());
        debug_assert_eq!(lock.nreaders(), 0);
        debug_assert_eq!(lock.next_writer(), NEXT_WRITER_NONE);

        // Make sure the successor can't leave.
        my_block.set_next_flag_busy();
        spin_until::<R, _>(|| my_block.get_next_id() != SUCC_ID_SUCCESSOR_LEAVING);

        let mut next_id = my_block.get_next_id();
        while next_id == 0 {
            if lock.cas_tail(my_tail, 0) {
                return;
            }
            next_id = my_block.get_next_id();
        }
        debug_assert!(my_block.next_flag_has_successor());
        debug_assert!(next_id != SUCC_ID_SUCCESSOR_LEAVING);
        debug_assert!(next_id != SUCC_ID_NO_SUCCESSOR);

        let succ_block = self.adaptor.dereference_rw_tail(next_id);
        debug_assert!(!succ_block.pred_flag_is_granted());
        debug_assert!(succ_block.get_pred_id() != PRED_ID_ACQUIRED);
        while !succ_block.cas_pred_id(my_tail, PRED_ID_ACQUIRED) {
            // The busy bit pins the successor in place.
            debug_assert_eq!(my_block.get_next_id(), next_id);
        }
        if succ_block.is_reader() {
            lock.increment_nreaders();
        }
        succ_block.set_pred_flag_granted();
    }

    /// Asynchronous reader acquisition: enqueues the block and returns
    /// without waiting.
    ///
    /// When not `acquired`, the block stays queued: the caller must later
    /// bring it to a grant via [`retry_async_reader`] (followed by a
    /// release) or withdraw it via [`cancel_async_reader`] before this
    /// adaptor is torn down.
    ///
    /// [`retry_async_reader`]: Self::retry_async_reader
    /// [`cancel_async_reader`]: Self::cancel_async_reader
    pub fn acquire_async_reader(&self, lock: &McsRwLock) -> AcquireAsync {
        let (result, block_index) = self.acquire_reader(lock, Timeout::Immediate);
        debug_assert!(matches!(result, AcquireResult::Granted | AcquireResult::Requested));
        #[cfg(debug_assertions)]
        {
            let my_block = self.adaptor.my_rw_block(block_index);
            if result == AcquireResult::Granted {
                debug_assert!(my_block.pred_flag_is_granted());
                debug_assert!(my_block.next_flag_is_granted());
            } else {
                debug_assert!(!my_block.next_flag_is_granted());
            }
        }
        AcquireAsync { acquired: result == AcquireResult::Granted, block_index }
    }

    /// Asynchronous writer acquisition. See [`acquire_async_reader`].
    ///
    /// [`acquire_async_reader`]: Self::acquire_async_reader
    pub fn acquire_async_writer(&self, lock: &McsRwLock) -> AcquireAsync {
        let (result, block_index) = self.acquire_writer(lock, Timeout::Immediate);
        debug_assert!(matches!(result, AcquireResult::Granted | AcquireResult::Requested));
        #[cfg(debug_assertions)]
        {
            let my_block = self.adaptor.my_rw_block(block_index);
            if result == AcquireResult::Granted {
                debug_assert!(my_block.pred_flag_is_granted());
                debug_assert!(my_block.next_flag_is_granted());
            } else {
                debug_assert!(!my_block.next_flag_is_granted());
            }
        }
        AcquireAsync { acquired: result == AcquireResult::Granted, block_index }
    }

    /// Polls a queued asynchronous reader acquisition. Returns `true` once
    /// the lock is held, completing the deferred grant handshake if needed.
    pub fn retry_async_reader(&self, lock: &McsRwLock, block_index: BlockIndex) -> bool {
        let my_block = self.adaptor.my_rw_block(block_index);
        if my_block.pred_flag_is_granted() {
            // Examining our own next flags is not a race: we are their only
            // writer.
            if !my_block.next_flag_is_granted() {
                let my_tail = tail_code(self.adaptor.my_id(), block_index);
                let result = self.finish_acquire_reader(lock, my_block, my_tail);
                debug_assert_eq!(result, AcquireResult::Granted);
            }
            debug_assert!(my_block.next_flag_is_granted());
            return true;
        }
        debug_assert!(!my_block.next_flag_is_granted());
        false
    }

    /// Polls a queued asynchronous writer acquisition. Returns `true` once
    /// the lock is held.
    pub fn retry_async_writer(&self, _lock: &McsRwLock, block_index: BlockIndex) -> bool {
        let my_block = self.adaptor.my_rw_block(block_index);
        if my_block.pred_flag_is_granted() {
            if !my_block.next_flag_is_granted() {
                my_block.set_next_flag_granted();
            }
            debug_assert!(my_block.next_flag_is_granted());
            return true;
        }
        debug_assert!(!my_block.next_flag_is_granted());
        false
    }

    /// Withdraws a queued asynchronous reader acquisition.
    ///
    /// If the grant wins the race against the withdrawal, the acquisition
    /// is completed and released on the caller's behalf; either way the
    /// block is free for reuse when this returns.
    pub fn cancel_async_reader(&self, lock: &McsRwLock, block_index: BlockIndex) {
        if self.retry_async_reader(lock, block_index) {
            self.release_reader(lock, block_index);
        } else {
            let my_tail = tail_code(self.adaptor.my_id(), block_index);
            if self.cancel_reader(lock, my_tail) == AcquireResult::Granted {
                // The predecessor granted anyway; undo by a plain release.
                self.release_reader(lock, block_index);
            }
        }
    }

    /// Withdraws a queued asynchronous writer acquisition. See
    /// [`cancel_async_reader`].
    ///
    /// [`cancel_async_reader`]: Self::cancel_async_reader
    pub fn cancel_async_writer(&self, lock: &McsRwLock, block_index: BlockIndex) {
        let my_tail = tail_code(self.adaptor.my_id(), block_index);
        if self.cancel_writer(lock, my_tail) == AcquireResult::Granted {
            self.release_writer(lock, block_index);
        }
    }

    fn acquire_reader(&self, lock: &McsRwLock, timeout: Timeout) -> (AcquireResult, BlockIndex) {
        debug_assert!(self.adaptor.current_block_index() < BlockIndex::MAX);
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        let my_block = self.adaptor.my_rw_block(block_index);
        my_block.init_reader();
        debug_assert!(my_block.pred_flag_is_waiting());
        debug_assert!(my_block.next_flag_is_waiting());
        debug_assert!(!my_block.next_flag_is_busy());
        let id = self.adaptor.my_id();
        let my_tail = tail_code(id, block_index);

        let pred = lock.xchg_tail(my_tail);
        if pred == 0 {
            lock.increment_nreaders();
            debug_assert_eq!(my_block.get_pred_id(), 0);
            my_block.set_pred_flag_granted();
            return (self.finish_acquire_reader(lock, my_block, my_tail), block_index);
        }

        debug_assert_eq!(my_block.get_pred_id(), 0);
        // We have not published a link yet, so the predecessor cannot
        // recycle: safe to resolve.
        let pred_block = self.adaptor.dereference_rw_tail(pred);
        let result = if pred_block.is_reader() {
            self.acquire_reader_check_reader_pred(lock, my_block, my_tail, pred, timeout)
        } else {
            self.acquire_reader_check_writer_pred(lock, my_block, my_tail, pred, timeout)
        };
        (result, block_index)
    }

    /// Post-grant handshake of a reader: pulls in a reader successor that
    /// registered while this block was still waiting (or was promised one
    /// by the cancellation chain), then clears the busy bit. Must complete
    /// before the block may be released.
    fn finish_acquire_reader(
        &self,
        lock: &McsRwLock,
        my_block: &McsRwExtendedBlock,
        my_tail: u32,
    ) -> AcquireResult {
        my_block.set_next_flag_busy_granted();
        debug_assert!(my_block.next_flag_is_granted());
        debug_assert!(my_block.next_flag_is_busy());
        spin_until::<R, _>(|| my_block.get_next_id() != SUCC_ID_SUCCESSOR_LEAVING);

        // If the lock tail still points here, truly no one is behind us.
        if lock.tail() == my_tail {
            my_block.unset_next_flag_busy();
            return AcquireResult::Granted;
        }
        // The successor can't cancel against the busy bit: next id is
        // stable once published.
        spin_until::<R, _>(|| my_block.get_next_id() != 0);
        let next_id = my_block.get_next_id();
        debug_assert!(next_id != 0);
        debug_assert!(next_id != SUCC_ID_SUCCESSOR_LEAVING);
        if next_id == SUCC_ID_NO_SUCCESSOR {
            my_block.unset_next_flag_busy();
            return AcquireResult::Granted;
        }

        let succ_block = self.adaptor.dereference_rw_tail(next_id);
        if my_block.next_flag_is_leaving_granted() && !my_block.next_flag_has_successor() {
            // The successor saw this block in leaving state and did not
            // register; it is parked on us waiting for a new predecessor,
            // or for exactly this grant.
            spin_until::<R, _>(|| succ_block.get_pred_id() == my_tail);
            debug_assert!(succ_block.pred_flag_is_waiting());
            // The parked successor cannot move its pred id here: only this
            // block writes it until the hand-off completes.
            while !succ_block.cas_pred_id(my_tail, PRED_ID_ACQUIRED) {}
            lock.increment_nreaders();
            succ_block.set_pred_flag_granted();
            // Release must know there is no successor left to wake.
            my_block.set_next_id(SUCC_ID_NO_SUCCESSOR);
        } else if my_block.next_flag_has_reader_successor() {
            loop {
                spin_until::<R, _>(|| succ_block.get_pred_id() == my_tail);
                if succ_block.cas_pred_id(my_tail, PRED_ID_ACQUIRED) {
                    debug_assert!(succ_block.pred_flag_is_waiting());
                    lock.increment_nreaders();
                    succ_block.set_pred_flag_granted();
                    my_block.set_next_id(SUCC_ID_NO_SUCCESSOR);
                    break;
                }
            }
        }
        my_block.unset_next_flag_busy();
        AcquireResult::Granted
    }

    fn acquire_reader_check_reader_pred(
        &self,
        lock: &McsRwLock,
        my_block: &McsRwExtendedBlock,
        my_tail: u32,
        mut pred: u32,
        timeout: Timeout,
    ) -> AcquireResult {
        loop {
            let pred_block = self.adaptor.dereference_rw_tail(pred);
            debug_assert_eq!(my_block.get_pred_id(), 0);
            debug_assert!(pred_block.is_reader());
            // Wait out a previous successor that is still mid-cancellation.
            spin_until::<R, _>(|| {
                pred_block.get_next_id() == 0 && !pred_block.next_flag_has_successor()
            });
            let expected = waiting_no_successor_flags(true);
            let desired = waiting_reader_successor_flags(true);
            match pred_block.cas_next_flags(expected, desired) {
                Ok(_) => {
                    // Registered: publish the link and wait to be granted.
                    pred_block.set_next_id(my_tail);
                    my_block.set_pred_id(pred);
                    return if my_block.wait_granted::<R>(timeout) {
                        self.finish_acquire_reader(lock, my_block, my_tail)
                    } else if timeout == Timeout::Immediate {
                        AcquireResult::Requested
                    } else {
                        self.cancel_reader(lock, my_tail)
                    };
                }
                Err(flags) if flags & STATE_MASK == STATE_LEAVING => {
                    // Leave the successor class alone. The leaving
                    // predecessor either hands us a new predecessor, or
                    // wakes us up if it won the lock after all.
                    pred_block.set_next_id(my_tail);
                    my_block.set_pred_id(pred);
                    spin_until::<R, _>(|| {
                        my_block.get_pred_id() != pred || !my_block.pred_flag_is_waiting()
                    });
                    // Consume and retry.
                    let observed = my_block.xchg_pred_id(0);
                    if observed == PRED_ID_ACQUIRED {
                        spin_until::<R, _>(|| my_block.pred_flag_is_granted());
                        return self.finish_acquire_reader(lock, my_block, my_tail);
                    }
                    debug_assert!(!my_block.pred_flag_is_granted());
                    debug_assert!(observed != 0);
                    pred = observed;
                    if self.adaptor.dereference_rw_tail(pred).is_writer() {
                        return self.acquire_reader_check_writer_pred(
                            lock, my_block, my_tail, pred, timeout,
                        );
                    }
                }
                Err(flags) => {
                    // Granted, directly or while leaving. We never
                    // registered, so it won't wake us: mark its successor id
                    // consumed so neither its finalize nor its release will
                    // examine us, and join as a granted reader. This also
                    // covers a predecessor with the busy bit set.
                    let state = flags & STATE_MASK;
                    debug_assert!(
                        state == STATE_DIRECT_GRANTED || state == STATE_LEAVING_GRANTED
                    );
                    pred_block.set_next_id(SUCC_ID_NO_SUCCESSOR);
                    lock.increment_nreaders();
                    my_block.set_pred_flag_granted();
                    return self.finish_acquire_reader(lock, my_block, my_tail);
                }
            }
        }
    }

    fn acquire_reader_check_writer_pred(
        &self,
        lock: &McsRwLock,
        my_block: &McsRwExtendedBlock,
        my_tail: u32,
        pred: u32,
        timeout: Timeout,
    ) -> AcquireResult {
        let pred_block = self.adaptor.dereference_rw_tail(pred);
        debug_assert!(pred_block.is_writer());
        // Wait out a previous successor that is still mid-cancellation.
        spin_until::<R, _>(|| {
            pred_block.get_next_id() == 0 && !pred_block.next_flag_has_successor()
        });
        debug_assert_eq!(my_block.get_pred_id(), 0);
        // The predecessor is a writer, we wait either way: register on its
        // flags first, then publish the link, then park with the timeout.
        pred_block.set_next_flag_reader_successor();
        pred_block.set_next_id(my_tail);
        let timeout = if my_block.xchg_pred_id(pred) == PRED_ID_ACQUIRED {
            Timeout::Never
        } else {
            timeout
        };

        if my_block.wait_granted::<R>(timeout) {
            return self.finish_acquire_reader(lock, my_block, my_tail);
        }
        if timeout == Timeout::Immediate {
            return AcquireResult::Requested;
        }
        trace!(tail = my_tail, "reader timed out behind writer");
        self.cancel_reader(lock, my_tail)
    }

    fn cancel_reader(&self, lock: &McsRwLock, my_tail: u32) -> AcquireResult {
        let my_block = self.adaptor.dereference_rw_tail(my_tail);
        // Stop the predecessor from granting.
        let pred = my_block.xchg_pred_id(0);
        if pred == PRED_ID_ACQUIRED {
            // Cancellation lost the race: the grant is already under way.
            spin_until::<R, _>(|| my_block.pred_flag_is_granted());
            return self.finish_acquire_reader(lock, my_block, my_tail);
        }

        // Successors must not leave now, unless one tried to leave first.
        debug_assert!(!my_block.next_flag_is_granted());
        my_block.set_next_flag_leaving();
        spin_until::<R, _>(|| my_block.get_next_id() != SUCC_ID_SUCCESSOR_LEAVING);

        debug_assert!(pred != 0);
        let pred_block = self.adaptor.dereference_rw_tail(pred);
        if pred_block.is_reader() {
            self.cancel_reader_with_reader_pred(lock, my_block, my_tail, pred)
        } else {
            debug_assert_eq!(my_block.get_pred_id(), 0);
            self.cancel_reader_with_writer_pred(lock, my_block, my_tail, pred)
        }
    }

    fn cancel_reader_with_writer_pred(
        &self,
        lock: &McsRwLock,
        my_block: &McsRwExtendedBlock,
        my_tail: u32,
        mut pred: u32,
    ) -> AcquireResult {
        'retry: loop {
            debug_assert!(my_block.next_flag_is_leaving());
            debug_assert!(pred != 0);
            debug_assert!(tail_thread_id(pred) != self.adaptor.my_id());
            let pred_block = self.adaptor.dereference_rw_tail(pred);
            debug_assert!(pred_block.is_writer());
            // Wait for a cancelling predecessor to finish its relink.
            spin_until::<R, _>(|| {
                pred_block.get_next_id() == my_tail
                    && pred_block.next_flag_has_reader_successor()
            });
            debug_assert_eq!(my_block.get_pred_id(), 0);
            loop {
                let flags = pred_block.read_next_flags();
                if flags & STATE_MASK == STATE_LEAVING {
                    // The predecessor has priority to leave; it gives us a
                    // new predecessor after its CAS to pass us the lock
                    // failed.
                    debug_assert_eq!(my_block.get_pred_id(), 0);
                    my_block.set_pred_id(pred);
                    spin_until::<R, _>(|| my_block.get_pred_id() != pred);
                    let observed = my_block.xchg_pred_id(0);
                    if observed == PRED_ID_ACQUIRED {
                        spin_until::<R, _>(|| my_block.pred_flag_is_granted());
                        return self.finish_acquire_reader(lock, my_block, my_tail);
                    }
                    debug_assert!(observed != 0);
                    pred = observed;
                    if self.adaptor.dereference_rw_tail(pred).is_writer() {
                        continue 'retry;
                    }
                    return self.cancel_reader_with_reader_pred(lock, my_block, my_tail, pred);
                } else if flags & FLAG_BUSY != 0 {
                    // Releasing: accept the grant instead.
                    debug_assert!(pred_block.next_flag_is_granted());
                    my_block.set_pred_id(pred);
                    spin_until::<R, _>(|| my_block.pred_flag_is_granted());
                    return self.finish_acquire_reader(lock, my_block, my_tail);
                }
                // Tell the predecessor we are leaving.
                let expected = compose_next(my_tail, flags);
                let desired = compose_next(SUCC_ID_SUCCESSOR_LEAVING, flags);
                if pred_block.cas_next(expected, desired).is_ok() {
                    break;
                }
            }
            // The beacon is in place: the predecessor will not wake us
            // during its release. Repair the queue around this block.
            if my_block.get_next_id() == 0 && lock.cas_tail(my_tail, pred) {
                pred_block.set_next_flag_no_successor();
                pred_block.set_next_id(0);
                debug_assert!(!my_block.next_flag_has_successor());
                return AcquireResult::Cancelled;
            }
            self.cancel_reader_relink(pred_block, my_block, my_tail, pred);
            return AcquireResult::Cancelled;
        }
    }

    fn cancel_reader_with_reader_pred(
        &self,
        lock: &McsRwLock,
        my_block: &McsRwExtendedBlock,
        my_tail: u32,
        mut pred: u32,
    ) -> AcquireResult {
        loop {
            debug_assert!(my_block.next_flag_is_leaving());
            debug_assert!(pred != 0);
            debug_assert!(tail_thread_id(pred) != self.adaptor.my_id());
            let pred_block = self.adaptor.dereference_rw_tail(pred);
            // Wait for a cancelling predecessor to finish its relink.
            spin_until::<R, _>(|| {
                pred_block.next_flag_has_reader_successor()
                    && pred_block.get_next_id() == my_tail
            });

            // Withdraw from pred.next in one step, putting the beacon in
            // the id field only.
            let flags = waiting_reader_successor_flags(true);
            let expected = compose_next(my_tail, flags);
            let desired = compose_next(SUCC_ID_SUCCESSOR_LEAVING, flags);
            match pred_block.cas_next(expected, desired) {
                Err(observed) => {
                    let state = next_flags_of(observed) & STATE_MASK;
                    if state == STATE_DIRECT_GRANTED || state == STATE_LEAVING_GRANTED {
                        // We once registered as a reader successor (still
                        // are), so the granted predecessor will wake us in
                        // its finish-acquire; it already has us on its next
                        // id, just restore ours. This also covers a
                        // predecessor with the busy bit set.
                        my_block.set_pred_id(pred);
                        my_block.wait_granted::<R>(Timeout::Never);
                        return self.finish_acquire_reader(lock, my_block, my_tail);
                    }
                    debug_assert_eq!(state, STATE_LEAVING);
                    // The predecessor has priority to leave and already has
                    // us on its next id; wait for a new predecessor or for
                    // a grant.
                    my_block.set_pred_id(pred);
                    spin_until::<R, _>(|| {
                        my_block.get_pred_id() != pred || !my_block.pred_flag_is_waiting()
                    });
                    // Consume and retry.
                    let observed = my_block.xchg_pred_id(0);
                    if observed == PRED_ID_ACQUIRED {
                        spin_until::<R, _>(|| my_block.pred_flag_is_granted());
                        return self.finish_acquire_reader(lock, my_block, my_tail);
                    }
                    debug_assert!(!my_block.pred_flag_is_granted());
                    debug_assert!(observed != 0);
                    pred = observed;
                    if self.adaptor.dereference_rw_tail(pred).is_writer() {
                        return self.cancel_reader_with_writer_pred(
                            lock, my_block, my_tail, pred,
                        );
                    }
                }
                Ok(_) => {
                    // From here the predecessor waits for a new successor
                    // if it decides to move, and our successor waits for a
                    // new predecessor.
                    debug_assert!(my_block.next_flag_is_leaving());
                    if !my_block.next_flag_has_successor() && lock.cas_tail(my_tail, pred) {
                        // A successor arriving now waits for the beacon to
                        // clear before registering with the predecessor.
                        debug_assert_eq!(my_block.get_next_id(), 0);
                        debug_assert!(!my_block.next_flag_has_successor());
                        debug_assert_eq!(pred_block.get_next_id(), SUCC_ID_SUCCESSOR_LEAVING);
                        pred_block.set_next_flag_no_successor();
                        pred_block.set_next_id(0);
                        return AcquireResult::Cancelled;
                    }
                    self.cancel_reader_relink(pred_block, my_block, my_tail, pred);
                    return AcquireResult::Cancelled;
                }
            }
        }
    }

    /// Splices this leaving block out of the middle of the queue: swings
    /// the successor's pred id over to `pred`, then rewrites `pred`'s next
    /// word with the successor and its registered class, preserving the
    /// predecessor's own role, state and busy bit.
    fn cancel_reader_relink(
        &self,
        pred_block: &McsRwExtendedBlock,
        my_block: &McsRwExtendedBlock,
        my_tail: u32,
        pred: u32,
    ) {
        spin_until::<R, _>(|| my_block.get_next_id() != 0);
        debug_assert!(my_block.next_flag_is_leaving());
        let next_id = my_block.get_next_id();
        debug_assert!(next_id != 0);
        debug_assert!(next_id != SUCC_ID_SUCCESSOR_LEAVING);
        let succ_block = self.adaptor.dereference_rw_tail(next_id);
        debug_assert!(pred != 0);
        while !succ_block.cas_pred_id(my_tail, pred) {}

        let successor_class = if my_block.next_flag_has_reader_successor() {
            SUCC_READER
        } else if my_block.next_flag_has_writer_successor() {
            SUCC_WRITER
        } else {
            // The successor never registered a class; it re-resolves its
            // new predecessor by itself.
            0
        };
        debug_assert!(pred_block.next_flag_has_reader_successor());
        debug_assert_eq!(pred_block.get_next_id(), SUCC_ID_SUCCESSOR_LEAVING);

        loop {
            let expected = pred_block.get_next();
            debug_assert_eq!(next_id_of(expected), SUCC_ID_SUCCESSOR_LEAVING);
            let kept = next_flags_of(expected) & (STATE_MASK | FLAG_BUSY | FLAG_READER);
            let desired = if successor_class == 0 {
                compose_next(0, kept)
            } else {
                compose_next(next_id, kept | successor_class)
            };
            if pred_block.cas_next(expected, desired).is_ok() {
                break;
            }
        }
    }

    fn finish_release_reader(&self, lock: &McsRwLock) {
        if lock.decrement_nreaders() > 1 {
            return;
        }
        // Last reader out wakes the parked writer, if any.
        let next_writer = lock.next_writer();
        if next_writer != NEXT_WRITER_NONE
            && lock.nreaders() == 0
            && lock.cas_next_writer(next_writer, NEXT_WRITER_NONE)
        {
            // A worker waits for one lock at a time, so the parked writer's
            // newest block is the one parked on this lock.
            let next_index = self.adaptor.other_current_block_index(next_writer);
            let writer_block = self.adaptor.other_rw_block(next_writer, next_index);
            debug_assert!(!writer_block.pred_flag_is_granted());
            while !writer_block.cas_pred_id(0, PRED_ID_ACQUIRED) {}
            debug_assert_eq!(lock.nreaders(), 0);
            writer_block.set_pred_flag_granted();
        }
    }

    fn acquire_writer(&self, lock: &McsRwLock, timeout: Timeout) -> (AcquireResult, BlockIndex) {
        debug_assert!(self.adaptor.current_block_index() < BlockIndex::MAX);
        let block_index = self.adaptor.issue_new_block();
        debug_assert!(block_index > 0);
        let my_block = self.adaptor.my_rw_block(block_index);
        my_block.init_writer();
        debug_assert!(my_block.is_writer());
        let id = self.adaptor.my_id();
        let my_tail = tail_code(id, block_index);

        let pred = lock.xchg_tail(my_tail);
        if pred == 0 {
            // Queue was empty, but readers may be active: park in
            // `next_writer` and claim the grant back if they are not.
            debug_assert_eq!(lock.next_writer(), NEXT_WRITER_NONE);
            lock.set_next_writer(id);
            if lock.nreaders() == 0 && lock.xchg_next_writer(NEXT_WRITER_NONE) == id {
                my_block.set_pred_flag_granted();
                my_block.set_next_flag_granted();
                debug_assert_eq!(lock.nreaders(), 0);
                return (AcquireResult::Granted, block_index);
            }
        } else {
            let pred_block = self.adaptor.dereference_rw_tail(pred);
            // Wait out a previous successor that is still mid-cancellation,
            // then register on the flags first and publish the link after.
            spin_until::<R, _>(|| {
                !pred_block.next_flag_has_successor() && pred_block.get_next_id() == 0
            });
            pred_block.set_next_flag_writer_successor();
            pred_block.set_next_id(my_tail);
        }

        let timeout = if my_block.xchg_pred_id(pred) == PRED_ID_ACQUIRED {
            Timeout::Never
        } else {
            timeout
        };
        if my_block.wait_granted::<R>(timeout) {
            my_block.set_next_flag_granted();
            debug_assert_eq!(lock.nreaders(), 0);
            debug_assert_eq!(lock.next_writer(), NEXT_WRITER_NONE);
            return (AcquireResult::Granted, block_index);
        }
        if timeout == Timeout::Immediate {
            return (AcquireResult::Requested, block_index);
        }
        trace!(tail = my_tail, "writer timed out");
        (self.cancel_writer(lock, my_tail), block_index)
    }

    fn cancel_writer(&self, lock: &McsRwLock, my_tail: u32) -> AcquireResult {
        let my_block = self.adaptor.dereference_rw_tail(my_tail);
        // A releasing predecessor that has already resolved this block will
        // CAS the pred id to acquired, so take one final exit here: there
        // is no way back after this point.
        let mut pred = my_block.xchg_pred_id(0);
        if pred == PRED_ID_ACQUIRED {
            spin_until::<R, _>(|| my_block.pred_flag_is_granted());
            my_block.set_next_flag_granted();
            debug_assert_eq!(lock.nreaders(), 0);
            return AcquireResult::Granted;
        }

        // Freeze the successor.
        my_block.set_next_flag_leaving();
        debug_assert!(!my_block.next_flag_is_granted());
        spin_until::<R, _>(|| my_block.get_next_id() != SUCC_ID_SUCCESSOR_LEAVING);

        // With no predecessor at all, this block is parked on the lock's
        // `next_writer` slot; deregister from there instead. A releasing
        // reader resets our pred id first, then parks us there.
        if pred == 0 {
            return self.cancel_writer_no_pred(lock, my_block, my_tail);
        }
        debug_assert!(pred != 0);
        let mut pred_block = self.adaptor.dereference_rw_tail(pred);
        loop {
            // Wait for a cancelling predecessor to finish its relink; the
            // predecessor binding is refreshed on every pass.
            spin_until::<R, _>(|| {
                pred_block.get_next_id() == my_tail
                    && pred_block.next_flag_has_writer_successor()
            });
            let flags = pred_block.read_next_flags();
            if flags & STATE_MASK == STATE_LEAVING {
                debug_assert_eq!(my_block.get_pred_id(), 0);
                // Cancelling or releasing; either way it hands us
                // something: park and consume what arrives.
                my_block.set_pred_id(pred);
                spin_until::<R, _>(|| my_block.get_pred_id() != pred);
                let observed = my_block.xchg_pred_id(0);
                if observed == 0 {
                    // A releasing reader predecessor parked us on
                    // `next_writer`.
                    return self.cancel_writer_no_pred(lock, my_block, my_tail);
                } else if observed == PRED_ID_ACQUIRED {
                    spin_until::<R, _>(|| my_block.pred_flag_is_granted());
                    my_block.set_next_flag_granted();
                    debug_assert_eq!(lock.nreaders(), 0);
                    return AcquireResult::Granted;
                }
                pred = observed;
                pred_block = self.adaptor.dereference_rw_tail(pred);
                continue;
            } else if flags & FLAG_BUSY != 0 {
                // The predecessor is releasing. Our pred id is zero, so it
                // can do nothing to us yet; it is safe to examine.
                if pred_block.is_writer() {
                    debug_assert_eq!(pred_block.get_next_id(), my_tail);
                    my_block.set_pred_id(pred);
                    spin_until::<R, _>(|| my_block.pred_flag_is_granted());
                    debug_assert_eq!(my_block.get_pred_id(), PRED_ID_ACQUIRED);
                    my_block.set_next_flag_granted();
                    debug_assert_eq!(lock.nreaders(), 0);
                    return AcquireResult::Granted;
                }
                debug_assert!(pred_block.is_reader());
                // The releasing reader either grants us or parks us on
                // `next_writer`; hand it our id back and see which.
                my_block.set_pred_id(pred);
                let observed = my_block.xchg_pred_id(0);
                if observed == 0 {
                    return self.cancel_writer_no_pred(lock, my_block, my_tail);
                } else if observed == PRED_ID_ACQUIRED {
                    spin_until::<R, _>(|| my_block.pred_flag_is_granted());
                    my_block.set_next_flag_granted();
                    debug_assert_eq!(lock.nreaders(), 0);
                    return AcquireResult::Granted;
                }
                pred = observed;
                pred_block = self.adaptor.dereference_rw_tail(pred);
                continue;
            }
            debug_assert_eq!(pred_block.get_next_id(), my_tail);
            debug_assert!(flags & STATE_MASK != STATE_LEAVING);
            let expected = compose_next(my_tail, flags);
            let desired = compose_next(SUCC_ID_SUCCESSOR_LEAVING, flags);
            if pred_block.cas_next(expected, desired).is_ok() {
                debug_assert_eq!(pred_block.get_next_id(), SUCC_ID_SUCCESSOR_LEAVING);
                break;
            }
        }

        debug_assert_eq!(pred_block.get_next_id(), SUCC_ID_SUCCESSOR_LEAVING);
        if my_block.get_next_id() == 0 && lock.cas_tail(my_tail, pred) {
            pred_block.set_next_flag_no_successor();
            pred_block.set_next_id(0);
            return AcquireResult::Cancelled;
        }
        spin_until::<R, _>(|| my_block.get_next_id() != 0);
        debug_assert!(my_block.next_flag_is_leaving());
        let next_id = my_block.get_next_id();
        debug_assert!(next_id != 0);
        debug_assert!(next_id != SUCC_ID_SUCCESSOR_LEAVING);
        let succ_block = self.adaptor.dereference_rw_tail(next_id);
        while !succ_block.cas_pred_id(my_tail, pred) {}

        let successor_class = if my_block.next_flag_has_reader_successor() {
            SUCC_READER
        } else if my_block.next_flag_has_writer_successor() {
            SUCC_WRITER
        } else {
            0
        };
        debug_assert!(pred_block.next_flag_has_writer_successor());
        debug_assert_eq!(pred_block.get_next_id(), SUCC_ID_SUCCESSOR_LEAVING);
        loop {
            let expected = pred_block.get_next();
            debug_assert_eq!(next_id_of(expected), SUCC_ID_SUCCESSOR_LEAVING);
            let kept = next_flags_of(expected) & (STATE_MASK | FLAG_BUSY | FLAG_READER);
            let desired = if successor_class == 0 {
                compose_next(0, kept)
            } else {
                compose_next(next_id, kept | successor_class)
            };
            if pred_block.cas_next(expected, desired).is_ok() {
                break;
            }
        }
        AcquireResult::Cancelled
    }

    fn cancel_writer_no_pred(
        &self,
        lock: &McsRwLock,
        my_block: &McsRwExtendedBlock,
        my_tail: u32,
    ) -> AcquireResult {
        spin_until::<R, _>(|| {
            lock.next_writer() != NEXT_WRITER_NONE || !my_block.pred_flag_is_waiting()
        });
        if my_block.pred_flag_is_granted()
            || !lock.cas_next_writer(self.adaptor.my_id(), NEXT_WRITER_NONE)
        {
            // A reader picked us up in the meantime; accept the grant.
            spin_until::<R, _>(|| my_block.pred_flag_is_granted());
            my_block.set_next_flag_granted();
            return AcquireResult::Granted;
        }

        // `next_writer` is clear now; try to fix the lock tail.
        if my_block.get_next_id() == 0 && lock.cas_tail(my_tail, 0) {
            return AcquireResult::Cancelled;
        }
        spin_until::<R, _>(|| my_block.get_next_id() != 0);
        let next_id = my_block.get_next_id();
        debug_assert!(next_id != SUCC_ID_SUCCESSOR_LEAVING);

        // Without a predecessor to splice to, a writer successor takes over
        // the parking slot and a reader successor is granted outright.
        let succ_block = self.adaptor.dereference_rw_tail(next_id);
        debug_assert!(succ_block.pred_flag_is_waiting());
        if succ_block.is_writer() {
            debug_assert!(my_block.next_flag_has_writer_successor());
            debug_assert_eq!(lock.next_writer(), NEXT_WRITER_NONE);
            // Remaining readers go through a CAS on `next_writer`, so the
            // blind store is safe.
            lock.set_next_writer(tail_thread_id(next_id));
            while !succ_block.cas_pred_id(my_tail, 0) {}
        } else {
            debug_assert!(my_block.next_flag_has_reader_successor());
            debug_assert!(succ_block.is_reader());
            spin_until::<R, _>(|| succ_block.cas_pred_id(my_tail, PRED_ID_ACQUIRED));
            lock.increment_nreaders();
            succ_block.set_pred_flag_granted();
        }
        AcquireResult::Cancelled
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::{McsRwExtended, McsRwExtendedBlock};
    use super::{PRED_ID_ACQUIRED, SUCC_ID_NO_SUCCESSOR, SUCC_ID_SUCCESSOR_LEAVING};
    use crate::mock::{ExtendedArena, MockAdaptor};
    use crate::relax::Yield;
    use crate::rw::{AcquireResult, McsRwLock, Timeout};
    use crate::test::Occupancy;

    type Engine = McsRwExtended<MockAdaptor<McsRwExtendedBlock>, Yield>;

    fn engines(arena: &ExtendedArena, n: u16) -> Vec<Engine> {
        (0..n).map(|id| McsRwExtended::new(arena.adaptor(id))).collect()
    }

    #[test]
    fn block_layout() {
        assert_eq!(core::mem::size_of::<McsRwExtendedBlock>(), 16);
        assert_eq!(core::mem::align_of::<McsRwExtendedBlock>(), 8);
        assert_eq!(PRED_ID_ACQUIRED, 1);
        assert_eq!(SUCC_ID_NO_SUCCESSOR, u32::MAX - 1);
        assert_eq!(SUCC_ID_SUCCESSOR_LEAVING, u32::MAX);
    }

    #[test]
    fn unconditional_roundtrip() {
        let arena = ExtendedArena::with_capacity(1, 8);
        let engine: Engine = McsRwExtended::new(arena.adaptor(0));
        let lock = McsRwLock::new();

        let block = engine.acquire_unconditional_reader(&lock);
        assert_eq!(lock.nreaders(), 1);
        engine.release_reader(&lock, block);
        assert!(!lock.is_locked());

        let block = engine.acquire_unconditional_writer(&lock);
        assert_eq!(lock.nreaders(), 0);
        engine.release_writer(&lock, block);
        assert!(!lock.is_locked());
    }

    #[test]
    fn async_writer_race_on_empty() {
        let arena = ExtendedArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 2);

        let first = e[0].acquire_async_writer(&lock);
        assert!(first.acquired);
        let second = e[1].acquire_async_writer(&lock);
        assert!(!second.acquired);
        assert!(!e[1].retry_async_writer(&lock, second.block_index));

        e[1].cancel_async_writer(&lock, second.block_index);
        e[0].release_writer(&lock, first.block_index);
        assert!(!lock.is_locked());
    }

    #[test]
    fn async_writer_granted_through_handoff() {
        let arena = ExtendedArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 2);

        let first = e[0].acquire_async_writer(&lock);
        assert!(first.acquired);
        let second = e[1].acquire_async_writer(&lock);
        assert!(!second.acquired);

        e[0].release_writer(&lock, first.block_index);
        assert!(e[1].retry_async_writer(&lock, second.block_index));
        e[1].release_writer(&lock, second.block_index);
        assert!(!lock.is_locked());
    }

    #[test]
    fn async_reader_behind_writer_retries_to_grant() {
        let arena = ExtendedArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 2);

        let writer = e[0].acquire_async_writer(&lock);
        assert!(writer.acquired);
        let reader = e[1].acquire_async_reader(&lock);
        assert!(!reader.acquired);
        assert!(!e[1].retry_async_reader(&lock, reader.block_index));

        e[0].release_writer(&lock, writer.block_index);
        assert!(e[1].retry_async_reader(&lock, reader.block_index));
        assert_eq!(lock.nreaders(), 1);
        e[1].release_reader(&lock, reader.block_index);
        assert!(!lock.is_locked());
    }

    #[test]
    fn async_reader_joins_granted_reader() {
        let arena = ExtendedArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 2);

        let first = e[0].acquire_unconditional_reader(&lock);
        let second = e[1].acquire_async_reader(&lock);
        // Behind an already granted reader the join happens on the spot.
        assert!(second.acquired);
        assert_eq!(lock.nreaders(), 2);

        e[0].release_reader(&lock, first);
        e[1].release_reader(&lock, second.block_index);
        assert!(!lock.is_locked());
    }

    #[test]
    fn cancel_between_holder_and_waiting_writer() {
        let arena = ExtendedArena::with_capacity(3, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 3);

        // Queue: R0 (granted) <- W1 <- R2, then R2 withdraws.
        let r0 = e[0].acquire_unconditional_reader(&lock);
        let w1 = e[1].acquire_async_writer(&lock);
        assert!(!w1.acquired);
        let r2 = e[2].acquire_async_reader(&lock);
        assert!(!r2.acquired);

        e[2].cancel_async_reader(&lock, r2.block_index);

        e[0].release_reader(&lock, r0);
        assert!(e[1].retry_async_writer(&lock, w1.block_index));
        e[1].release_writer(&lock, w1.block_index);
        assert!(!lock.is_locked());
        assert_eq!(lock.nreaders(), 0);
    }

    #[test]
    fn cancel_tail_writer_behind_writer() {
        let arena = ExtendedArena::with_capacity(3, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 3);

        let r0 = e[0].acquire_unconditional_reader(&lock);
        let w1 = e[1].acquire_async_writer(&lock);
        assert!(!w1.acquired);
        let w2 = e[2].acquire_async_writer(&lock);
        assert!(!w2.acquired);

        // The tail writer withdraws; the queue must shrink back to W1.
        e[2].cancel_async_writer(&lock, w2.block_index);

        e[0].release_reader(&lock, r0);
        assert!(e[1].retry_async_writer(&lock, w1.block_index));
        e[1].release_writer(&lock, w1.block_index);
        assert!(!lock.is_locked());
    }

    #[test]
    fn cancel_middle_writer_relinks_queue() {
        let arena = ExtendedArena::with_capacity(4, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 4);

        // Queue: R0 (granted) <- W1 <- W2 <- W3; W2 withdraws from the
        // middle, so W3 must get relinked behind W1.
        let r0 = e[0].acquire_unconditional_reader(&lock);
        let w1 = e[1].acquire_async_writer(&lock);
        let w2 = e[2].acquire_async_writer(&lock);
        let w3 = e[3].acquire_async_writer(&lock);
        assert!(!w1.acquired && !w2.acquired && !w3.acquired);

        e[2].cancel_async_writer(&lock, w2.block_index);

        e[0].release_reader(&lock, r0);
        assert!(e[1].retry_async_writer(&lock, w1.block_index));
        e[1].release_writer(&lock, w1.block_index);
        assert!(e[3].retry_async_writer(&lock, w3.block_index));
        e[3].release_writer(&lock, w3.block_index);
        assert!(!lock.is_locked());
    }

    #[test]
    fn cancel_accepts_racing_grant() {
        let arena = ExtendedArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 2);

        let r0 = e[0].acquire_unconditional_reader(&lock);
        let w1 = e[1].acquire_async_writer(&lock);
        assert!(!w1.acquired);

        // The release grants W1 before it gets to cancel: the cancellation
        // must turn into a grant-and-release, leaving the lock free.
        e[0].release_reader(&lock, r0);
        e[1].cancel_async_writer(&lock, w1.block_index);
        assert!(!lock.is_locked());
        assert_eq!(lock.nreaders(), 0);
    }

    #[test]
    fn cancel_parked_writer_without_pred() {
        let arena = ExtendedArena::with_capacity(3, 16);
        let lock = McsRwLock::new();
        let e = engines(&arena, 3);

        // Two joined readers, then a writer behind them. The first reader
        // to release parks the writer on `next_writer` with no predecessor
        // left; the cancel must deregister from the parking slot.
        let r0 = e[0].acquire_unconditional_reader(&lock);
        let r1 = e[1].acquire_unconditional_reader(&lock);
        let w2 = e[2].acquire_async_writer(&lock);
        assert!(!w2.acquired);

        e[1].release_reader(&lock, r1);
        assert_eq!(lock.nreaders(), 1);
        e[2].cancel_async_writer(&lock, w2.block_index);

        e[0].release_reader(&lock, r0);
        assert!(!lock.is_locked());
    }

    #[test]
    fn bounded_timeout_reader_cancels() {
        let arena = ExtendedArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 2);

        let writer = e[0].acquire_unconditional_writer(&lock);
        let (result, _) = e[1].acquire_timeout_reader(&lock, Timeout::Spins(64));
        assert_eq!(result, AcquireResult::Cancelled);

        e[0].release_writer(&lock, writer);
        assert!(!lock.is_locked());
    }

    #[test]
    fn bounded_timeout_writer_cancels() {
        let arena = ExtendedArena::with_capacity(2, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 2);

        let holder = e[0].acquire_unconditional_writer(&lock);
        let (result, _) = e[1].acquire_timeout_writer(&lock, Timeout::Spins(64));
        assert_eq!(result, AcquireResult::Cancelled);

        e[0].release_writer(&lock, holder);
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_paths() {
        let arena = ExtendedArena::with_capacity(3, 8);
        let lock = McsRwLock::new();
        let e = engines(&arena, 3);

        let w = e[0].acquire_try_writer(&lock).expect("uncontended try must win");
        assert!(e[1].acquire_try_writer(&lock).is_none());
        assert!(e[1].acquire_try_reader(&lock).is_none());
        e[0].release_writer(&lock, w);

        let r = e[0].acquire_try_reader(&lock).expect("uncontended try must win");
        let joined = e[1].acquire_try_reader(&lock).expect("granted reader admits try readers");
        assert_eq!(lock.nreaders(), 2);
        assert!(e[2].acquire_try_writer(&lock).is_none());
        e[0].release_reader(&lock, r);
        e[1].release_reader(&lock, joined);
        assert!(!lock.is_locked());
    }

    #[test]
    fn readers_and_writers_exclude() {
        const THREADS: u16 = 4;
        const ITERS: u32 = 200;

        let arena = ExtendedArena::with_capacity(THREADS as usize, (ITERS + 1) as usize);
        let lock = Arc::new(McsRwLock::new());
        let occupancy = Arc::new(Occupancy::new());

        let handles = (0..THREADS)
            .map(|id| {
                let arena = arena.clone();
                let lock = Arc::clone(&lock);
                let occupancy = Arc::clone(&occupancy);
                thread::spawn(move || {
                    let engine: Engine = McsRwExtended::new(arena.adaptor(id));
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

    #[test]
    fn randomized_cancel_workload() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        const THREADS: u16 = 4;
        const ITERS: u32 = 300;

        let arena = ExtendedArena::with_capacity(THREADS as usize, (ITERS + 1) as usize);
        let lock = Arc::new(McsRwLock::new());
        let occupancy = Arc::new(Occupancy::new());

        let handles = (0..THREADS)
            .map(|id| {
                let arena = arena.clone();
                let lock = Arc::clone(&lock);
                let occupancy = Arc::clone(&occupancy);
                thread::spawn(move || {
                    let engine: Engine = McsRwExtended::new(arena.adaptor(id));
                    let mut rng = SmallRng::seed_from_u64(0xD1CE + u64::from(id));
                    for _ in 0..ITERS {
                        let writer = rng.random_bool(0.4);
                        match rng.random_range(0..3u8) {
                            // Unconditional.
                            0 => {
                                if writer {
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
                            // Bounded timeout; cancellation is the point.
                            1 => {
                                let timeout = Timeout::Spins(rng.random_range(0..512));
                                if writer {
                                    let (result, block) =
                                        engine.acquire_timeout_writer(&lock, timeout);
                                    if result == AcquireResult::Granted {
                                        occupancy.enter_writer();
                                        occupancy.exit_writer();
                                        engine.release_writer(&lock, block);
                                    }
                                } else {
                                    let (result, block) =
                                        engine.acquire_timeout_reader(&lock, timeout);
                                    if result == AcquireResult::Granted {
                                        occupancy.enter_reader();
                                        occupancy.exit_reader();
                                        engine.release_reader(&lock, block);
                                    }
                                }
                            }
                            // Async, then either retry to grant or cancel.
                            _ => {
                                if writer {
                                    let asked = engine.acquire_async_writer(&lock);
                                    let mut granted = asked.acquired;
                                    for _ in 0..rng.random_range(0..64u32) {
                                        if granted {
                                            break;
                                        }
                                        granted =
                                            engine.retry_async_writer(&lock, asked.block_index);
                                    }
                                    if granted {
                                        occupancy.enter_writer();
                                        occupancy.exit_writer();
                                        engine.release_writer(&lock, asked.block_index);
                                    } else {
                                        engine.cancel_async_writer(&lock, asked.block_index);
                                    }
                                } else {
                                    let asked = engine.acquire_async_reader(&lock);
                                    let mut granted = asked.acquired;
                                    for _ in 0..rng.random_range(0..64u32) {
                                        if granted {
                                            break;
                                        }
                                        granted =
                                            engine.retry_async_reader(&lock, asked.block_index);
                                    }
                                    if granted {
                                        occupancy.enter_reader();
                                        occupancy.exit_reader();
                                        engine.release_reader(&lock, asked.block_index);
                                    } else {
                                        engine.cancel_async_reader(&lock, asked.block_index);
                                    }
                                }
                            }
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

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;

    #[test]
    fn rw_ext_async_writer_race() {
        models::rw_ext_async_writer_race();
    }
}
