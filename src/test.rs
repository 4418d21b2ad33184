//! Shared helpers for the multi-threaded test suites.

use core::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, Ordering::SeqCst};

/// An unsynchronized counter incremented under a lock being tested.
///
/// The increments are plain non-atomic read-modify-writes; a final count
/// that matches the number of increments is evidence of mutual exclusion,
/// and any violation is undefined behaviour the sanitizers and Loom can
/// catch.
pub(crate) struct RaceCell(UnsafeCell<u64>);

// SAFETY: Tests only access the cell while holding the lock under test.
unsafe impl Sync for RaceCell {}

impl RaceCell {
    pub(crate) const fn new() -> Self {
        Self(UnsafeCell::new(0))
    }

    /// # Safety
    ///
    /// Caller must hold the exclusive lock the cell is associated with.
    pub(crate) unsafe fn incr(&self) {
        *self.0.get() += 1;
    }

    /// # Safety
    ///
    /// Caller must hold the exclusive lock, or all writers must have been
    /// joined.
    pub(crate) unsafe fn get(&self) -> u64 {
        *self.0.get()
    }
}

/// Tracks who is inside a reader-writer critical section and asserts the
/// exclusion invariants on every transition: writers are alone, readers
/// never overlap a writer.
pub(crate) struct Occupancy {
    readers: AtomicI32,
    writers: AtomicI32,
}

impl Occupancy {
    pub(crate) const fn new() -> Self {
        Self { readers: AtomicI32::new(0), writers: AtomicI32::new(0) }
    }

    pub(crate) fn enter_reader(&self) {
        self.readers.fetch_add(1, SeqCst);
        assert_eq!(self.writers.load(SeqCst), 0, "reader admitted while a writer holds");
    }

    pub(crate) fn exit_reader(&self) {
        let prev = self.readers.fetch_sub(1, SeqCst);
        assert!(prev > 0);
    }

    pub(crate) fn enter_writer(&self) {
        let prev = self.writers.fetch_add(1, SeqCst);
        assert_eq!(prev, 0, "two writers admitted at once");
        assert_eq!(self.readers.load(SeqCst), 0, "writer admitted while readers hold");
    }

    pub(crate) fn exit_writer(&self) {
        let prev = self.writers.fetch_sub(1, SeqCst);
        assert_eq!(prev, 1);
    }
}
