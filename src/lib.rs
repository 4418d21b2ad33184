//! A family of Mellor-Crummey and Scott ([MCS]) queue locks for the
//! concurrency control layer of an in-memory transactional engine: a
//! write-write exclusive lock with an owner-less *guest* escape hatch, a
//! simple reader-writer lock, and an extended reader-writer lock that
//! supports asynchronous acquisition, timeouts and mid-queue cancellation.
//!
//! MCS locks are List-Based Queuing Locks that avoid network contention by
//! having each waiter spin on locally-accessible state. The main properties
//! of this mechanism are:
//!
//! - guarantees FIFO ordering of lock acquisitions (modulo cancellation);
//! - spins on locally-accessible flag variables only;
//! - requires a small constant amount of space per lock; and
//! - works equally well (requiring only O(1) network transactions per lock
//!   acquisition) on machines with and without coherent caches.
//!
//! ## Block storage and the adaptor
//!
//! Unlike a general-purpose mutex, these engines do not own their queue
//! nodes and do not guard an inner value. Every acquisition *issues* a
//! per-worker *block* out of host-owned storage and identifies it globally
//! by a packed `(thread id, block index)` *tail code*; the lock word itself
//! is a bare 32- or 64-bit cell the host can embed anywhere, in the spirit
//! of a database page or record header. The host side of that bargain is
//! the [`adaptor::Adaptor`] trait; the [`mock`] module provides the
//! canonical arena-backed implementation used by the tests and examples.
//!
//! A worker may hold any number of locks, but has at most one acquisition
//! *in flight* at a time, since a single waiting flag and a single newest
//! block participate in the hand-off and cancellation handshakes.
//!
//! ## Locking a reader-writer lock with cancellation
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use mcsrw::mock::ExtendedArena;
//! use mcsrw::relax::Spin;
//! use mcsrw::rw::extended::McsRwExtended;
//! use mcsrw::rw::McsRwLock;
//!
//! let arena = ExtendedArena::with_capacity(2, 8);
//! let lock = Arc::new(McsRwLock::new());
//!
//! let handle = {
//!     let arena = arena.clone();
//!     let lock = Arc::clone(&lock);
//!     thread::spawn(move || {
//!         let engine: McsRwExtended<_, Spin> = McsRwExtended::new(arena.adaptor(1));
//!         let block = engine.acquire_unconditional_writer(&lock);
//!         engine.release_writer(&lock, block);
//!     })
//! };
//!
//! let engine: McsRwExtended<_, Spin> = McsRwExtended::new(arena.adaptor(0));
//! let asked = engine.acquire_async_reader(&lock);
//! if asked.acquired || engine.retry_async_reader(&lock, asked.block_index) {
//!     engine.release_reader(&lock, asked.block_index);
//! } else {
//!     engine.cancel_async_reader(&lock, asked.block_index);
//! }
//!
//! handle.join().unwrap();
//! ```
//!
//! ## Features
//!
//! This crate enables the `std` feature by default. Features that can be
//! enabled are:
//!
//! ### std
//!
//! Links against the standard library and enables the [`mock`] adaptor
//! arena. Disable it for `no_std` environments:
//!
//! ```toml
//! [dependencies.mcsrw]
//! version = "0.1"
//! default-features = false
//! ```
//!
//! ### yield
//!
//! Enables the [`relax::Yield`] and [`relax::YieldBackoff`] policies, which
//! yield the time slice back to the OS scheduler during contention. Implies
//! `std`.
//!
//! [MCS]: https://dl.acm.org/doi/10.1145/103727.103729

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]
#![warn(missing_docs)]
#![allow(clippy::doc_markdown)]

mod cfg;

pub mod adaptor;
pub mod relax;
pub mod rw;
pub mod ww;

#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod mock;

#[cfg(all(loom, test))]
pub(crate) mod loom;

#[cfg(all(not(loom), test))]
pub(crate) mod test;

pub use adaptor::{Adaptor, BlockIndex, ThreadId};
pub use rw::{AcquireAsync, AcquireResult, McsRwLock, Timeout};
pub use ww::McsLock;
