#![allow(clippy::redundant_pub_crate)]

//! Loom models exercising the engines under exhaustive interleaving.
//!
//! The models are deliberately small (two worker threads) since each extra
//! thread multiplies the state space. Data protected by a lock lives in a
//! Loom `UnsafeCell`, so any exclusion violation surfaces as an illegal
//! concurrent access rather than a silently corrupted counter.

pub(crate) mod models {
    use loom::cell::UnsafeCell;
    use loom::thread;

    // Plain std Arc: only the cells and atomics need Loom's tracking, and
    // the model explores fewer states without a tracked refcount.
    use std::sync::Arc;
    use std::vec::Vec;

    use crate::mock::{ExtendedArena, MockAdaptor, SimpleArena};
    use crate::relax::Yield;
    use crate::rw::extended::{McsRwExtended, McsRwExtendedBlock};
    use crate::rw::simple::McsRwSimpleBlock;
    use crate::rw::McsRwLock;
    use crate::ww::{McsLock, McsWw};

    type WwEngine = McsWw<MockAdaptor<McsRwSimpleBlock>, Yield>;
    type ExtEngine = McsRwExtended<MockAdaptor<McsRwExtendedBlock>, Yield>;

    pub(crate) fn ww_exclusion_join() {
        loom::model(|| {
            let arena = SimpleArena::with_capacity(2, 4);
            let lock = Arc::new(McsLock::new());
            let data = Arc::new(UnsafeCell::new(0_u32));

            let handles = (0..2_u16)
                .map(|id| {
                    let arena = arena.clone();
                    let lock = Arc::clone(&lock);
                    let data = Arc::clone(&data);
                    thread::spawn(move || {
                        let engine: WwEngine = McsWw::new(arena.adaptor(id));
                        let block = engine.acquire_unconditional(&lock);
                        data.with_mut(|ptr| unsafe { *ptr += 1 });
                        engine.release(&lock, block);
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                handle.join().unwrap();
            }
            assert!(!lock.is_locked());
            data.with(|ptr| assert_eq!(unsafe { *ptr }, 2));
        });
    }

    pub(crate) fn ww_guest_vs_worker() {
        loom::model(|| {
            let arena = SimpleArena::with_capacity(1, 4);
            let lock = Arc::new(McsLock::new());
            let data = Arc::new(UnsafeCell::new(0_u32));

            let worker = {
                let arena = arena.clone();
                let lock = Arc::clone(&lock);
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let engine: WwEngine = McsWw::new(arena.adaptor(0));
                    let block = engine.acquire_unconditional(&lock);
                    data.with_mut(|ptr| unsafe { *ptr += 1 });
                    engine.release(&lock, block);
                })
            };

            crate::ww::ownerless_acquire_unconditional::<Yield>(&lock);
            data.with_mut(|ptr| unsafe { *ptr += 1 });
            crate::ww::ownerless_release::<Yield>(&lock);

            worker.join().unwrap();
            assert!(!lock.is_locked());
            data.with(|ptr| assert_eq!(unsafe { *ptr }, 2));
        });
    }

    pub(crate) fn rw_ext_async_writer_race() {
        loom::model(|| {
            let arena = ExtendedArena::with_capacity(2, 4);
            let lock = Arc::new(McsRwLock::new());
            let data = Arc::new(UnsafeCell::new(0_u32));

            let handles = (0..2_u16)
                .map(|id| {
                    let arena = arena.clone();
                    let lock = Arc::clone(&lock);
                    let data = Arc::clone(&data);
                    thread::spawn(move || {
                        let engine: ExtEngine = McsRwExtended::new(arena.adaptor(id));
                        let asked = engine.acquire_async_writer(&lock);
                        if asked.acquired {
                            data.with_mut(|ptr| unsafe { *ptr += 1 });
                            engine.release_writer(&lock, asked.block_index);
                        } else {
                            // May turn into a grant mid-cancel; either way
                            // the block is free afterwards.
                            engine.cancel_async_writer(&lock, asked.block_index);
                        }
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                handle.join().unwrap();
            }
            assert!(!lock.is_locked());
        });
    }
}
