pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64};
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

pub mod thread {
    #[cfg(all(any(feature = "yield", test), not(all(loom, test))))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    pub use loom::thread::yield_now;
}
