pub mod spin_mutex;

pub use spin_mutex::{MutexGuard, SpinMutex as SpinLock};
