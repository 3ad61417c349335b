#![no_std]
#![feature(negative_impls)]

pub mod mutex;

pub use mutex::{MutexGuard, SpinLock};
