#![cfg_attr(not(test), no_std)]

mod lazy_lock;
mod relax;
mod spin;

pub use lazy_lock::LazyLock;
pub use relax::{LoopRelax, Relax, SpinRelax};
pub use spin::{NoContext, Spin, SpinContext, SpinGuard};
