#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{compiler_fence, AtomicUsize, Ordering};

/// A CPU's preemption-disable nesting counter. The scheduler may switch
/// tasks on a CPU only while its count is zero.
#[derive(Debug, Default)]
pub struct PreemptCount(AtomicUsize);

impl PreemptCount {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline(always)]
    pub fn disable(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
        compiler_fence(Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn enable(&self) {
        compiler_fence(Ordering::AcqRel);
        let old = self.0.fetch_sub(1, Ordering::Relaxed);
        debug_assert_ne!(old, 0, "Enabling preemption while already enabled");
    }

    #[inline(always)]
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[macro_export]
macro_rules! assert_preempt_enabled {
    ($pc:expr) => {{
        assert_eq!($pc.count(), 0, "Preemption is not enabled",);
    }};

    ($pc:expr, $msg:literal) => {{
        assert_eq!($pc.count(), 0, "{}: Preemption is not enabled", $msg,);
    }};
}

#[macro_export]
macro_rules! assert_preempt_disabled {
    ($pc:expr) => {{
        assert_ne!($pc.count(), 0, "Preemption is not disabled",);
    }};

    ($pc:expr, $msg:literal) => {{
        assert_ne!($pc.count(), 0, "{}: Preemption is not disabled", $msg,);
    }};
}
