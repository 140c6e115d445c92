use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use zenith_mm::paging::PAGE_SIZE_BITS;

/// Top of the user half of every address space, 32-bit style.
pub const USER_SPACE_TOP: usize = 0xc000_0000;

/// DMA-reachable memory ends at 16 MiB.
pub const DMA_PFN_LIMIT: usize = (16 << 20) >> PAGE_SIZE_BITS;
/// Directly mapped memory ends at 896 MiB; beyond is high memory.
pub const NORMAL_PFN_LIMIT: usize = (896 << 20) >> PAGE_SIZE_BITS;

/// Runtime-settable tuning knobs, readable from any context.
pub struct KernelConfig {
    swap_monitor_interval_ms: AtomicU64,
    swap_pressure_threshold: AtomicU64,
    swap_auto_adjust: AtomicBool,
    load_balance_interval_ms: AtomicU64,
    load_balance_imbalance_pct: AtomicU64,
    rt_runtime_us: AtomicU64,
    rt_period_us: AtomicU64,
    rr_time_slice_ms: AtomicU64,
    normal_time_slice_ms: AtomicU64,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            swap_monitor_interval_ms: AtomicU64::new(1000),
            swap_pressure_threshold: AtomicU64::new(75),
            swap_auto_adjust: AtomicBool::new(false),
            load_balance_interval_ms: AtomicU64::new(1000),
            load_balance_imbalance_pct: AtomicU64::new(25),
            rt_runtime_us: AtomicU64::new(950_000),
            rt_period_us: AtomicU64::new(1_000_000),
            rr_time_slice_ms: AtomicU64::new(100),
            normal_time_slice_ms: AtomicU64::new(100),
        }
    }

    pub fn swap_monitor_interval_ms(&self) -> u64 {
        self.swap_monitor_interval_ms.load(Ordering::Relaxed)
    }

    pub fn set_swap_monitor_interval_ms(&self, value: u64) {
        self.swap_monitor_interval_ms.store(value, Ordering::Relaxed);
    }

    pub fn swap_pressure_threshold(&self) -> u64 {
        self.swap_pressure_threshold.load(Ordering::Relaxed)
    }

    pub fn set_swap_pressure_threshold(&self, value: u64) {
        self.swap_pressure_threshold.store(value, Ordering::Relaxed);
    }

    pub fn swap_auto_adjust(&self) -> bool {
        self.swap_auto_adjust.load(Ordering::Relaxed)
    }

    pub fn set_swap_auto_adjust(&self, value: bool) {
        self.swap_auto_adjust.store(value, Ordering::Relaxed);
    }

    pub fn load_balance_interval_ms(&self) -> u64 {
        self.load_balance_interval_ms.load(Ordering::Relaxed)
    }

    pub fn set_load_balance_interval_ms(&self, value: u64) {
        self.load_balance_interval_ms.store(value, Ordering::Relaxed);
    }

    pub fn load_balance_imbalance_pct(&self) -> u64 {
        self.load_balance_imbalance_pct.load(Ordering::Relaxed)
    }

    pub fn set_load_balance_imbalance_pct(&self, value: u64) {
        self.load_balance_imbalance_pct.store(value, Ordering::Relaxed);
    }

    pub fn rt_runtime_us(&self) -> u64 {
        self.rt_runtime_us.load(Ordering::Relaxed)
    }

    pub fn set_rt_runtime_us(&self, value: u64) {
        self.rt_runtime_us.store(value, Ordering::Relaxed);
    }

    pub fn rt_period_us(&self) -> u64 {
        self.rt_period_us.load(Ordering::Relaxed)
    }

    pub fn set_rt_period_us(&self, value: u64) {
        self.rt_period_us.store(value, Ordering::Relaxed);
    }

    pub fn rr_time_slice_ms(&self) -> u64 {
        self.rr_time_slice_ms.load(Ordering::Relaxed)
    }

    pub fn set_rr_time_slice_ms(&self, value: u64) {
        self.rr_time_slice_ms.store(value, Ordering::Relaxed);
    }

    pub fn normal_time_slice_ms(&self) -> u64 {
        self.normal_time_slice_ms.load(Ordering::Relaxed)
    }

    pub fn set_normal_time_slice_ms(&self, value: u64) {
        self.normal_time_slice_ms.store(value, Ordering::Relaxed);
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
