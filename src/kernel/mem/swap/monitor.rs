use core::sync::atomic::{AtomicU64, Ordering};

use zenith_sync::Spin;

/// One sampling window's worth of rates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PressureSample {
    pub in_per_sec: u64,
    pub out_per_sec: u64,
    /// `out / (in + out + 1) * 100` over the window.
    pub pressure_pct: u64,
}

struct MonitorState {
    last_sample_ms: u64,
    last_ins: u64,
    last_outs: u64,
    last: PressureSample,
}

/// Samples swap traffic at the configured interval and derives the
/// pressure percentage the auto-tuner acts on.
pub struct SwapMonitor {
    swap_ins: AtomicU64,
    swap_outs: AtomicU64,
    state: Spin<MonitorState>,
}

impl SwapMonitor {
    pub const fn new() -> Self {
        Self {
            swap_ins: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            state: Spin::new(MonitorState {
                last_sample_ms: 0,
                last_ins: 0,
                last_outs: 0,
                last: PressureSample {
                    in_per_sec: 0,
                    out_per_sec: 0,
                    pressure_pct: 0,
                },
            }),
        }
    }

    pub fn count_in(&self) {
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_out(&self) {
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swap_ins(&self) -> u64 {
        self.swap_ins.load(Ordering::Relaxed)
    }

    pub fn swap_outs(&self) -> u64 {
        self.swap_outs.load(Ordering::Relaxed)
    }

    pub fn last_sample(&self) -> PressureSample {
        self.state.lock().last
    }

    /// Take a sample if the interval has elapsed. Returns the fresh sample
    /// when one was taken.
    pub fn sample(&self, now_ms: u64, interval_ms: u64) -> Option<PressureSample> {
        let mut state = self.state.lock();

        let elapsed = now_ms.saturating_sub(state.last_sample_ms);
        if elapsed < interval_ms.max(1) {
            return None;
        }

        let ins = self.swap_ins();
        let outs = self.swap_outs();
        let delta_in = ins - state.last_ins;
        let delta_out = outs - state.last_outs;

        let sample = PressureSample {
            in_per_sec: delta_in * 1000 / elapsed,
            out_per_sec: delta_out * 1000 / elapsed,
            pressure_pct: delta_out * 100 / (delta_in + delta_out + 1),
        };

        state.last_sample_ms = now_ms;
        state.last_ins = ins;
        state.last_outs = outs;
        state.last = sample;

        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_respects_the_interval() {
        let monitor = SwapMonitor::new();

        monitor.count_out();
        assert!(monitor.sample(500, 1000).is_none());
        assert!(monitor.sample(1000, 1000).is_some());
    }

    #[test]
    fn pressure_is_the_out_share() {
        let monitor = SwapMonitor::new();

        for _ in 0..9 {
            monitor.count_out();
        }
        // out / (in + out + 1): 9 / 10.
        let sample = monitor.sample(1000, 1000).unwrap();
        assert_eq!(sample.pressure_pct, 90);
        assert_eq!(sample.out_per_sec, 9);

        // A balanced window sits near 50%.
        for _ in 0..10 {
            monitor.count_in();
            monitor.count_out();
        }
        let sample = monitor.sample(2000, 1000).unwrap();
        assert_eq!(sample.pressure_pct, 10 * 100 / 21);
    }
}
