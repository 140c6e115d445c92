pub trait Relax {
    fn relax();
}

/// Emits the architectural spin-wait hint between lock attempts.
pub struct SpinRelax;

/// Busy-loops without a hint. For contexts where the hint instruction
/// is unavailable or undesirable.
pub struct LoopRelax;

impl Relax for SpinRelax {
    fn relax() {
        core::hint::spin_loop();
    }
}

impl Relax for LoopRelax {
    fn relax() {}
}
