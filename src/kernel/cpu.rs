use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use zenith_mm::address::VAddr;
use zenith_percpu::CpuId;
use zenith_preempt::PreemptCount;
use zenith_sync::{Spin, SpinContext, SpinGuard};

/// A set of CPUs as a bitmask, used for task affinity and TLB-shootdown
/// targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    pub const fn all(nr_cpus: usize) -> Self {
        if nr_cpus >= 64 {
            Self(u64::MAX)
        } else {
            Self((1 << nr_cpus) - 1)
        }
    }

    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu.as_usize())
    }

    pub fn insert(&mut self, cpu: CpuId) {
        self.0 |= 1 << cpu.as_usize();
    }

    pub fn remove(&mut self, cpu: CpuId) {
        self.0 &= !(1 << cpu.as_usize());
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.as_usize()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..64).map(CpuId::from_val).filter(move |&cpu| self.contains(cpu))
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

/// Completion barrier for one TLB-shootdown broadcast. Every targeted CPU
/// arrives once; the initiator may not touch the unmapped frames until the
/// barrier is done.
pub struct TlbBarrier {
    remaining: AtomicUsize,
}

impl TlbBarrier {
    pub fn new(targets: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(targets),
        })
    }

    pub fn arrive(&self) {
        let old = self.remaining.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(old, 0, "TLB barrier over-arrived");
    }

    pub fn is_done(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

/// A flush posted to a remote CPU ahead of an invalidate IPI.
pub struct TlbRequest {
    /// `None` flushes the whole TLB.
    pub addr: Option<VAddr>,
    pub barrier: Arc<TlbBarrier>,
}

/// Saved interrupt-enable state, restored in reverse order of saving.
#[must_use]
pub struct IrqState {
    was_enabled: bool,
}

/// The per-CPU record: everything one processor replicates. Cross-CPU
/// communication happens only through the pending-IPI queue and the flags
/// below.
pub struct Cpu {
    id: CpuId,
    pub preempt: PreemptCount,
    irq_enabled: AtomicBool,
    /// Number of interrupt handlers currently active on this CPU.
    nesting: AtomicUsize,
    pub need_resched: AtomicBool,
    online: AtomicBool,
    /// Page-table root (mm id) currently loaded; 0 is the kernel-only root.
    active_root: AtomicUsize,
    preferred_node: AtomicUsize,
    tlb_flushes: AtomicU64,
    pending_ipis: Spin<VecDeque<(u8, usize)>>,
    pub tlb_requests: Spin<Vec<TlbRequest>>,
    pub call_queue: Spin<VecDeque<(fn(usize), usize)>>,
}

impl Cpu {
    pub fn new(id: CpuId) -> Self {
        Self {
            id,
            preempt: PreemptCount::new(),
            irq_enabled: AtomicBool::new(true),
            nesting: AtomicUsize::new(0),
            need_resched: AtomicBool::new(false),
            online: AtomicBool::new(true),
            active_root: AtomicUsize::new(0),
            preferred_node: AtomicUsize::new(0),
            tlb_flushes: AtomicU64::new(0),
            pending_ipis: Spin::new(VecDeque::new()),
            tlb_requests: Spin::new(Vec::new()),
            call_queue: Spin::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn irqs_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Relaxed)
    }

    pub fn set_irqs_enabled(&self, enabled: bool) {
        self.irq_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn local_irq_save(&self) -> IrqState {
        let was_enabled = self.irq_enabled.swap(false, Ordering::Relaxed);
        IrqState { was_enabled }
    }

    pub fn local_irq_restore(&self, state: IrqState) {
        self.irq_enabled.store(state.was_enabled, Ordering::Relaxed);
    }

    /// Current interrupt nesting level.
    pub fn nesting_level(&self) -> usize {
        self.nesting.load(Ordering::Relaxed)
    }

    pub fn enter_interrupt(&self) -> usize {
        self.nesting.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn leave_interrupt(&self) -> usize {
        let old = self.nesting.fetch_sub(1, Ordering::Relaxed);
        assert_ne!(old, 0, "interrupt nesting underflow");
        old - 1
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_offline(&self) {
        self.online.store(false, Ordering::Relaxed);
    }

    pub fn active_root(&self) -> usize {
        self.active_root.load(Ordering::Relaxed)
    }

    pub fn set_active_root(&self, root: usize) {
        self.active_root.store(root, Ordering::Relaxed);
    }

    pub fn preferred_node(&self) -> usize {
        self.preferred_node.load(Ordering::Relaxed)
    }

    pub fn set_preferred_node(&self, node: usize) {
        self.preferred_node.store(node, Ordering::Relaxed);
    }

    /// Model of the hardware TLB flush: bumps the flush generation.
    pub fn flush_tlb(&self) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_tlb_page(&self, _addr: VAddr) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tlb_flush_count(&self) -> u64 {
        self.tlb_flushes.load(Ordering::Relaxed)
    }

    /// Post an IPI vector. Delivery is idempotent: a vector already pending
    /// with the same datum is not queued twice.
    pub fn post_ipi(&self, vector: u8, datum: usize) {
        let mut pending = self.pending_ipis.lock();
        if !pending.iter().any(|&entry| entry == (vector, datum)) {
            pending.push_back((vector, datum));
        }
    }

    pub fn take_pending_ipi(&self) -> Option<(u8, usize)> {
        self.pending_ipis.lock().pop_front()
    }

    pub fn has_pending_ipis(&self) -> bool {
        !self.pending_ipis.lock().is_empty()
    }
}

/// Lock context that keeps local interrupts off for the guard's lifetime.
pub struct IrqSave<'a> {
    cpu: &'a Cpu,
    state: IrqState,
}

impl<'a> IrqSave<'a> {
    pub fn save(cpu: &'a Cpu) -> Self {
        let state = cpu.local_irq_save();
        Self { cpu, state }
    }
}

impl SpinContext for IrqSave<'_> {
    fn restore(self) {
        self.cpu.local_irq_restore(self.state);
    }
}

/// IRQ-safe locking: saves and restores the local interrupt-enable flag
/// around the critical section. Never use the plain `lock` on data an
/// interrupt handler also takes.
pub trait SpinIrq<T: ?Sized> {
    fn lock_irq<'a>(&'a self, cpu: &'a Cpu) -> SpinGuard<'a, T, IrqSave<'a>>;
}

impl<T: ?Sized> SpinIrq<T> for Spin<T> {
    fn lock_irq<'a>(&'a self, cpu: &'a Cpu) -> SpinGuard<'a, T, IrqSave<'a>> {
        self.lock_with_context(IrqSave::save(cpu))
    }
}
