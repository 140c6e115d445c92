use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use zenith_mm::address::VAddr;
use zenith_percpu::{CpuId, PerCpu};
use zenith_sync::Spin;

use crate::kernel::cpu::{Cpu, CpuSet, TlbBarrier, TlbRequest};
use crate::prelude::*;

pub const NR_VECTORS: usize = 256;
/// Vectors 0..32 are CPU exceptions.
pub const NR_EXCEPTIONS: u8 = 32;
/// Vectors 32..48 are hardware IRQs behind the interrupt-controller pair.
pub const IRQ_BASE: u8 = 32;
pub const NR_IRQS: u8 = 16;
/// Hardware IRQs at or above this vector are routed through the slave
/// controller and need its EOI first.
const SLAVE_VECTOR_BASE: u8 = 40;

pub const TIMER_VECTOR: u8 = IRQ_BASE;

/// Base of the reserved IPI block, in the software vector range.
pub const IPI_BASE: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiVector {
    CallFunction = 0,
    Reschedule = 1,
    Stop = 2,
    InvalidateTlb = 3,
    InvalidatePage = 4,
}

impl IpiVector {
    pub const fn vector(self) -> u8 {
        IPI_BASE + self as u8
    }
}

static EXCEPTION_NAMES: [&str; NR_EXCEPTIONS as usize] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point exception",
    "alignment check",
    "machine check",
    "SIMD floating-point exception",
    "virtualization exception",
    "control protection exception",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection exception",
    "VMM communication exception",
    "security exception",
    "reserved",
];

pub fn exception_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES[vector as usize]
}

/// What a handler sees: the CPU the vector arrived on and the vector's
/// payload (zero for plain hardware IRQs).
pub struct IrqEvent {
    pub cpu: CpuId,
    pub vector: u8,
    pub datum: usize,
}

type Handler = Box<dyn Fn(&IrqEvent) + Send + Sync>;

struct IrqAction {
    name: &'static str,
    handler: Handler,
}

/// Which controller a vector answers to, for the EOI protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqController {
    /// Exceptions and software vectors need no acknowledgement.
    None,
    /// Hardware IRQs behind the cascaded pair.
    Pic,
}

struct IrqDescriptor {
    /// Chain in prepend order: the most recently registered action sits at
    /// the front and runs last.
    actions: Vec<IrqAction>,
    /// Enable/disable nesting. Zero iff the vector is hardware-enabled.
    depth: u32,
    /// APIC priority class of the vector.
    priority: u8,
    controller: IrqController,
}

impl IrqDescriptor {
    const fn new(vector: u8) -> Self {
        Self {
            actions: Vec::new(),
            depth: 0,
            priority: vector >> 4,
            controller: if vector >= IRQ_BASE && vector < IRQ_BASE + NR_IRQS {
                IrqController::Pic
            } else {
                IrqController::None
            },
        }
    }
}

/// Model of the cascaded interrupt-controller pair; only the EOI protocol
/// is observable.
#[derive(Default)]
struct PicState {
    master_eoi: u64,
    slave_eoi: u64,
    spurious: u64,
}

/// A unit of work postponed out of interrupt context, run in FIFO order
/// once the outermost interrupt has returned.
struct DeferredWork {
    func: fn(usize),
    data: usize,
}

type ReschedHook = Box<dyn Fn(CpuId) + Send + Sync>;

/// The vector table plus everything interrupt dispatch touches: nesting
/// accounting lives in the per-CPU records, the deferred-work queue is
/// process-wide.
pub struct InterruptTable {
    cpus: Arc<PerCpu<Cpu>>,
    vectors: Vec<Spin<IrqDescriptor>>,
    pic: Spin<PicState>,
    deferred: Spin<VecDeque<DeferredWork>>,
    resched_hook: Spin<Option<ReschedHook>>,
}

impl InterruptTable {
    pub fn new(cpus: Arc<PerCpu<Cpu>>) -> Self {
        Self {
            cpus,
            vectors: (0..NR_VECTORS)
                .map(|vector| Spin::new(IrqDescriptor::new(vector as u8)))
                .collect(),
            pic: Spin::new(PicState::default()),
            deferred: Spin::new(VecDeque::new()),
            resched_hook: Spin::new(None),
        }
    }

    /// The scheduler entry invoked when an interrupt returns to nesting
    /// level zero with a reschedule pending.
    pub fn set_resched_hook(&self, hook: ReschedHook) {
        *self.resched_hook.lock() = Some(hook);
    }

    pub fn register_handler(
        &self,
        vector: usize,
        name: &'static str,
        handler: Handler,
    ) -> KResult<()> {
        if vector >= NR_VECTORS {
            return Err(KernelError::InvalidArgument);
        }

        self.vectors[vector]
            .lock()
            .actions
            .insert(0, IrqAction { name, handler });
        Ok(())
    }

    pub fn unregister_handler(&self, vector: usize, name: &'static str) -> KResult<()> {
        if vector >= NR_VECTORS {
            return Err(KernelError::InvalidArgument);
        }

        let mut desc = self.vectors[vector].lock();
        let position = desc
            .actions
            .iter()
            .position(|action| action.name == name)
            .ok_or(KernelError::NoEntry)?;

        desc.actions.remove(position);
        Ok(())
    }

    /// Mask the vector. Nests: every `disable_irq` needs a matching
    /// `enable_irq`.
    pub fn disable_irq(&self, vector: usize) -> KResult<()> {
        if vector >= NR_VECTORS {
            return Err(KernelError::InvalidArgument);
        }

        self.vectors[vector].lock().depth += 1;
        Ok(())
    }

    pub fn enable_irq(&self, vector: usize) -> KResult<()> {
        if vector >= NR_VECTORS {
            return Err(KernelError::InvalidArgument);
        }

        let mut desc = self.vectors[vector].lock();
        assert_ne!(desc.depth, 0, "unbalanced enable of vector {}", vector);
        desc.depth -= 1;
        Ok(())
    }

    pub fn irq_depth(&self, vector: usize) -> u32 {
        self.vectors[vector].lock().depth
    }

    pub fn vector_priority(&self, vector: usize) -> u8 {
        self.vectors[vector].lock().priority
    }

    pub fn handler_names(&self, vector: usize) -> Vec<&'static str> {
        self.vectors[vector]
            .lock()
            .actions
            .iter()
            .map(|action| action.name)
            .collect()
    }

    /// Queue `func` to run once interrupt nesting returns to zero.
    pub fn defer_work(&self, func: fn(usize), data: usize) {
        self.deferred.lock().push_back(DeferredWork { func, data });
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// One interrupt arriving on `cpu`. Models the whole entry/exit path:
    /// nesting accounting, the EOI protocol, handler-chain invocation with
    /// interrupts re-enabled, and the nesting-zero epilogue.
    pub fn dispatch(&self, cpu_id: CpuId, vector: u8, datum: usize) {
        let cpu = self.cpus.get(cpu_id);

        if vector >= NR_EXCEPTIONS && self.vectors[vector as usize].lock().depth > 0 {
            // The line is masked; the controller never delivers it.
            return;
        }

        let prior_irq = cpu.irqs_enabled();
        cpu.set_irqs_enabled(false);
        cpu.enter_interrupt();

        let is_exception = vector < NR_EXCEPTIONS;
        let is_hw_irq =
            self.vectors[vector as usize].lock().controller == IrqController::Pic;

        if is_hw_irq {
            // EOI goes out before the chain runs, slave first for the
            // cascaded range.
            let mut pic = self.pic.lock();
            if vector >= SLAVE_VECTOR_BASE {
                pic.slave_eoi += 1;
            }
            pic.master_eoi += 1;
        }

        {
            // The vector lock is held across the chain; a handler
            // re-registering on its own vector would deadlock, nested
            // dispatch of other vectors takes other locks.
            let desc = self.vectors[vector as usize].lock();

            if desc.actions.is_empty() {
                if is_exception {
                    panic!(
                        "unhandled exception {} ({}) on {:?}",
                        vector,
                        exception_name(vector),
                        cpu_id,
                    );
                }
                if is_hw_irq {
                    self.pic.lock().spurious += 1;
                }
            } else {
                if !is_exception {
                    cpu.set_irqs_enabled(true);
                }

                let event = IrqEvent {
                    cpu: cpu_id,
                    vector,
                    datum,
                };
                for action in desc.actions.iter().rev() {
                    (action.handler)(&event);
                }

                if !is_exception {
                    cpu.set_irqs_enabled(false);
                }
            }
        }

        let level = cpu.leave_interrupt();
        cpu.set_irqs_enabled(prior_irq);

        if level == 0 {
            self.drain_deferred(cpu);

            if cpu.need_resched.load(core::sync::atomic::Ordering::Relaxed) {
                let hook = self.resched_hook.lock();
                if let Some(hook) = hook.as_ref() {
                    hook(cpu_id);
                }
            }
        }
    }

    /// Run the deferred-work queue to exhaustion, each item with interrupts
    /// enabled, freed right after it runs.
    fn drain_deferred(&self, cpu: &Cpu) {
        loop {
            let Some(work) = self.deferred.lock().pop_front() else {
                break;
            };

            let prior = cpu.irqs_enabled();
            cpu.set_irqs_enabled(true);
            (work.func)(work.data);
            cpu.set_irqs_enabled(prior);
        }
    }

    /// Post an IPI to another CPU. The target picks it up on its next
    /// `service_pending`.
    pub fn send_ipi(&self, target: CpuId, ipi: IpiVector, datum: usize) {
        self.cpus.get(target).post_ipi(ipi.vector(), datum);
    }

    /// Deliver every pending IPI on `cpu`.
    pub fn service_pending(&self, cpu: CpuId) {
        while let Some((vector, datum)) = self.cpus.get(cpu).take_pending_ipi() {
            self.dispatch(cpu, vector, datum);
        }
    }

    /// TLB shootdown: post a flush request and an invalidate IPI to every
    /// CPU in `targets` except the initiator, then wait for all of them to
    /// acknowledge.
    ///
    /// The wait loop services the targets' pending interrupts itself; that
    /// models the targets taking the IPI concurrently while the initiator
    /// spins on the barrier.
    pub fn tlb_shootdown(&self, initiator: CpuId, targets: CpuSet, addr: Option<VAddr>) {
        let eligible: Vec<CpuId> = targets
            .iter()
            .filter(|&target| target != initiator && target.as_usize() < self.cpus.nr_cpus())
            .collect();
        if eligible.is_empty() {
            return;
        }

        let barrier = TlbBarrier::new(eligible.len());

        for &target in &eligible {
            let cpu = self.cpus.get(target);
            cpu.tlb_requests.lock().push(TlbRequest {
                addr,
                barrier: barrier.clone(),
            });

            let ipi = match addr {
                Some(_) => IpiVector::InvalidatePage,
                None => IpiVector::InvalidateTlb,
            };
            self.send_ipi(target, ipi, 0);
        }

        while !barrier.is_done() {
            for &target in &eligible {
                self.service_pending(target);
            }
        }
    }

    /// The invalidate IPI handlers drain this on the target CPU.
    pub fn handle_tlb_invalidate(&self, cpu_id: CpuId) {
        let cpu = self.cpus.get(cpu_id);

        let requests = core::mem::take(&mut *cpu.tlb_requests.lock());
        for request in requests {
            match request.addr {
                Some(addr) => cpu.flush_tlb_page(addr),
                None => cpu.flush_tlb(),
            }
            request.barrier.arrive();
        }
    }

    pub fn eoi_counts(&self) -> (u64, u64) {
        let pic = self.pic.lock();
        (pic.master_eoi, pic.slave_eoi)
    }

    pub fn spurious_count(&self) -> u64 {
        self.pic.lock().spurious
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn table_for(nr_cpus: usize) -> (Arc<PerCpu<Cpu>>, Arc<InterruptTable>) {
        let cpus = Arc::new(PerCpu::new(nr_cpus, Cpu::new));
        let table = Arc::new(InterruptTable::new(cpus.clone()));
        (cpus, table)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);
        static FIRST_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
        static SECOND_AT: AtomicUsize = AtomicUsize::new(usize::MAX);

        let (_cpus, table) = table_for(1);

        table
            .register_handler(33, "first", Box::new(|_| {
                FIRST_AT.store(ORDER.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
            }))
            .unwrap();
        table
            .register_handler(33, "second", Box::new(|_| {
                SECOND_AT.store(ORDER.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
            }))
            .unwrap();

        table.dispatch(CpuId::from_val(0), 33, 0);

        assert!(FIRST_AT.load(Ordering::Relaxed) < SECOND_AT.load(Ordering::Relaxed));
    }

    #[test]
    fn registration_past_the_vector_space_is_rejected() {
        let (_cpus, table) = table_for(1);

        let result = table.register_handler(NR_VECTORS, "bad", Box::new(|_| {}));
        assert_eq!(result, Err(KernelError::InvalidArgument));
    }

    #[test]
    fn unregister_removes_a_specific_handler() {
        let (_cpus, table) = table_for(1);

        table.register_handler(34, "keep", Box::new(|_| {})).unwrap();
        table.register_handler(34, "drop", Box::new(|_| {})).unwrap();

        table.unregister_handler(34, "drop").unwrap();
        assert_eq!(table.handler_names(34), alloc::vec!["keep"]);

        assert_eq!(
            table.unregister_handler(34, "drop"),
            Err(KernelError::NoEntry)
        );
    }

    #[test]
    #[should_panic(expected = "invalid opcode")]
    fn empty_exception_chain_panics_with_the_canonical_name() {
        let (_cpus, table) = table_for(1);
        table.dispatch(CpuId::from_val(0), 6, 0);
    }

    #[test]
    fn spurious_irq_is_eoi_only() {
        let (_cpus, table) = table_for(1);

        table.dispatch(CpuId::from_val(0), 35, 0);

        assert_eq!(table.spurious_count(), 1);
        assert_eq!(table.eoi_counts(), (1, 0));
    }

    #[test]
    fn slave_vectors_eoi_both_controllers() {
        let (_cpus, table) = table_for(1);

        table.register_handler(43, "disk", Box::new(|_| {})).unwrap();
        table.dispatch(CpuId::from_val(0), 43, 0);

        assert_eq!(table.eoi_counts(), (1, 1));
    }

    #[test]
    fn deferred_work_waits_for_the_outermost_return() {
        static LOG: Spin<Vec<usize>> = Spin::new(Vec::new());

        fn record(token: usize) {
            LOG.lock().push(token);
        }

        let (cpus, table) = table_for(1);
        let table2 = table.clone();
        let cpus2 = cpus.clone();

        // Handler A defers W1, then a higher-priority vector preempts it
        // and defers W2 before returning.
        table
            .register_handler(33, "nested", Box::new(move |event| {
                table2.defer_work(record, 2);
                table2.dispatch(event.cpu, 44, 0);
                assert_eq!(table2.deferred_len(), 2);
                assert!(cpus2.get(event.cpu).nesting_level() >= 1);
            }))
            .unwrap();

        let table3 = table.clone();
        table
            .register_handler(44, "preempting", Box::new(move |_| {
                table3.defer_work(record, 4);
            }))
            .unwrap();

        LOG.lock().clear();
        table.dispatch(CpuId::from_val(0), 33, 0);

        // FIFO order of deferral, both after the outermost return.
        assert_eq!(*LOG.lock(), alloc::vec![2, 4]);
        assert_eq!(cpus.get(CpuId::from_val(0)).nesting_level(), 0);
    }

    #[test]
    fn masked_vectors_are_not_delivered() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let (_cpus, table) = table_for(1);

        table
            .register_handler(38, "net", Box::new(|_| {
                FIRED.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        table.disable_irq(38).unwrap();
        table.disable_irq(38).unwrap();
        table.dispatch(CpuId::from_val(0), 38, 0);
        assert_eq!(FIRED.load(Ordering::Relaxed), 0);

        // Masking nests; one enable is not enough.
        table.enable_irq(38).unwrap();
        assert_eq!(table.irq_depth(38), 1);
        table.dispatch(CpuId::from_val(0), 38, 0);
        assert_eq!(FIRED.load(Ordering::Relaxed), 0);

        table.enable_irq(38).unwrap();
        table.dispatch(CpuId::from_val(0), 38, 0);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn interrupts_reenabled_inside_irq_chains() {
        static SEEN_ENABLED: AtomicUsize = AtomicUsize::new(0);

        let (cpus, table) = table_for(1);
        let cpus2 = cpus.clone();

        table
            .register_handler(36, "observer", Box::new(move |event| {
                if cpus2.get(event.cpu).irqs_enabled() {
                    SEEN_ENABLED.fetch_add(1, Ordering::Relaxed);
                }
            }))
            .unwrap();

        table.dispatch(CpuId::from_val(0), 36, 0);

        assert_eq!(SEEN_ENABLED.load(Ordering::Relaxed), 1);
        assert!(cpus.get(CpuId::from_val(0)).irqs_enabled());
    }

    #[test]
    fn shootdown_waits_for_every_target() {
        let (cpus, table) = table_for(3);

        let table2 = table.clone();
        table
            .register_handler(
                IpiVector::InvalidatePage.vector() as usize,
                "invlpg",
                Box::new(move |event| table2.handle_tlb_invalidate(event.cpu)),
            )
            .unwrap();

        let before: Vec<_> = cpus.iter().map(|(_, cpu)| cpu.tlb_flush_count()).collect();

        table.tlb_shootdown(
            CpuId::from_val(0),
            CpuSet::all(3),
            Some(VAddr::from(0x1000)),
        );

        let after: Vec<_> = cpus.iter().map(|(_, cpu)| cpu.tlb_flush_count()).collect();
        assert_eq!(after[0], before[0]);
        assert_eq!(after[1], before[1] + 1);
        assert_eq!(after[2], before[2] + 1);
    }
}
