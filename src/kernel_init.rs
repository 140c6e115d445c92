use alloc::sync::{Arc, Weak};

use zenith_mm::address::{PRange, VAddr};
use zenith_mm::paging::{FrameTable, PFN};
use zenith_percpu::{CpuId, PerCpu};
use zenith_sync::Spin;

use crate::kernel::constants::KernelConfig;
use crate::kernel::cpu::Cpu;
use crate::kernel::interrupt::{InterruptTable, IpiVector, TIMER_VECTOR};
use crate::kernel::mem::allocator::Kmalloc;
use crate::kernel::mem::memory_map::MemoryMap;
use crate::kernel::mem::mm_list::PageFaultError;
use crate::kernel::mem::page_alloc::PageAllocator;
use crate::kernel::mem::swap::SwapSubsystem;
use crate::kernel::mem::{MmList, VmContext};
use crate::kernel::task::Scheduler;
use crate::kernel::timer::Timer;
use crate::prelude::*;

/// Everything the boot protocol hands the core.
pub struct BootInfo {
    pub memory_map: MemoryMap,
    /// Link-time extent of the kernel image, reserved before the buddy
    /// lists are built.
    pub kernel_image: Option<PRange>,
    pub nr_cpus: usize,
    /// NUMA topology; `None` is one node spanning everything.
    pub node_ranges: Option<Vec<(PFN, PFN)>>,
}

/// The assembled core. Every subsystem is reachable from here; the booted
/// instance additionally sits behind [`kernel()`].
pub struct Kernel {
    pub config: Arc<KernelConfig>,
    pub frames: Arc<FrameTable>,
    pub pmm: Arc<PageAllocator>,
    pub kmalloc: Arc<Kmalloc>,
    pub cpus: Arc<PerCpu<Cpu>>,
    pub irq: Arc<InterruptTable>,
    pub timer: Arc<Timer>,
    pub sched: Arc<Scheduler>,
    pub swap: Arc<SwapSubsystem>,
    pub vm: Arc<VmContext>,
}

static KERNEL: Spin<Option<Arc<Kernel>>> = Spin::new(None);

/// Bring the core up exactly once and publish it.
pub fn boot(info: BootInfo) -> Arc<Kernel> {
    let mut slot = KERNEL.lock();
    assert!(slot.is_none(), "the kernel boots once");

    let kernel = Kernel::new(info);
    *slot = Some(kernel.clone());
    kernel
}

/// The booted kernel. Panics before `boot` completes: every consumer runs
/// after bring-up by construction.
pub fn kernel() -> Arc<Kernel> {
    KERNEL
        .lock()
        .clone()
        .expect("kernel() called before boot()")
}

pub fn try_kernel() -> Option<Arc<Kernel>> {
    KERNEL.lock().clone()
}

impl Kernel {
    /// Assemble the core in dependency order: frame table, PMM, slab,
    /// CPUs, interrupts, timer, scheduler, swap, VMM; then wire the
    /// standard vectors.
    pub fn new(info: BootInfo) -> Arc<Self> {
        let config = Arc::new(KernelConfig::new());

        let (base, end) = info.memory_map.span().expect("the memory map is empty");
        let frames = Arc::new(FrameTable::new(base, end - base));

        let pmm = Arc::new(PageAllocator::new(
            frames.clone(),
            &info.memory_map,
            info.kernel_image,
            info.node_ranges,
        ));
        let kmalloc = Arc::new(Kmalloc::new(pmm.clone()));

        let cpus = Arc::new(PerCpu::new(info.nr_cpus, Cpu::new));
        let irq = Arc::new(InterruptTable::new(cpus.clone()));
        let timer = Arc::new(Timer::new());

        let sched = Scheduler::new(
            cpus.clone(),
            irq.clone(),
            pmm.clone(),
            timer.clone(),
            config.clone(),
        );
        sched.attach_irq();

        let swap = Arc::new(SwapSubsystem::new(
            frames.clone(),
            pmm.clone(),
            kmalloc.clone(),
            timer.clone(),
            config.clone(),
        ));

        let vm = VmContext::new(
            frames.clone(),
            pmm.clone(),
            kmalloc.clone(),
            irq.clone(),
            cpus.clone(),
            timer.clone(),
            swap.clone(),
        );

        let kernel = Arc::new(Self {
            config,
            frames,
            pmm,
            kmalloc,
            cpus,
            irq,
            timer,
            sched,
            swap,
            vm,
        });

        kernel.install_handlers();

        println_info!(
            "kernel: {} CPUs, {} pages ({} reserved), {} NUMA nodes",
            kernel.cpus.nr_cpus(),
            kernel.pmm.total_pages(),
            kernel.pmm.reserved_pages(),
            kernel.pmm.node_count(),
        );

        kernel
    }

    fn install_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);

        // Timer: the BSP advances the clock, every CPU charges its
        // current task.
        let kernel = weak.clone();
        self.irq
            .register_handler(
                TIMER_VECTOR as usize,
                "timer",
                Box::new(move |event| {
                    let Some(kernel) = kernel.upgrade() else { return };
                    if event.cpu.as_usize() == 0 {
                        kernel.timer.tick();
                    }
                    kernel.sched.tick(event.cpu);
                    kernel.swap.monitor_tick(kernel.timer.now_ms());
                }),
            )
            .expect("the timer vector is in range");

        // The page-fault exception: datum is the faulting address with the
        // error-code bits folded into the page offset.
        let kernel = weak.clone();
        self.irq
            .register_handler(
                14,
                "page-fault",
                Box::new(move |event| {
                    let Some(kernel) = kernel.upgrade() else { return };
                    kernel.handle_page_fault_vector(event.cpu, event.datum);
                }),
            )
            .expect("the page-fault vector is in range");

        // TLB shootdown receivers.
        let irq = self.irq.clone();
        self.irq
            .register_handler(
                IpiVector::InvalidateTlb.vector() as usize,
                "tlb-flush-all",
                Box::new(move |event| irq.handle_tlb_invalidate(event.cpu)),
            )
            .expect("the IPI vector is in range");
        let irq = self.irq.clone();
        self.irq
            .register_handler(
                IpiVector::InvalidatePage.vector() as usize,
                "tlb-flush-page",
                Box::new(move |event| irq.handle_tlb_invalidate(event.cpu)),
            )
            .expect("the IPI vector is in range");

        // Cross-CPU function calls.
        let cpus = self.cpus.clone();
        self.irq
            .register_handler(
                IpiVector::CallFunction.vector() as usize,
                "call-function",
                Box::new(move |event| {
                    let cpu = cpus.get(event.cpu);
                    while let Some((func, data)) = cpu.call_queue.lock().pop_front() {
                        func(data);
                    }
                }),
            )
            .expect("the IPI vector is in range");

        // Stop: the CPU parks itself.
        let cpus = self.cpus.clone();
        self.irq
            .register_handler(
                IpiVector::Stop.vector() as usize,
                "stop",
                Box::new(move |event| cpus.get(event.cpu).set_offline()),
            )
            .expect("the IPI vector is in range");
    }

    /// The fault entry the exception vector feeds: resolve through the
    /// current task's mm. User-mode violations go to the signal machinery;
    /// kernel-mode ones are fatal.
    fn handle_page_fault_vector(&self, cpu: CpuId, datum: usize) {
        let addr = VAddr::from(datum & !0xfff);
        let error = PageFaultError::from_bits_truncate((datum & 0xfff) as u32);

        let mm = self
            .sched
            .current_on(cpu)
            .and_then(|task| task.mm());

        let result = match &mm {
            Some(mm) => mm.handle_fault(addr, error),
            None => Err(KernelError::SegmentationViolation),
        };

        match result {
            Ok(()) => {}
            Err(err) if error.contains(PageFaultError::USER) => {
                // Hand off to the signal machinery (external collaborator).
                if let Some(task) = self.sched.current_on(cpu) {
                    println_warn!(
                        "fault at {:?} in task {} ({}): {}",
                        addr,
                        task.tid(),
                        task.name(),
                        err
                    );
                    self.sched.signal(&task);
                }
            }
            Err(err) => {
                panic!(
                    "kernel-mode page fault at {:?} on {:?}: {}",
                    addr, cpu, err
                );
            }
        }
    }

    /// Deliver the fault `error` at `addr` through the exception vector,
    /// the way the MMU would.
    pub fn raise_page_fault(&self, cpu: CpuId, addr: VAddr, error: PageFaultError) {
        let datum = (usize::from(addr) & !0xfff) | (error.bits() as usize & 0xfff);
        self.irq.dispatch(cpu, 14, datum);
    }

    /// One hardware timer interrupt on `cpu`.
    pub fn tick(&self, cpu: CpuId) {
        self.irq.dispatch(cpu, TIMER_VECTOR, 0);
    }

    pub fn create_mm(&self) -> Arc<MmList> {
        self.vm.create_mm()
    }

    /// Run `func(data)` on `target` the next time it takes interrupts.
    pub fn smp_call_function(&self, target: CpuId, func: fn(usize), data: usize) {
        self.cpus.get(target).call_queue.lock().push_back((func, data));
        self.irq.send_ipi(target, IpiVector::CallFunction, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mem::swap::MemSwapStore;
    use crate::kernel::mem::Permission;
    use crate::kernel::task::TaskFlags;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use zenith_mm::paging::PAGE_SIZE;

    fn fresh_kernel(nr_cpus: usize) -> Arc<Kernel> {
        Kernel::new(BootInfo {
            memory_map: MemoryMap::flat(1024),
            kernel_image: None,
            nr_cpus,
            node_ranges: None,
        })
    }

    #[test]
    fn boot_publishes_the_global_once() {
        let booted = boot(BootInfo {
            memory_map: MemoryMap::flat(256),
            kernel_image: None,
            nr_cpus: 2,
            node_ranges: None,
        });

        assert!(Arc::ptr_eq(&booted, &kernel()));
        assert!(try_kernel().is_some());
    }

    #[test]
    fn fault_through_the_vector_resolves_anonymous_pages() {
        let kernel = fresh_kernel(1);
        let cpu0 = CpuId::from_val(0);

        let task = kernel
            .sched
            .create_task("init", || {}, TaskFlags::empty())
            .unwrap();
        let mm = kernel.create_mm();
        task.set_mm(mm.clone());
        mm.get_user();
        kernel.sched.add_task(&task);
        kernel.sched.schedule(cpu0);

        let at = mm
            .mmap(
                VAddr::from(0x40000000),
                4 * PAGE_SIZE,
                crate::kernel::mem::Mapping::Anonymous,
                Permission::rw(),
                false,
                true,
            )
            .unwrap();

        assert!(mm.get_page(at).is_none());
        kernel.raise_page_fault(cpu0, at, PageFaultError::USER | PageFaultError::WRITE);
        assert!(mm.get_page(at).is_some());
        assert_eq!(mm.total_pages(), 1);
    }

    #[test]
    fn user_segv_goes_to_the_signal_path() {
        let kernel = fresh_kernel(1);
        let cpu0 = CpuId::from_val(0);

        let task = kernel
            .sched
            .create_task("bad", || {}, TaskFlags::empty())
            .unwrap();
        let mm = kernel.create_mm();
        task.set_mm(mm.clone());
        mm.get_user();
        kernel.sched.add_task(&task);
        kernel.sched.schedule(cpu0);

        // No VMA at this address: user mode survives with a signal.
        kernel.raise_page_fault(
            cpu0,
            VAddr::from(0x7000_0000),
            PageFaultError::USER,
        );
        assert!(task.signal_pending());
    }

    #[test]
    #[should_panic(expected = "kernel-mode page fault")]
    fn kernel_segv_is_fatal() {
        let kernel = fresh_kernel(1);
        let cpu0 = CpuId::from_val(0);

        kernel.raise_page_fault(
            cpu0,
            VAddr::from(0x7000_0000),
            PageFaultError::empty(),
        );
    }

    #[test]
    fn ticks_flow_from_the_timer_vector() {
        let kernel = fresh_kernel(2);

        kernel.tick(CpuId::from_val(0));
        kernel.tick(CpuId::from_val(1));
        // Only the BSP advances the clock.
        assert_eq!(kernel.timer.now_ms(), 1);
    }

    #[test]
    fn call_function_runs_on_the_target() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn bump(by: usize) {
            CALLS.fetch_add(by, Ordering::Relaxed);
        }

        let kernel = fresh_kernel(2);
        let cpu1 = CpuId::from_val(1);

        kernel.smp_call_function(cpu1, bump, 3);
        assert_eq!(CALLS.load(Ordering::Relaxed), 0);

        kernel.irq.service_pending(cpu1);
        assert_eq!(CALLS.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn swap_is_reachable_end_to_end_after_boot() {
        let kernel = fresh_kernel(1);

        kernel
            .swap
            .add_area(
                String::from("ramswap0"),
                Arc::new(MemSwapStore::new(64)),
            )
            .unwrap();

        let mm = kernel.create_mm();
        let at = mm
            .mmap(
                VAddr::from(0x50000000),
                PAGE_SIZE,
                crate::kernel::mem::Mapping::Anonymous,
                Permission::rw(),
                false,
                true,
            )
            .unwrap();

        mm.write_user(at, b"resident data").unwrap();

        // Let the page age past the access-time watermark first.
        kernel.timer.advance(60_000);
        kernel.swap.swap_out(&mm, at).unwrap();
        assert!(mm.get_page(at).is_none());

        let mut back = [0u8; 13];
        mm.read_user(at, &mut back).unwrap();
        assert_eq!(&back, b"resident data");
    }
}
