use core::cmp::Reverse;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::collections::{binary_heap::BinaryHeap, btree_map::BTreeMap};
use alloc::sync::{Arc, Weak};

use itertools::{Itertools, MinMaxResult};
use zenith_mm::paging::AllocFlags;
use zenith_percpu::{CpuId, PerCpu};
use zenith_sync::Spin;

use super::readyqueue::{RunQueue, NR_PRIORITIES, RT_PRIORITY_LIMIT};
use super::task::{
    SchedAttrs, SchedPolicy, Task, TaskFlags, TaskState, Tid, DEFAULT_PRIORITY, IDLE_PRIORITY,
};
use crate::kernel::constants::KernelConfig;
use crate::kernel::cpu::{Cpu, CpuSet, SpinIrq as _};
use crate::kernel::interrupt::{InterruptTable, IpiVector};
use crate::kernel::mem::{Page, PageAllocator};
use crate::kernel::timer::Timer;
use crate::prelude::*;

/// Kernel stacks are four pages.
pub const KERNEL_STACK_ORDER: u32 = 2;

struct Sleeper {
    deadline_ms: u64,
    task: Weak<Task>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms
    }
}
impl Eq for Sleeper {}
impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.deadline_ms.cmp(&other.deadline_ms)
    }
}

/// The O(1) scheduler: per-CPU run queues with their own locks, a task
/// table keyed by tid, the timer wheel, and the load balancer.
///
/// Lock order is always run queue first, then a task's `state`/`attrs`;
/// run-queue pairs are taken in CPU-id order.
pub struct Scheduler {
    cpus: Arc<PerCpu<Cpu>>,
    irq: Arc<InterruptTable>,
    pmm: Arc<PageAllocator>,
    timer: Arc<Timer>,
    config: Arc<KernelConfig>,
    rqs: PerCpu<Spin<RunQueue>>,
    tasks: Spin<BTreeMap<Tid, Arc<Task>>>,
    next_tid: AtomicU32,
    sleepers: Spin<BinaryHeap<Reverse<Sleeper>>>,
    last_balance_ms: AtomicU64,
}

impl Scheduler {
    pub fn new(
        cpus: Arc<PerCpu<Cpu>>,
        irq: Arc<InterruptTable>,
        pmm: Arc<PageAllocator>,
        timer: Arc<Timer>,
        config: Arc<KernelConfig>,
    ) -> Arc<Self> {
        let nr_cpus = cpus.nr_cpus();

        let scheduler = Arc::new(Self {
            cpus,
            irq,
            pmm,
            timer,
            config,
            rqs: PerCpu::new(nr_cpus, |cpu| Spin::new(RunQueue::new(cpu))),
            tasks: Spin::new(BTreeMap::new()),
            next_tid: AtomicU32::new(1),
            sleepers: Spin::new(BinaryHeap::new()),
            last_balance_ms: AtomicU64::new(0),
        });

        for cpu in scheduler.rqs.cpu_ids() {
            let idle = scheduler
                .spawn_idle(cpu)
                .expect("no memory for the idle tasks at bring-up");
            scheduler.rqs.get(cpu).lock().idle = Some(idle);
        }

        scheduler
    }

    /// Wire the scheduler into interrupt dispatch: the reschedule IPI and
    /// the switch-on-interrupt-return hook.
    pub fn attach_irq(self: &Arc<Self>) {
        let cpus = self.cpus.clone();
        self.irq
            .register_handler(
                IpiVector::Reschedule.vector() as usize,
                "resched-ipi",
                Box::new(move |event| {
                    cpus.get(event.cpu).need_resched.store(true, Ordering::Relaxed);
                }),
            )
            .expect("the reschedule vector is in range");

        let scheduler = self.clone();
        self.irq
            .set_resched_hook(Box::new(move |cpu| scheduler.preempt(cpu)));
    }

    fn alloc_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_idle(&self, cpu: CpuId) -> KResult<Arc<Task>> {
        fn idle_entry() {}

        let kstack = Page::alloc_order_in(&self.pmm, KERNEL_STACK_ORDER, AllocFlags::ZERO)
            .ok_or(KernelError::NoMemory)?;
        let tid = self.alloc_tid();

        let idle = Arc::new(Task::new(
            tid,
            tid,
            0,
            alloc::format!("idle/{}", cpu.as_usize()),
            idle_entry,
            TaskFlags::KTHREAD,
            SchedAttrs {
                policy: SchedPolicy::Idle,
                static_priority: IDLE_PRIORITY,
                dynamic_priority: IDLE_PRIORITY,
                time_slice_ms: self.config.normal_time_slice_ms(),
                slice_expired: false,
            },
            CpuSet::single(cpu),
            kstack,
        ));

        // The idle task never sits on a run queue; it is the pick of last
        // resort.
        self.tasks.lock().insert(tid, idle.clone());
        Ok(idle)
    }

    pub fn create_task(
        &self,
        name: &str,
        entry: fn(),
        flags: TaskFlags,
    ) -> KResult<Arc<Task>> {
        let kstack = Page::alloc_order_in(&self.pmm, KERNEL_STACK_ORDER, AllocFlags::ZERO)
            .ok_or(KernelError::NoMemory)?;
        let tid = self.alloc_tid();

        let task = Arc::new(Task::new(
            tid,
            tid,
            0,
            String::from(name),
            entry,
            flags,
            SchedAttrs {
                policy: SchedPolicy::Normal,
                static_priority: DEFAULT_PRIORITY,
                dynamic_priority: DEFAULT_PRIORITY,
                time_slice_ms: self.config.normal_time_slice_ms(),
                slice_expired: false,
            },
            CpuSet::all(self.cpus.nr_cpus()),
            kstack,
        ));

        self.tasks.lock().insert(tid, task.clone());
        Ok(task)
    }

    pub fn lookup(&self, tid: Tid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&tid).cloned()
    }

    pub fn adopt(&self, parent: &Arc<Task>, child: &Arc<Task>) {
        *child.parent.lock() = Arc::downgrade(parent);
        child.set_ppid(parent.tid());
        parent.children.lock().push(child.clone());
    }

    /// Make a fresh task runnable on the best CPU its affinity allows: the
    /// least loaded one.
    pub fn add_task(&self, task: &Arc<Task>) {
        let affinity = task.affinity();
        let target = self
            .rqs
            .cpu_ids()
            .filter(|&cpu| affinity.contains(cpu))
            .min_by_key(|&cpu| self.rqs.get(cpu).lock().nr_running())
            .expect("the affinity mask intersects no online CPU");

        let mut rq = self.rqs.get(target).lock();
        {
            let mut state = task.state.lock();
            assert_eq!(
                *state,
                TaskState::Blocked,
                "adding a task that is already scheduled"
            );
            *state = TaskState::Ready;
        }
        rq.enqueue(task.clone(), false);
        drop(rq);

        self.preempt_check(target, task.priority());
    }

    /// Pull a task out of the scheduler. The running task cannot be
    /// removed from under itself.
    pub fn remove_task(&self, task: &Arc<Task>) -> KResult<()> {
        if task.state() == TaskState::Running {
            return Err(KernelError::Busy);
        }

        let mut rq = self.rqs.get(task.cpu()).lock();
        if rq.dequeue(task) {
            *task.state.lock() = TaskState::Blocked;
        }
        Ok(())
    }

    /// Idempotent: waking a runnable task is a no-op. A sleeper is pulled
    /// off the timer wheel lazily.
    pub fn wake(&self, task: &Arc<Task>) {
        {
            let state = task.state.lock();
            match *state {
                TaskState::Sleeping | TaskState::Blocked => {}
                _ => return,
            }
        }

        task.sleep_deadline.store(0, Ordering::Relaxed);

        let target = self.choose_cpu(task);
        let mut rq = self.rqs.get(target).lock();
        {
            let mut state = task.state.lock();
            match *state {
                TaskState::Sleeping | TaskState::Blocked => *state = TaskState::Ready,
                _ => return,
            }
        }
        rq.enqueue(task.clone(), false);
        drop(rq);

        self.preempt_check(target, task.priority());
    }

    /// A signal to a blocked task makes it runnable (interruptible sleep).
    pub fn signal(&self, task: &Arc<Task>) {
        task.set_signal_pending(true);
        self.wake(task);
    }

    /// Wake-up targeting: an idle CPU first, else the CPU running the
    /// worst-priority task that the new one would preempt, else the least
    /// loaded.
    fn choose_cpu(&self, task: &Arc<Task>) -> CpuId {
        let affinity = task.affinity();
        let priority = task.priority();

        let mut idle_cpu = None;
        let mut worst: Option<(CpuId, u32)> = None;
        let mut least: Option<(CpuId, usize)> = None;

        for cpu in self.rqs.cpu_ids() {
            if !affinity.contains(cpu) {
                continue;
            }

            let rq = self.rqs.get(cpu).lock();
            let is_idle = match (&rq.current, &rq.idle) {
                (None, _) => true,
                (Some(current), Some(idle)) => Arc::ptr_eq(current, idle),
                _ => false,
            };
            let current_priority = rq.current_priority();
            let nr_running = rq.nr_running();
            drop(rq);

            if is_idle && idle_cpu.is_none() {
                idle_cpu = Some(cpu);
            }
            if let Some(current_priority) = current_priority {
                if current_priority > priority
                    && worst.is_none_or(|(_, prio)| current_priority > prio)
                {
                    worst = Some((cpu, current_priority));
                }
            }
            if least.is_none_or(|(_, nr)| nr_running < nr) {
                least = Some((cpu, nr_running));
            }
        }

        idle_cpu
            .or(worst.map(|(cpu, _)| cpu))
            .or(least.map(|(cpu, _)| cpu))
            .expect("the affinity mask intersects no online CPU")
    }

    /// Post a reschedule to `target` when the task at `priority` beats
    /// whatever runs there. Equal priority never preempts.
    fn preempt_check(&self, target: CpuId, priority: u32) {
        let rq = self.rqs.get(target).lock();
        let preempts = match rq.current_priority() {
            None => rq.nr_running() > 0,
            Some(current) => current > priority,
        };
        drop(rq);

        if preempts {
            self.cpus
                .get(target)
                .need_resched
                .store(true, Ordering::Relaxed);
            self.irq.send_ipi(target, IpiVector::Reschedule, 0);
        }
    }

    pub fn set_priority(&self, task: &Arc<Task>, priority: u32) -> KResult<()> {
        let policy = task.policy();
        Self::validate_priority(policy, priority)?;

        let mut rq = self.rqs.get(task.cpu()).lock();
        let was_queued = rq.dequeue(task);

        {
            let mut attrs = task.attrs.lock();
            attrs.static_priority = priority;
            attrs.dynamic_priority = priority;
        }

        if was_queued {
            *task.state.lock() = TaskState::Ready;
            rq.enqueue(task.clone(), false);
        }
        drop(rq);

        if was_queued {
            self.preempt_check(task.cpu(), priority);
        }
        Ok(())
    }

    pub fn set_policy(&self, task: &Arc<Task>, policy: SchedPolicy, priority: u32) -> KResult<()> {
        if policy == SchedPolicy::Deadline {
            // Reserved, not implemented in the core.
            return Err(KernelError::NotSupported);
        }
        Self::validate_priority(policy, priority)?;

        let mut rq = self.rqs.get(task.cpu()).lock();
        let was_queued = rq.dequeue(task);

        {
            let mut attrs = task.attrs.lock();
            attrs.policy = policy;
            attrs.static_priority = priority;
            attrs.dynamic_priority = priority;
            attrs.time_slice_ms = match policy {
                SchedPolicy::Rr => self.config.rr_time_slice_ms(),
                _ => self.config.normal_time_slice_ms(),
            };
            attrs.slice_expired = false;
        }

        if was_queued {
            rq.enqueue(task.clone(), false);
        }
        Ok(())
    }

    fn validate_priority(policy: SchedPolicy, priority: u32) -> KResult<()> {
        let valid = match policy {
            SchedPolicy::Fifo | SchedPolicy::Rr => priority < RT_PRIORITY_LIMIT,
            SchedPolicy::Idle => priority == IDLE_PRIORITY,
            _ => (RT_PRIORITY_LIMIT..NR_PRIORITIES as u32).contains(&priority),
        };

        valid.then_some(()).ok_or(KernelError::InvalidArgument)
    }

    pub fn current_on(&self, cpu: CpuId) -> Option<Arc<Task>> {
        self.rqs.get(cpu).lock().current.clone()
    }

    pub fn nr_running_on(&self, cpu: CpuId) -> usize {
        self.rqs.get(cpu).lock().nr_running()
    }

    pub fn with_rq<R>(&self, cpu: CpuId, func: impl FnOnce(&RunQueue) -> R) -> R {
        func(&self.rqs.get(cpu).lock())
    }

    /// Pick next and switch to it. Runs only outside interrupt context
    /// with preemption enabled; the run-queue lock is the one lock held
    /// across the switch.
    pub fn schedule(&self, cpu: CpuId) {
        let cpu_state = self.cpus.get(cpu);
        assert_eq!(cpu_state.nesting_level(), 0, "schedule() inside an interrupt");
        zenith_preempt::assert_preempt_enabled!(cpu_state.preempt);

        cpu_state.need_resched.store(false, Ordering::Relaxed);

        // The run-queue lock is IRQ-safe: it is handed across the switch
        // and a timer tick taking it mid-switch would deadlock.
        let mut rq = self.rqs.get(cpu).lock_irq(cpu_state);

        let prev = rq.current.take();
        if let Some(prev) = &prev {
            let is_idle_task = rq
                .idle
                .as_ref()
                .is_some_and(|idle| Arc::ptr_eq(idle, prev));

            let mut state = prev.state.lock();
            match *state {
                TaskState::Running if is_idle_task => {
                    // The idle task never queues; it waits as the pick of
                    // last resort.
                    *state = TaskState::Blocked;
                }
                TaskState::Running => {
                    *state = TaskState::Ready;
                    drop(state);

                    let into_expired = {
                        let mut attrs = prev.attrs.lock();
                        let expired = attrs.slice_expired && attrs.policy.uses_expired_array();
                        attrs.slice_expired = false;
                        expired
                    };
                    rq.enqueue(prev.clone(), into_expired);
                }
                TaskState::Blocked | TaskState::Sleeping | TaskState::Zombie
                | TaskState::Dead => {}
                TaskState::Ready => unreachable!("the running task cannot be Ready"),
            }
        }

        let next = rq
            .pick_next()
            .or_else(|| rq.idle.clone())
            .expect("every run queue has an idle task");

        *next.state.lock() = TaskState::Running;
        next.set_cpu(cpu);
        next.switches.fetch_add(1, Ordering::Relaxed);

        self.switch_mm(cpu, prev.as_ref(), &next);
        rq.current = Some(next);
    }

    /// Switch page-table roots when the address space changes; kernel
    /// threads borrow the previous root.
    fn switch_mm(&self, cpu: CpuId, prev: Option<&Arc<Task>>, next: &Arc<Task>) {
        let prev_mm = prev.and_then(|task| task.mm());
        let next_mm = next.mm();

        match (&prev_mm, &next_mm) {
            (Some(old), Some(new)) if old.id() == new.id() => {}
            (_, Some(new)) => {
                if let Some(old) = &prev_mm {
                    old.deactivate(cpu);
                }
                new.activate(cpu);
            }
            (_, None) => {
                // Borrowing: the previous root stays loaded.
            }
        }
    }

    pub fn yield_now(&self, cpu: CpuId) {
        self.schedule(cpu);
    }

    /// Block the running task; `wake` makes it runnable again.
    pub fn block_current(&self, cpu: CpuId) {
        let task = self.current_on(cpu).expect("no running task to block");
        *task.state.lock() = TaskState::Blocked;
        self.schedule(cpu);
    }

    /// Put the running task on the timer wheel for `ms` milliseconds.
    pub fn sleep(&self, cpu: CpuId, ms: u64) {
        let task = self.current_on(cpu).expect("no running task to sleep");
        let deadline_ms = self.timer.now_ms() + ms;

        task.sleep_deadline.store(deadline_ms, Ordering::Relaxed);
        *task.state.lock() = TaskState::Sleeping;
        self.sleepers.lock().push(Reverse(Sleeper {
            deadline_ms,
            task: Arc::downgrade(&task),
        }));

        self.schedule(cpu);
    }

    /// The running task exits; its parent reaps the zombie later.
    pub fn exit_current(&self, cpu: CpuId) {
        let task = self.current_on(cpu).expect("no running task to exit");
        *task.state.lock() = TaskState::Zombie;

        if let Some(parent) = task.parent.lock().upgrade() {
            self.wake(&parent);
        }

        self.schedule(cpu);
    }

    /// Release a zombie: its stack, mm reference, and table slot.
    pub fn reap(&self, task: &Arc<Task>) -> KResult<()> {
        {
            let mut state = task.state.lock();
            if *state != TaskState::Zombie {
                return Err(KernelError::Busy);
            }
            *state = TaskState::Dead;
        }

        task.kstack.lock().take();
        if let Some(mm) = task.mm.lock().take() {
            mm.put_user();
        }

        let orphans = core::mem::take(&mut *task.children.lock());
        for orphan in orphans {
            orphan.set_ppid(task.ppid());
            *orphan.parent.lock() = task.parent.lock().clone();
        }

        if let Some(parent) = task.parent.lock().upgrade() {
            parent
                .children
                .lock()
                .retain(|child| !Arc::ptr_eq(child, task));
        }

        self.tasks.lock().remove(&task.tid());
        Ok(())
    }

    /// One timer tick on `cpu`: expire sleepers, charge the running
    /// task's slice, arm the balancer.
    pub fn tick(&self, cpu: CpuId) {
        let now = self.timer.now_ms();
        self.expire_sleepers(now);

        let current = self.rqs.get(cpu).lock().current.clone();
        if let Some(current) = current {
            let expired = {
                let mut attrs = current.attrs.lock();
                match attrs.policy {
                    SchedPolicy::Fifo | SchedPolicy::Idle | SchedPolicy::Deadline => false,
                    SchedPolicy::Rr => {
                        attrs.time_slice_ms = attrs.time_slice_ms.saturating_sub(1);
                        if attrs.time_slice_ms == 0 {
                            // Back to the tail of the same bucket with a
                            // fresh quantum.
                            attrs.time_slice_ms = self.config.rr_time_slice_ms();
                            true
                        } else {
                            false
                        }
                    }
                    SchedPolicy::Normal | SchedPolicy::Batch => {
                        attrs.time_slice_ms = attrs.time_slice_ms.saturating_sub(1);
                        if attrs.time_slice_ms == 0 {
                            attrs.time_slice_ms = self.config.normal_time_slice_ms();
                            attrs.slice_expired = true;
                            true
                        } else {
                            false
                        }
                    }
                }
            };

            if expired {
                self.cpus
                    .get(cpu)
                    .need_resched
                    .store(true, Ordering::Relaxed);
            }
        }

        // The balancer itself runs at interrupt return, nesting zero.
        if now.saturating_sub(self.last_balance_ms.load(Ordering::Relaxed))
            >= self.config.load_balance_interval_ms()
        {
            self.cpus
                .get(cpu)
                .need_resched
                .store(true, Ordering::Relaxed);
        }
    }

    fn expire_sleepers(&self, now: u64) {
        let mut sleepers = self.sleepers.lock();

        while let Some(Reverse(sleeper)) = sleepers.peek() {
            if sleeper.deadline_ms > now {
                break;
            }

            let Reverse(sleeper) = sleepers.pop().unwrap();
            let Some(task) = sleeper.task.upgrade() else {
                continue;
            };
            // Stale entries (woken early, re-armed) are skipped.
            if task.sleep_deadline.load(Ordering::Relaxed) != sleeper.deadline_ms {
                continue;
            }

            drop(sleepers);
            self.wake(&task);
            sleepers = self.sleepers.lock();
        }
    }

    /// Interrupt-return entry, invoked at nesting zero with a reschedule
    /// pending.
    pub fn preempt(&self, cpu: CpuId) {
        let now = self.timer.now_ms();
        if now.saturating_sub(self.last_balance_ms.load(Ordering::Relaxed))
            >= self.config.load_balance_interval_ms()
        {
            self.last_balance_ms.store(now, Ordering::Relaxed);
            self.load_balance();
        }

        self.schedule(cpu);
    }

    /// Even out the busiest and idlest run queues when their imbalance
    /// crosses the threshold. Both locks are taken in CPU-id order.
    pub fn load_balance(&self) {
        let loads: Vec<(CpuId, usize)> = self
            .rqs
            .cpu_ids()
            .map(|cpu| (cpu, self.rqs.get(cpu).lock().nr_running()))
            .collect();

        let (idlest, busiest) = match loads.iter().minmax_by_key(|(_, nr_running)| *nr_running) {
            MinMaxResult::MinMax(idlest, busiest) => (*idlest, *busiest),
            _ => return,
        };

        if busiest.1 == 0 || busiest.0 == idlest.0 {
            return;
        }

        let imbalance_pct = (busiest.1 - idlest.1) * 100 / busiest.1;
        if imbalance_pct <= self.config.load_balance_imbalance_pct() as usize {
            return;
        }

        let to_move = ((busiest.1 - idlest.1) / 2).max(1);

        let (first, second) = if busiest.0 < idlest.0 {
            (busiest.0, idlest.0)
        } else {
            (idlest.0, busiest.0)
        };
        let mut first_rq = self.rqs.get(first).lock();
        let mut second_rq = self.rqs.get(second).lock();
        let (busy_rq, idle_rq) = if busiest.0 < idlest.0 {
            (&mut *first_rq, &mut *second_rq)
        } else {
            (&mut *second_rq, &mut *first_rq)
        };

        let target = idlest.0;
        let mut moved = 0;
        let mut best_moved_priority = u32::MAX;

        for _ in 0..to_move {
            // Prefer non-RT victims to preserve real-time locality.
            let task = busy_rq
                .steal(RT_PRIORITY_LIMIT as usize, NR_PRIORITIES, |task| {
                    task.affinity().contains(target)
                })
                .or_else(|| {
                    busy_rq.steal(0, RT_PRIORITY_LIMIT as usize, |task| {
                        task.affinity().contains(target)
                    })
                });

            let Some(task) = task else { break };
            best_moved_priority = best_moved_priority.min(task.priority());
            idle_rq.enqueue(task, false);
            moved += 1;
        }

        drop(second_rq);
        drop(first_rq);

        if moved > 0 {
            println_debug!(
                "sched: balanced {} tasks from {:?} to {:?}",
                moved,
                busiest.0,
                idlest.0
            );
            self.preempt_check(target, best_moved_priority);
        }
    }

    pub fn cpus(&self) -> &Arc<PerCpu<Cpu>> {
        &self.cpus
    }

    /// Re-check the membership and bitmap properties everywhere.
    pub fn check_invariants(&self) {
        for cpu in self.rqs.cpu_ids() {
            self.rqs.get(cpu).lock().check_invariants();
        }

        let currents: Vec<Option<Arc<Task>>> = self
            .rqs
            .cpu_ids()
            .map(|cpu| self.rqs.get(cpu).lock().current.clone())
            .collect();

        for task in self.tasks.lock().values() {
            match task.state() {
                TaskState::Ready => {
                    assert!(
                        task.on_rq.load(Ordering::Relaxed),
                        "ready task {} is on no run queue",
                        task.tid()
                    );
                }
                TaskState::Running => {
                    assert!(
                        currents
                            .iter()
                            .flatten()
                            .any(|current| Arc::ptr_eq(current, task)),
                        "running task {} is current nowhere",
                        task.tid()
                    );
                }
                _ => {
                    assert!(
                        !task.on_rq.load(Ordering::Relaxed),
                        "blocked task {} sits on a run queue",
                        task.tid()
                    );
                }
            }
        }
    }
}
