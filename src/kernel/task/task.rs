use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::sync::{Arc, Weak};

use bitflags::bitflags;
use zenith_percpu::CpuId;
use zenith_sync::Spin;

use crate::kernel::cpu::CpuSet;
use crate::kernel::mem::{MmList, Page};
use crate::prelude::*;

pub type Tid = u32;

pub const DEFAULT_PRIORITY: u32 = 120;
pub const IDLE_PRIORITY: u32 = 139;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Ready,
    Blocked,
    Sleeping,
    Zombie,
    Dead,
}

/// Scheduling classes, with their wire constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SchedPolicy {
    Normal = 0,
    Fifo = 1,
    Rr = 2,
    Batch = 3,
    Idle = 4,
    /// Reserved; `set_policy` refuses it.
    Deadline = 5,
}

impl SchedPolicy {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SchedPolicy::Normal),
            1 => Some(SchedPolicy::Fifo),
            2 => Some(SchedPolicy::Rr),
            3 => Some(SchedPolicy::Batch),
            4 => Some(SchedPolicy::Idle),
            5 => Some(SchedPolicy::Deadline),
            _ => None,
        }
    }

    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::Rr)
    }

    /// Only the timesharing classes rotate through the expired array.
    pub fn uses_expired_array(self) -> bool {
        matches!(self, SchedPolicy::Normal | SchedPolicy::Batch)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        const KTHREAD = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const KERNEL: Self = Self { uid: 0, gid: 0 };
}

/// The saved register file: callee-saved registers, stack and instruction
/// pointers. Loaded on switch-in, stored on switch-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskContext {
    pub ip: usize,
    pub sp: usize,
    pub callee_saved: [usize; 6],
}

/// Scheduling attributes, mutated together under one lock.
#[derive(Debug, Clone, Copy)]
pub struct SchedAttrs {
    pub policy: SchedPolicy,
    pub static_priority: u32,
    pub dynamic_priority: u32,
    pub time_slice_ms: u64,
    /// Set when the slice ran out; the next requeue goes to the expired
    /// array (timesharing classes only).
    pub slice_expired: bool,
}

/// One thread of execution.
pub struct Task {
    tid: Tid,
    tgid: Tid,
    ppid: AtomicU32,
    name: String,
    pub entry: fn(),
    pub flags: TaskFlags,
    pub creds: Credentials,
    pub state: Spin<TaskState>,
    pub attrs: Spin<SchedAttrs>,
    affinity: AtomicU64,
    /// Whether the task sits on some run queue's arrays right now.
    pub on_rq: AtomicBool,
    cpu: AtomicUsize,
    pub context: Spin<TaskContext>,
    pub(crate) mm: Spin<Option<Arc<MmList>>>,
    pub(crate) kstack: Spin<Option<Page>>,
    pub(crate) parent: Spin<Weak<Task>>,
    pub(crate) children: Spin<Vec<Arc<Task>>>,
    pub(crate) sleep_deadline: AtomicU64,
    signal_pending: AtomicBool,
    /// Times this task has been switched in.
    pub switches: AtomicU64,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tid: Tid,
        tgid: Tid,
        ppid: Tid,
        name: String,
        entry: fn(),
        flags: TaskFlags,
        attrs: SchedAttrs,
        affinity: CpuSet,
        kstack: Page,
    ) -> Self {
        let stack_top =
            (usize::from(kstack.pfn()) << zenith_mm::paging::PAGE_SIZE_BITS)
                + (kstack.page_count() << zenith_mm::paging::PAGE_SIZE_BITS);

        Self {
            tid,
            tgid,
            ppid: AtomicU32::new(ppid),
            name,
            entry,
            flags,
            creds: Credentials::KERNEL,
            state: Spin::new(TaskState::Blocked),
            attrs: Spin::new(attrs),
            affinity: AtomicU64::new(affinity.bits()),
            on_rq: AtomicBool::new(false),
            cpu: AtomicUsize::new(0),
            context: Spin::new(TaskContext {
                ip: entry as usize,
                sp: stack_top,
                callee_saved: [0; 6],
            }),
            mm: Spin::new(None),
            kstack: Spin::new(Some(kstack)),
            parent: Spin::new(Weak::new()),
            children: Spin::new(Vec::new()),
            sleep_deadline: AtomicU64::new(0),
            signal_pending: AtomicBool::new(false),
            switches: AtomicU64::new(0),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn tgid(&self) -> Tid {
        self.tgid
    }

    pub fn ppid(&self) -> Tid {
        self.ppid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ppid(&self, ppid: Tid) {
        self.ppid.store(ppid, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn policy(&self) -> SchedPolicy {
        self.attrs.lock().policy
    }

    /// The priority pick-next uses; lower is better.
    pub fn priority(&self) -> u32 {
        self.attrs.lock().dynamic_priority
    }

    pub fn affinity(&self) -> CpuSet {
        CpuSet::from_bits(self.affinity.load(Ordering::Relaxed))
    }

    pub fn set_affinity(&self, set: CpuSet) -> KResult<()> {
        if set.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        self.affinity.store(set.bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn cpu(&self) -> CpuId {
        CpuId::from_val(self.cpu.load(Ordering::Relaxed))
    }

    pub(crate) fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu.as_usize(), Ordering::Relaxed);
    }

    pub fn mm(&self) -> Option<Arc<MmList>> {
        self.mm.lock().clone()
    }

    /// Attach an address space; threads of a group share one through its
    /// user count.
    pub fn set_mm(&self, mm: Arc<MmList>) {
        let old = self.mm.lock().replace(mm);
        if let Some(old) = old {
            old.put_user();
        }
    }

    pub fn signal_pending(&self) -> bool {
        self.signal_pending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_signal_pending(&self, pending: bool) {
        self.signal_pending.store(pending, Ordering::Relaxed);
    }
}
