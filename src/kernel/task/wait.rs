use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};

use zenith_percpu::CpuId;
use zenith_sync::Spin;

use super::scheduler::Scheduler;
use super::task::Task;
use crate::prelude::*;

/// A list of tasks blocked on some condition. A task is on at most one
/// wait list at a time.
pub struct WaitQueue {
    waiters: Spin<VecDeque<Weak<Task>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Spin::new(VecDeque::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Block the task running on `cpu` until `wake_one`/`wake_all`.
    pub fn sleep_on(&self, sched: &Scheduler, cpu: CpuId) {
        let task = sched.current_on(cpu).expect("no running task to block");
        self.waiters.lock().push_back(Arc::downgrade(&task));
        sched.block_current(cpu);
    }

    pub fn wake_one(&self, sched: &Scheduler) -> bool {
        loop {
            let Some(waiter) = self.waiters.lock().pop_front() else {
                return false;
            };

            if let Some(task) = waiter.upgrade() {
                sched.wake(&task);
                return true;
            }
        }
    }

    pub fn wake_all(&self, sched: &Scheduler) -> usize {
        let mut woken = 0;
        while self.wake_one(sched) {
            woken += 1;
        }
        woken
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A counting semaphore whose `wait` blocks through the scheduler.
pub struct Semaphore {
    count: Spin<isize>,
    queue: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: isize) -> Self {
        Self {
            count: Spin::new(count),
            queue: WaitQueue::new(),
        }
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    pub fn wait(&self, sched: &Scheduler, cpu: CpuId) {
        loop {
            if self.try_wait() {
                return;
            }
            self.queue.sleep_on(sched, cpu);
        }
    }

    pub fn signal(&self, sched: &Scheduler) {
        *self.count.lock() += 1;
        self.queue.wake_one(sched);
    }
}

/// A sleeping mutex; contended lockers block instead of spinning.
pub struct Mutex {
    sem: Semaphore,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
        }
    }

    pub fn lock(&self, sched: &Scheduler, cpu: CpuId) {
        self.sem.wait(sched, cpu);
    }

    pub fn try_lock(&self) -> bool {
        self.sem.try_wait()
    }

    pub fn unlock(&self, sched: &Scheduler) {
        self.sem.signal(sched);
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::task::scheduler::tests::sched_core;
    use crate::kernel::task::task::{TaskFlags, TaskState};

    fn noop() {}

    #[test]
    fn semaphore_blocks_and_wakes() {
        let core = sched_core(1);
        let sched = &core.sched;
        let cpu0 = CpuId::from_val(0);

        let waiter = sched.create_task("waiter", noop, TaskFlags::empty()).unwrap();
        sched.add_task(&waiter);
        sched.schedule(cpu0);

        let sem = Semaphore::new(0);
        assert!(!sem.try_wait());

        // `wait` blocks the current task on the queue and switches away.
        // In the model the loop would retry; signal first so it acquires
        // on the second pass.
        sem.signal(sched);
        sem.wait(sched, cpu0);
        assert!(!sem.try_wait());
    }

    #[test]
    fn wait_queue_wakes_in_fifo_order() {
        let core = sched_core(2);
        let sched = &core.sched;

        let a = sched.create_task("qa", noop, TaskFlags::empty()).unwrap();
        let b = sched.create_task("qb", noop, TaskFlags::empty()).unwrap();
        sched.add_task(&a);
        sched.add_task(&b);

        let cpu_a = a.cpu();
        sched.schedule(cpu_a);
        let queue = WaitQueue::new();
        queue.sleep_on(sched, cpu_a);
        assert_eq!(a.state(), TaskState::Blocked);

        let cpu_b = b.cpu();
        sched.schedule(cpu_b);
        queue.sleep_on(sched, cpu_b);

        assert!(queue.wake_one(sched));
        assert_eq!(a.state(), TaskState::Ready);
        assert_eq!(b.state(), TaskState::Blocked);

        assert_eq!(queue.wake_all(sched), 1);
        assert_eq!(b.state(), TaskState::Ready);
        assert!(queue.is_empty());
    }
}
