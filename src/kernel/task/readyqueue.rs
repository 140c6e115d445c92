use alloc::collections::VecDeque;
use alloc::sync::Arc;

use zenith_percpu::CpuId;

use super::task::{Task, TaskState};
use crate::prelude::*;

pub const NR_PRIORITIES: usize = 140;
/// Priorities below this are the real-time range.
pub const RT_PRIORITY_LIMIT: u32 = 100;

const BITMAP_WORDS: usize = NR_PRIORITIES.div_ceil(64);

/// 140 priority buckets plus the occupancy bitmap pick-next scans.
pub struct PrioArray {
    bitmap: [u64; BITMAP_WORDS],
    queues: [VecDeque<Arc<Task>>; NR_PRIORITIES],
    count: usize,
}

impl PrioArray {
    pub fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            queues: core::array::from_fn(|_| VecDeque::new()),
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn enqueue(&mut self, task: Arc<Task>) {
        let priority = task.priority() as usize;
        assert!(priority < NR_PRIORITIES);

        self.queues[priority].push_back(task);
        self.bitmap[priority / 64] |= 1 << (priority % 64);
        self.count += 1;
    }

    /// The lowest set bit, i.e. the best occupied priority.
    pub fn first_priority(&self) -> Option<usize> {
        for (word_index, &word) in self.bitmap.iter().enumerate() {
            if word != 0 {
                return Some(word_index * 64 + word.trailing_zeros() as usize);
            }
        }
        None
    }

    pub fn pick(&mut self) -> Option<Arc<Task>> {
        let priority = self.first_priority()?;
        let task = self.queues[priority]
            .pop_front()
            .expect("the bitmap said the bucket is non-empty");

        if self.queues[priority].is_empty() {
            self.bitmap[priority / 64] &= !(1 << (priority % 64));
        }
        self.count -= 1;

        Some(task)
    }

    pub fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        let priority = task.priority() as usize;

        let queue = &mut self.queues[priority];
        let Some(position) = queue.iter().position(|queued| Arc::ptr_eq(queued, task)) else {
            return false;
        };

        queue.remove(position);
        if queue.is_empty() {
            self.bitmap[priority / 64] &= !(1 << (priority % 64));
        }
        self.count -= 1;
        true
    }

    /// Steal a migration victim: the worst-priority task within
    /// `[low, high)` that `allow` accepts, taken from the bucket tail.
    pub fn steal(
        &mut self,
        low: usize,
        high: usize,
        allow: impl Fn(&Arc<Task>) -> bool,
    ) -> Option<Arc<Task>> {
        for priority in (low..high.min(NR_PRIORITIES)).rev() {
            let queue = &mut self.queues[priority];
            let Some(position) = queue.iter().rposition(&allow) else {
                continue;
            };

            let task = queue.remove(position).expect("position is in range");
            if queue.is_empty() {
                self.bitmap[priority / 64] &= !(1 << (priority % 64));
            }
            self.count -= 1;
            return Some(task);
        }
        None
    }

    pub fn bucket_len(&self, priority: usize) -> usize {
        self.queues[priority].len()
    }

    pub fn bucket_tail(&self, priority: usize) -> Option<&Arc<Task>> {
        self.queues[priority].back()
    }

    /// Bitmap bit `i` must equal "bucket `i` is non-empty".
    pub fn check_bitmap(&self) {
        for priority in 0..NR_PRIORITIES {
            let bit = self.bitmap[priority / 64] & (1 << (priority % 64)) != 0;
            assert_eq!(
                bit,
                !self.queues[priority].is_empty(),
                "bitmap out of sync at priority {}",
                priority
            );
        }
    }
}

impl Default for PrioArray {
    fn default() -> Self {
        Self::new()
    }
}

/// One CPU's ready set: the active/expired array pair, the running task,
/// and the idle fallback.
pub struct RunQueue {
    cpu: CpuId,
    pub active: PrioArray,
    pub expired: PrioArray,
    nr_running: usize,
    pub current: Option<Arc<Task>>,
    pub idle: Option<Arc<Task>>,
}

impl RunQueue {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            active: PrioArray::new(),
            expired: PrioArray::new(),
            nr_running: 0,
            current: None,
            idle: None,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Queued tasks (the running one not included).
    pub fn nr_running(&self) -> usize {
        self.nr_running
    }

    pub fn current_priority(&self) -> Option<u32> {
        self.current.as_ref().map(|task| task.priority())
    }

    pub fn enqueue(&mut self, task: Arc<Task>, into_expired: bool) {
        assert!(
            !task.on_rq.swap(true, core::sync::atomic::Ordering::Relaxed),
            "task {} enqueued twice",
            task.tid()
        );
        assert!(
            !into_expired || task.policy().uses_expired_array(),
            "only timesharing tasks rotate into the expired array"
        );

        task.set_cpu(self.cpu);
        if into_expired {
            self.expired.enqueue(task);
        } else {
            self.active.enqueue(task);
        }
        self.nr_running += 1;
    }

    pub fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        if self.active.dequeue(task) || self.expired.dequeue(task) {
            task.on_rq.store(false, core::sync::atomic::Ordering::Relaxed);
            self.nr_running -= 1;
            true
        } else {
            false
        }
    }

    /// O(1) pick: scan the active bitmap; when the active array drains,
    /// swap in the expired one.
    pub fn pick_next(&mut self) -> Option<Arc<Task>> {
        if self.active.is_empty() && !self.expired.is_empty() {
            core::mem::swap(&mut self.active, &mut self.expired);
        }

        self.active.pick().inspect(|task| {
            task.on_rq.store(false, core::sync::atomic::Ordering::Relaxed);
            self.nr_running -= 1;
        })
    }

    /// Take a migration victim off this queue, worst priority first,
    /// searching the active array before the expired one.
    pub fn steal(
        &mut self,
        low: usize,
        high: usize,
        allow: impl Fn(&Arc<Task>) -> bool + Copy,
    ) -> Option<Arc<Task>> {
        let task = self
            .active
            .steal(low, high, allow)
            .or_else(|| self.expired.steal(low, high, allow))?;

        task.on_rq.store(false, core::sync::atomic::Ordering::Relaxed);
        self.nr_running -= 1;
        Some(task)
    }

    /// Property check: bitmap coherence plus queued-task state sanity.
    pub fn check_invariants(&self) {
        self.active.check_bitmap();
        self.expired.check_bitmap();
        assert_eq!(self.nr_running, self.active.count() + self.expired.count());

        if let Some(current) = &self.current {
            assert_eq!(current.state(), TaskState::Running);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kernel::cpu::CpuSet;
    use crate::kernel::mem::page_alloc::tests::small_pmm;
    use crate::kernel::mem::Page;
    use crate::kernel::task::task::{SchedAttrs, SchedPolicy, TaskFlags};
    use zenith_mm::paging::AllocFlags;

    fn entry() {}

    pub(crate) fn bare_task(tid: u32, priority: u32, policy: SchedPolicy) -> Arc<Task> {
        let pmm = small_pmm(64);
        let kstack = Page::alloc_order_in(&pmm, 2, AllocFlags::ZERO).unwrap();

        Arc::new(Task::new(
            tid,
            tid,
            0,
            alloc::format!("task-{}", tid),
            entry,
            TaskFlags::empty(),
            SchedAttrs {
                policy,
                static_priority: priority,
                dynamic_priority: priority,
                time_slice_ms: 100,
                slice_expired: false,
            },
            CpuSet::all(4),
            kstack,
        ))
    }

    #[test]
    fn bitmap_tracks_buckets() {
        let mut array = PrioArray::new();

        let high = bare_task(1, 10, SchedPolicy::Fifo);
        let low = bare_task(2, 130, SchedPolicy::Normal);

        array.enqueue(low.clone());
        array.enqueue(high.clone());
        array.check_bitmap();

        assert_eq!(array.first_priority(), Some(10));
        assert!(Arc::ptr_eq(&array.pick().unwrap(), &high));
        assert_eq!(array.first_priority(), Some(130));
        assert!(Arc::ptr_eq(&array.pick().unwrap(), &low));
        assert!(array.pick().is_none());
        array.check_bitmap();
    }

    #[test]
    fn dequeue_clears_empty_buckets() {
        let mut array = PrioArray::new();
        let task = bare_task(3, 99, SchedPolicy::Rr);

        array.enqueue(task.clone());
        assert!(array.dequeue(&task));
        assert!(!array.dequeue(&task));
        assert_eq!(array.first_priority(), None);
        array.check_bitmap();
    }

    #[test]
    fn active_swaps_with_expired_when_drained() {
        let mut rq = RunQueue::new(CpuId::from_val(0));

        let fresh = bare_task(4, 120, SchedPolicy::Normal);
        let tired = bare_task(5, 120, SchedPolicy::Normal);

        rq.enqueue(fresh.clone(), false);
        rq.enqueue(tired.clone(), true);
        assert_eq!(rq.nr_running(), 2);

        assert!(Arc::ptr_eq(&rq.pick_next().unwrap(), &fresh));
        // Active is now empty; the expired array rotates in.
        assert!(Arc::ptr_eq(&rq.pick_next().unwrap(), &tired));
        assert!(rq.pick_next().is_none());
        rq.check_invariants();
    }
}
