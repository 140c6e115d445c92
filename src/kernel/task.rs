mod readyqueue;
mod scheduler;
#[allow(clippy::module_inception)]
mod task;
mod wait;

pub use readyqueue::{PrioArray, RunQueue, NR_PRIORITIES, RT_PRIORITY_LIMIT};
pub use scheduler::{Scheduler, KERNEL_STACK_ORDER};
pub use task::{
    Credentials, SchedAttrs, SchedPolicy, Task, TaskContext, TaskFlags, TaskState, Tid,
    DEFAULT_PRIORITY, IDLE_PRIORITY,
};
pub use wait::{Mutex, Semaphore, WaitQueue};
