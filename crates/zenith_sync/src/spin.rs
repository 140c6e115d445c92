mod guard;

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

pub use guard::SpinGuard;

use crate::relax::{Relax, SpinRelax};

/// Extra state saved when a lock is taken and restored when the guard is
/// dropped. The kernel uses this to couple a lock section with the local
/// CPU's interrupt-enable flag; plain sections use [`NoContext`].
pub trait SpinContext {
    fn restore(self);
}

pub struct NoContext;

impl SpinContext for NoContext {
    fn restore(self) {}
}

/// A spinlock is a lock that uses busy-waiting to acquire the lock.
/// It is useful for short critical sections where the overhead of a context
/// switch is too high.
#[derive(Debug, Default)]
pub struct Spin<T, R = SpinRelax>
where
    T: ?Sized,
{
    _phantom: PhantomData<R>,
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

impl<T, R> Spin<T, R> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
            _phantom: PhantomData,
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T, R> Spin<T, R>
where
    T: ?Sized,
{
    /// # Safety
    /// This function is unsafe because the caller MUST ensure that the
    /// protected value is no longer accessed after calling this function.
    pub(crate) unsafe fn do_unlock(&self) {
        let locked = self.locked.swap(false, Ordering::Release);
        debug_assert!(locked, "Spin::unlock(): Unlocking an unlocked lock");
    }
}

impl<T, R> Spin<T, R>
where
    T: ?Sized,
    R: Relax,
{
    pub fn lock_with_context<C>(&self, context: C) -> SpinGuard<'_, T, C, R>
    where
        C: SpinContext,
    {
        self.do_lock();

        SpinGuard::new(
            self,
            unsafe {
                // SAFETY: We are holding the lock, so we can safely access the value.
                &mut *self.value.get()
            },
            context,
        )
    }

    pub fn lock(&self) -> SpinGuard<'_, T, NoContext, R> {
        self.lock_with_context(NoContext)
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T, NoContext, R>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| {
                SpinGuard::new(
                    self,
                    unsafe {
                        // SAFETY: We are holding the lock, so we can safely access the value.
                        &mut *self.value.get()
                    },
                    NoContext,
                )
            })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: The exclusive access to the lock is guaranteed by the borrow checker.
        unsafe { &mut *self.value.get() }
    }

    fn do_lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            R::relax();
        }
    }
}

// SAFETY: As long as the value protected by the lock is able to be shared between threads,
//         we can send the lock between threads.
unsafe impl<T, R> Send for Spin<T, R> where T: ?Sized + Send {}

// SAFETY: As long as the value protected by the lock is able to be shared between threads,
//         we can provide exclusive access guarantees to the lock.
unsafe impl<T, R> Sync for Spin<T, R> where T: ?Sized + Send {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_gives_exclusive_access() {
        let lock = Spin::<_>::new(0usize);

        {
            let mut guard = lock.lock();
            *guard += 42;
        }

        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spin::<_>::new(());

        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn context_restored_on_unlock() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        static RESTORED: AtomicUsize = AtomicUsize::new(0);

        struct Counting;
        impl SpinContext for Counting {
            fn restore(self) {
                RESTORED.fetch_add(1, Ordering::Relaxed);
            }
        }

        let lock = Spin::<_>::new(());
        drop(lock.lock_with_context(Counting));
        assert_eq!(RESTORED.load(Ordering::Relaxed), 1);
    }
}
