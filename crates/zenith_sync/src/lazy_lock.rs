use crate::relax::{Relax, SpinRelax};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::Deref,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

enum LazyState<T, F> {
    Uninitialized(F),
    Initializing,
    Initialized(T),
}

/// A value initialized on first access, racing initializers resolved by a
/// spin on the state byte.
pub struct LazyLock<T, F = fn() -> T, R = SpinRelax>
where
    F: FnOnce() -> T,
{
    value: UnsafeCell<LazyState<T, F>>,
    state: AtomicU8,
    _phantom: PhantomData<R>,
}

unsafe impl<T, F, R> Sync for LazyLock<T, F, R>
where
    T: Send + Sync,
    F: FnOnce() -> T + Send,
{
}

impl<T, F, R> LazyLock<T, F, R>
where
    F: FnOnce() -> T,
    R: Relax,
{
    pub const fn new(init: F) -> Self {
        Self {
            value: UnsafeCell::new(LazyState::Uninitialized(init)),
            state: AtomicU8::new(UNINITIALIZED),
            _phantom: PhantomData,
        }
    }

    /// Run the initializer. Leaves `self.state` untouched; the caller sets
    /// it to `INITIALIZED` afterwards.
    ///
    /// # Safety
    /// Must be called exactly once, with `self.state == INITIALIZING`.
    unsafe fn do_initialization(&self) {
        // SAFETY: We are the only thread that can access the value initializer.
        let slot = unsafe { &mut *self.value.get() };

        match core::mem::replace(slot, LazyState::Initializing) {
            LazyState::Uninitialized(init) => *slot = LazyState::Initialized(init()),
            _ => unreachable!("Invalid LazyLock state."),
        }
    }

    fn spin_until_initialized(&self) {
        while self.state.load(Ordering::Acquire) != INITIALIZED {
            R::relax();
        }
    }

    /// Get immutable reference to the wrapped value if initialized. Block
    /// until the value is initialized by someone (including the caller
    /// itself) otherwise.
    pub fn get(&self) -> &T {
        match self.state.load(Ordering::Acquire) {
            INITIALIZED => {}
            _ => match self.state.compare_exchange(
                UNINITIALIZED,
                INITIALIZING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => unsafe {
                    // SAFETY: We won the exchange, so we are the only initializer.
                    self.do_initialization();
                    self.state.store(INITIALIZED, Ordering::Release);
                },
                Err(_) => self.spin_until_initialized(),
            },
        }

        // SAFETY: The `Acquire` loads above sync us with the initializing cpu.
        match unsafe { &*self.value.get() } {
            LazyState::Initialized(value) => value,
            _ => unreachable!("Value should be initialized."),
        }
    }
}

impl<T, F, R> Deref for LazyLock<T, F, R>
where
    F: FnOnce() -> T,
    R: Relax,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.get()
    }
}
