use core::{
    hint,
    sync::atomic::{AtomicIsize, Ordering},
};
use parking_lot::{Condvar, Mutex};

const SPIN_LIMIT: u32 = 64;

/// Counting semaphore with a lock-free fast path.
///
/// `count` holds available permits when positive and the number of blocked
/// waiters when negative. Only a thread that has to sleep, or a release that
/// has to wake a sleeper, touches the mutex.
#[derive(Debug, Default)]
pub(super) struct Semaphore {
    count: AtomicIsize,
    wakeups: Mutex<usize>,
    wakeup: Condvar,
}

impl Semaphore {
    /// Takes one permit, blocking until one is available.
    pub(super) fn acquire(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.try_acquire() {
                return;
            }
            hint::spin_loop();
        }
        if self.count.fetch_sub(1, Ordering::Acquire) > 0 {
            return;
        }
        let mut wakeups = self.wakeups.lock();
        while *wakeups == 0 {
            self.wakeup.wait(&mut wakeups);
        }
        *wakeups -= 1;
    }

    /// Takes one permit if one is available right now.
    pub(super) fn try_acquire(&self) -> bool {
        let mut count = self.count.load(Ordering::Relaxed);
        while count > 0 {
            match self.count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
        false
    }

    /// Adds `permits` permits, waking at most that many blocked threads.
    pub(super) fn release(&self, permits: usize) {
        if permits == 0 {
            return;
        }
        let permits = isize::try_from(permits).expect("Semaphore::release");
        let previous = self.count.fetch_add(permits, Ordering::Release);
        let sleepers = previous.saturating_neg().clamp(0, permits);
        if sleepers == 0 {
            return;
        }
        let mut wakeups = self.wakeups.lock();
        *wakeups += sleepers.unsigned_abs();
        if sleepers == 1 {
            self.wakeup.notify_one();
        } else {
            self.wakeup.notify_all();
        }
    }
}
