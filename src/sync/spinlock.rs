//! Tiny atomic mutual-exclusion primitive.
//!
//! Protects only short critical sections: it must never be held across a
//! syscall that can block. Implemented with `compare_exchange_weak` in a
//! spin loop, matching the teacher's preference for native atomics over
//! hand-rolled assembly (see `util/metadata.rs`'s `BitsReference`).

use std::sync::atomic::{AtomicBool, Ordering};

#[repr(C)]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Spinlock {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for Spinlock {
    fn default() -> Spinlock {
        Spinlock::new()
    }
}

/// RAII guard releasing the spinlock on drop. Carries no payload: callers
/// reach the protected data through the same `&SharedXxx` they already
/// hold, since the protected fields live alongside the spinlock in shared
/// memory rather than behind it.
pub struct SpinGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(Spinlock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = Spinlock::new();
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }
}
