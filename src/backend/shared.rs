//! Process-wide engine resources with reference-counted lifetime.
//!
//! llama.cpp's backend must be initialised once before any model is loaded
//! and freed once after the last one is gone. [`SharedResource`] holds only a
//! `Weak`; strong `Arc`s live in the loaded models, so the resource is created
//! on first use and dropped when the last user releases it.

use std::sync::{Arc, Mutex, Weak};

pub struct SharedResource<T> {
    slot: Mutex<Weak<T>>,
}

impl<T> SharedResource<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Weak::new()),
        }
    }

    /// Return the live resource, or create it with `init`.
    ///
    /// The lock is held across `init`, so concurrent callers wait for a single
    /// initialisation instead of racing.
    pub fn acquire<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(live) = slot.upgrade() {
            return Ok(live);
        }
        let fresh = Arc::new(init()?);
        *slot = Arc::downgrade(&fresh);
        Ok(fresh)
    }

    /// Whether some caller still holds the resource.
    pub fn is_live(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.strong_count() > 0
    }
}

impl<T> Default for SharedResource<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted<'a> {
        drops: &'a AtomicUsize,
    }

    impl Drop for Counted<'_> {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_init_once_while_held() {
        let inits = AtomicUsize::new(0);
        let drops = AtomicUsize::new(0);
        let shared: SharedResource<Counted> = SharedResource::new();

        let make = || -> Result<Counted, ()> {
            inits.fetch_add(1, Ordering::SeqCst);
            Ok(Counted { drops: &drops })
        };

        let a = shared.acquire(make).unwrap();
        let b = shared.acquire(make).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(shared.is_live());

        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 0, "still held by b");
        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1, "last release tears down");
        assert!(!shared.is_live());
    }

    #[test]
    fn test_reinit_after_teardown() {
        let inits = AtomicUsize::new(0);
        let shared: SharedResource<u32> = SharedResource::new();

        let first = shared
            .acquire(|| -> Result<u32, ()> {
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .unwrap();
        drop(first);

        let second = shared
            .acquire(|| -> Result<u32, ()> {
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .unwrap();
        assert_eq!(*second, 2);
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_init_leaves_slot_empty() {
        let shared: SharedResource<u32> = SharedResource::new();
        let result = shared.acquire(|| Err::<u32, &str>("no device"));
        assert_eq!(result.unwrap_err(), "no device");
        assert!(!shared.is_live());
        assert_eq!(*shared.acquire(|| Ok::<u32, &str>(5)).unwrap(), 5);
    }
}
