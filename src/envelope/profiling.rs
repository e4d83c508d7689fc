//! Single-flight admission for profiling requests.

use std::sync::atomic::{AtomicBool, Ordering};

/// At most one profile may be in flight per envelope. A second request is
/// refused immediately instead of queueing behind the first.
#[derive(Debug, Default)]
pub struct ProfilingSlot {
    busy: AtomicBool,
}

/// Holds the slot; released on drop, whatever path the request took.
#[derive(Debug)]
pub struct ProfilingGuard<'a> {
    slot: &'a ProfilingSlot,
}

impl ProfilingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<ProfilingGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ProfilingGuard { slot: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for ProfilingGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn second_acquire_fails_until_release() {
        let slot = ProfilingSlot::new();
        let guard = slot.try_acquire().expect("free slot");
        assert!(slot.is_busy());
        assert!(slot.try_acquire().is_none());
        drop(guard);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn exactly_one_winner_under_contention() {
        let slot = Arc::new(ProfilingSlot::new());
        let barrier = Arc::new(Barrier::new(8));
        let (tx, rx) = std::sync::mpsc::channel();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = slot.clone();
                let barrier = barrier.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let guard = slot.try_acquire();
                    tx.send(guard.is_some()).unwrap();
                    // Hold the slot until every thread has tried.
                    barrier.wait();
                })
            })
            .collect();
        drop(tx);
        for h in handles {
            h.join().unwrap();
        }
        let winners = rx.iter().filter(|won| *won).count();
        assert_eq!(winners, 1);
    }
}
