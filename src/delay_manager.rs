use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

/// Fixed-interval limiter shared by every worker.
///
/// Slots are handed out at least one interval apart. [`Throttle::pause`] is
/// the sequential form: a full interval after the item just finished.
/// [`Throttle::acquire`] is taken before an item when several workers run, so
/// request starts stay one interval apart across the whole pool.
pub struct Throttle {
    interval: Duration,
    last_slot: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the first free slot at or after `earliest`.
    fn reserve_from(&self, earliest: Instant) -> Instant {
        let mut guard = match self.last_slot.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = match *guard {
            Some(prev) if prev + self.interval > earliest => prev + self.interval,
            _ => earliest,
        };
        *guard = Some(slot);
        slot
    }

    /// Reserve a slot at least one interval from now, without sleeping.
    pub fn reserve(&self) -> Instant {
        self.reserve_from(Instant::now() + self.interval)
    }

    /// Wait one interval after the current item.
    pub fn pause(&self) {
        if self.interval.is_zero() {
            return;
        }
        let slot = self.reserve();
        sleep_until(slot);
    }

    /// Wait for a start slot before an item. The first slot is immediate.
    pub fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let slot = self.reserve_from(Instant::now());
        sleep_until(slot);
    }
}

fn sleep_until(slot: Instant) {
    let wait = slot.saturating_duration_since(Instant::now());
    if !wait.is_zero() {
        debug!("Throttling for {} ms", wait.as_millis());
        thread::sleep(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservations_are_spaced_by_interval() {
        let throttle = Throttle::new(Duration::from_millis(200));
        let a = throttle.reserve();
        let b = throttle.reserve();
        let c = throttle.reserve();
        assert!(b.duration_since(a) >= Duration::from_millis(200));
        assert!(c.duration_since(b) >= Duration::from_millis(200));
    }

    #[test]
    fn test_single_pause_waits_full_interval() {
        let throttle = Throttle::new(Duration::from_millis(50));
        let start = Instant::now();
        throttle.pause();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_zero_interval_never_sleeps() {
        let throttle = Throttle::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..100 {
            throttle.pause();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_shared_across_threads() {
        let throttle = Throttle::new(Duration::from_millis(30));
        let start = Instant::now();
        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| throttle.pause());
            }
        });
        // Three reservations: 30, 60 and 90 ms out.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_first_acquire_is_immediate() {
        let throttle = Throttle::new(Duration::from_millis(200));
        let start = Instant::now();
        throttle.acquire();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_acquire_spaces_starts_across_threads() {
        let throttle = Throttle::new(Duration::from_millis(40));
        let starts = Mutex::new(Vec::new());
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    throttle.acquire();
                    starts.lock().unwrap().push(Instant::now());
                });
            }
        });
        let mut starts = starts.into_inner().unwrap();
        starts.sort();
        // Slots at 0, 40, 80 and 120 ms.
        assert!(starts[3].duration_since(starts[0]) >= Duration::from_millis(110));
    }
}
