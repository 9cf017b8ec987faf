//! Count-down gates used to synchronise a burst.
//!
//! A [`CountdownLatch`] starts at `n` and opens once it has been counted down
//! `n` times. Waiters park until the count reaches zero. The pool builds its
//! start gate (count 1), ready gate (one per worker) and end gate (one per
//! unit) from it.

use tokio::sync::watch;

/// An async count-down latch.
#[derive(Debug)]
pub struct CountdownLatch {
    count: watch::Sender<usize>,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        let (count, _) = watch::channel(count);
        Self { count }
    }

    /// Decrements the count. Extra calls once open are ignored.
    pub fn count_down(&self) {
        self.count.send_if_modified(|count| {
            if *count == 0 {
                return false;
            }
            *count -= 1;
            true
        });
    }

    /// Opens the latch regardless of the remaining count.
    pub fn open(&self) {
        self.count.send_if_modified(|count| {
            let was_closed = *count > 0;
            *count = 0;
            was_closed
        });
    }

    pub fn remaining(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }

    /// Parks until the count reaches zero.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we
        // wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Returns a guard that counts the latch down exactly once when dropped,
    /// including during unwinding.
    pub fn guard(&self) -> CountdownGuard<'_> {
        CountdownGuard { latch: self }
    }
}

/// Counts its latch down on drop.
#[must_use = "dropping the guard immediately counts the latch down"]
#[derive(Debug)]
pub struct CountdownGuard<'a> {
    latch: &'a CountdownLatch,
}

impl Drop for CountdownGuard<'_> {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn opens_after_exact_count() {
        let latch = CountdownLatch::new(3);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.remaining(), 1);
        assert!(!latch.is_open());
        latch.count_down();
        assert!(latch.is_open());
        latch.count_down();
        assert_eq!(latch.remaining(), 0);
        latch.wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_park_until_released() {
        let gate = Arc::new(CountdownLatch::new(1));
        let passed = Arc::new(CountdownLatch::new(8));

        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let passed = Arc::clone(&passed);
            tokio::spawn(async move {
                gate.wait().await;
                passed.count_down();
            });
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(passed.remaining(), 8, "nobody may pass a closed gate");

        gate.open();
        tokio::time::timeout(Duration::from_secs(5), passed.wait())
            .await
            .expect("all waiters released");
    }

    #[test]
    fn guard_counts_down_during_unwind() {
        let latch = CountdownLatch::new(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = latch.guard();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(latch.is_open());
    }
}
