//! # timer
//!
//! why: election and heartbeat wake-ups have to be replaced and cancelled without races
//! relations: owned by the raft task in server.rs, which schedules it from RaftNode::next_deadline
//! what: Timer

use std::time::Duration;
use tokio::task::JoinHandle;

/// An owned, cancellable wake-up. Scheduling again replaces the previous
/// wake-up; dropping the timer cancels it.
#[derive(Debug, Default)]
pub struct Timer {
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fire` once `delay` has passed. Needs a tokio runtime.
    pub fn schedule<F>(&mut self, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        }));
    }

    /// Cancels the pending wake-up. Cancelling a fired or cancelled timer does nothing.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether a wake-up is scheduled and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&fired);
        (fired, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let mut timer = Timer::new();
        let (fired, fire) = counter();

        timer.schedule(Duration::from_millis(100), fire);
        assert!(timer.is_pending());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let mut timer = Timer::new();
        let (fired, fire) = counter();

        timer.schedule(Duration::from_millis(100), fire);
        timer.cancel();
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // cancelling after the fact is still fine
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_previous_wake_up() {
        let mut timer = Timer::new();
        let (first, fire_first) = counter();
        let (second, fire_second) = counter();

        timer.schedule(Duration::from_millis(50), fire_first);
        timer.schedule(Duration::from_millis(100), fire_second);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let (fired, fire) = counter();
        {
            let mut timer = Timer::new();
            timer.schedule(Duration::from_millis(10), fire);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
