use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Abstraction over monotonic time so that everything timer-driven (batching cutoffs, reminder
///  pacing, confirmation cadence) can be tested deterministically. The wire protocol itself is
///  clock-free.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    async fn sleep_until(&self, deadline: Instant);
}

/// The production clock, backed by tokio's timer. Under a runtime built with
///  `start_paused(true)` it is fully deterministic and advanced explicitly with
///  `tokio::time::advance`, which is how the timer tests in this crate run.
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await
    }
}
