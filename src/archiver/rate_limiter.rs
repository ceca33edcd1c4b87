//! Run-wide throttling gate.
//!
//! Every outbound request goes through [`RateLimiter::execute`]. When the
//! server answers with a throttling signal, the limiter suspends *all*
//! requests of the run (the forum enforces a shared quota), counts down one
//! second at a time while emitting [`ArchiveEvent::RateLimit`], and retries
//! the throttled request once the countdown reaches zero.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

use crate::error::RequestError;
use crate::events::{ArchiveEvent, EventReporter};

/// Outcome of one attempt at a throttled operation.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The server answered; no throttling involved.
    Done(T),
    /// The server asked us to wait this long before retrying.
    Throttled(Duration),
}

/// Shared suspend state for all workers of a run.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    remaining: watch::Sender<u64>,
    /// Bumped whenever a new countdown starts; stale countdown tasks stop
    /// publishing once it moves past them.
    generation: Mutex<u64>,
    reporter: EventReporter,
}

impl RateLimiter {
    #[must_use]
    pub fn new(reporter: EventReporter) -> Self {
        let (remaining, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                remaining,
                generation: Mutex::new(0),
                reporter,
            }),
        }
    }

    /// Seconds left before requests may proceed; zero when not throttled.
    #[must_use]
    pub fn seconds_remaining(&self) -> u64 {
        *self.inner.remaining.borrow()
    }

    /// Wait until no countdown is in effect.
    pub async fn ready(&self) {
        let mut rx = self.inner.remaining.subscribe();
        // The sender lives as long as `inner`, so this only returns once zero.
        let _ = rx.wait_for(|left| *left == 0).await;
    }

    /// Run `attempt` until it completes without being throttled.
    ///
    /// Each throttling signal suspends the run for the requested duration and
    /// then retries exactly once; a further signal restarts the cycle. There
    /// is no bound on the number of cycles.
    ///
    /// # Errors
    ///
    /// Returns the first non-throttling error produced by `attempt`.
    pub async fn execute<T, F, Fut>(&self, mut attempt: F) -> Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt<T>, RequestError>>,
    {
        loop {
            self.ready().await;
            match attempt().await? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Throttled(wait) => {
                    self.suspend(wait);
                }
            }
        }
    }

    /// Start (or extend) the run-wide countdown.
    ///
    /// A running countdown that already covers `wait` is left untouched so
    /// concurrent throttling signals do not reset each other.
    pub fn suspend(&self, wait: Duration) {
        let seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        let mut generation = self
            .inner
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let current = *self.inner.remaining.borrow();
        if current > 0 && current >= seconds {
            debug!(current, requested = seconds, "Countdown already covers throttle");
            return;
        }

        *generation += 1;
        let my_generation = *generation;
        info!(seconds, "Rate limited by server, suspending requests");
        self.inner.remaining.send_replace(seconds);
        self.inner.reporter.emit(ArchiveEvent::RateLimit(seconds));
        if seconds == 0 {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let tick = Duration::from_secs(1);
            let mut ticker = interval_at(Instant::now() + tick, tick);
            for left in (0..seconds).rev() {
                ticker.tick().await;
                let generation = inner
                    .generation
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if *generation != my_generation {
                    return;
                }
                inner.remaining.send_replace(left);
                inner.reporter.emit(ArchiveEvent::RateLimit(left));
            }
            debug!("Rate limit countdown finished");
        });
    }
}
