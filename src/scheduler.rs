//! Fixed-interval polling with an explicit start/stop lifecycle.
//!
//! A [`PollHandle`] owns at most one background loop. The loop awaits each
//! tick before waiting for the next one, so a slow tick delays the schedule
//! and never overlaps itself. Every `stop` bumps the handle's epoch; a tick
//! only gets to touch view state through [`PollHandle::apply_if_current`],
//! which refuses work from an older epoch. `stop` and `apply_if_current`
//! share one lock, so once `stop` returns nothing from before it can land.
//!
//! Out-of-schedule fetches take a [`Tick`] from [`PollHandle::ticket`]. Tick
//! sequence numbers are issued in request order, and a result is refused
//! once a later-issued one has been applied, so a slow response never
//! overwrites a newer one.
//!
//! Lock order: a handle's lock is taken before any view-state lock. Never
//! call into a handle while holding view state.

use futures::FutureExt;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Identifies one fetch issued through a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub epoch: u64,
    /// Issue order across all fetches of the handle, starting at 1.
    pub seq: u64,
}

struct HandleState {
    epoch: u64,
    task: Option<JoinHandle<()>>,
    issued: u64,
    applied: u64,
}

impl HandleState {
    fn issue(&mut self) -> Tick {
        self.issued += 1;
        Tick {
            epoch: self.epoch,
            seq: self.issued,
        }
    }
}

struct HandleInner {
    label: String,
    state: Mutex<HandleState>,
}

impl HandleInner {
    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

/// Cloneable handle to one polling loop. Dropping the last clone stops it.
#[derive(Clone)]
pub struct PollHandle {
    inner: Arc<HandleInner>,
}

impl PollHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                label: label.into(),
                state: Mutex::new(HandleState {
                    epoch: 0,
                    task: None,
                    issued: 0,
                    applied: 0,
                }),
            }),
        }
    }

    /// Starts ticking every `period`, first tick immediately.
    ///
    /// No-op when the handle is already running: the existing loop and its
    /// task are kept and the same handle is returned.
    pub fn start<F, Fut, E>(&self, period: Duration, task: F) -> PollHandle
    where
        F: Fn(Tick) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.spawn(Instant::now(), period, task)
    }

    /// Like [`start`](Self::start), but the first tick waits one `period`.
    /// For callers that just fetched the same data themselves.
    pub fn start_delayed<F, Fut, E>(&self, period: Duration, task: F) -> PollHandle
    where
        F: Fn(Tick) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.spawn(Instant::now() + period, period, task)
    }

    fn spawn<F, Fut, E>(&self, first: Instant, period: Duration, task: F) -> PollHandle
    where
        F: Fn(Tick) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("[{}] already polling, start ignored", self.inner.label);
            return self.clone();
        }

        let epoch = state.epoch;
        let weak = Arc::downgrade(&self.inner);
        let label = self.inner.label.clone();
        state.task = Some(tokio::spawn(run_loop(weak, label, epoch, first, period, task)));
        debug!("[{}] polling every {:?} (epoch {})", self.inner.label, period, epoch);

        self.clone()
    }

    /// Stops the loop. Results of ticks issued before this call are
    /// discarded by [`apply_if_current`](Self::apply_if_current).
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        state.epoch += 1;
        if let Some(task) = state.task.take() {
            task.abort();
            debug!("[{}] polling stopped", self.inner.label);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Issues a tick for a fetch outside the schedule. `None` while stopped.
    pub fn ticket(&self) -> Option<Tick> {
        let mut state = self.inner.lock();
        match &state.task {
            Some(task) if !task.is_finished() => Some(state.issue()),
            _ => None,
        }
    }

    /// Runs `apply` only if the handle is running, still in the tick's
    /// epoch, and nothing issued after `tick` has been applied yet.
    pub fn apply_if_current<R>(&self, tick: Tick, apply: impl FnOnce() -> R) -> Option<R> {
        let mut state = self.inner.lock();
        if state.epoch != tick.epoch || state.task.is_none() {
            debug!("[{}] discarding result from epoch {}", self.inner.label, tick.epoch);
            return None;
        }
        if tick.seq <= state.applied {
            debug!(
                "[{}] discarding fetch {}, already showing {}",
                self.inner.label, tick.seq, state.applied
            );
            return None;
        }
        state.applied = tick.seq;
        Some(apply())
    }
}

async fn run_loop<F, Fut, E>(
    handle: Weak<HandleInner>,
    label: String,
    epoch: u64,
    first: Instant,
    period: Duration,
    task: F,
) where
    F: Fn(Tick) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        let tick = match handle.upgrade() {
            Some(inner) => {
                let mut state = inner.lock();
                if state.epoch != epoch {
                    break;
                }
                state.issue()
            }
            None => break,
        };

        match AssertUnwindSafe(task(tick)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] tick {} failed: {}", label, tick.seq, e),
            Err(_) => error!("[{}] tick {} panicked", label, tick.seq),
        }
    }

    debug!("[{}] loop for epoch {} exited", label, epoch);
}
