//! Supervised background tasks
//!
//! Long-running loops (camera discovery, camera polling, the session worker)
//! run on named OS threads owned by a [`SupervisedTask`]. Each task observes a
//! [`CancellationToken`]; cancelling a token wakes any sleep on it and
//! cascades to every child token.

use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    children: Vec<Weak<TokenInner>>,
}

#[derive(Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    wake: Condvar,
}

impl TokenInner {
    fn cancel(&self) {
        let children = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.children)
        };

        self.wake.notify_all();

        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cooperative cancellation signal shared between a task and its owner
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Create a fresh, uncancelled root token
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled whenever `self` is
    pub fn child(&self) -> CancellationToken {
        let child = CancellationToken::new();

        let mut state = self.inner.state.lock();
        if state.cancelled {
            drop(state);
            child.cancel();
        } else {
            state.children.retain(|weak| weak.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }

        child
    }

    /// Cancel this token and all of its children
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether this token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// `Err(Cancelled)` once the token is cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning early with `Err(Cancelled)` on cancellation
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut state = self.inner.state.lock();

        while !state.cancelled {
            if self.inner.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        if state.cancelled {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Retry schedule: an optional settling delay, a run of fast retries, then
/// geometric growth up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    settle: Duration,
    fast: Duration,
    fast_attempts: u32,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Build a schedule
    pub fn new(settle: Duration, fast: Duration, fast_attempts: u32, max: Duration) -> Self {
        Self {
            settle,
            fast,
            fast_attempts,
            max: max.max(fast),
            attempt: 0,
        }
    }

    /// Constant delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, u32::MAX, delay)
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let attempt = self.attempt;
        self.attempt = self.attempt.saturating_add(1);

        if attempt == 0 {
            return self.settle;
        }

        if attempt <= self.fast_attempts {
            return self.fast;
        }

        let doublings = (attempt - self.fast_attempts).min(16);
        self.fast.saturating_mul(1 << doublings).min(self.max)
    }

    /// Number of delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over from the settling delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// A named background thread bound to a cancellation token
///
/// Dropping the task cancels it and joins the thread.
pub struct SupervisedTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SupervisedTask {
    /// Spawn `body` on a new thread with a child of `parent`
    ///
    /// A panic inside `body` is caught and logged; it never reaches the owner.
    pub fn spawn<F>(name: impl Into<String>, parent: &CancellationToken, body: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let name = name.into();
        let token = parent.child();
        let task_token = token.clone();
        let task_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(task = %task_name, "Task started");
            if catch_unwind(AssertUnwindSafe(|| body(task_token))).is_err() {
                error!(task = %task_name, "Task panicked");
            }
            debug!(task = %task_name, "Task finished");
        })?;

        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The token the task observes
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the task body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the task to stop without waiting
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(task = %self.name, "Task thread could not be joined");
            }
        }
    }
}

impl Drop for SupervisedTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SupervisedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedTask")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cancel_cascades_to_children() {
        let root = CancellationToken::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(matches!(grandchild.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_child_of_cancelled_token_starts_cancelled() {
        let root = CancellationToken::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn test_cancelling_child_leaves_parent() {
        let root = CancellationToken::new();
        let child = root.child();
        child.cancel();
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();

        let started = Instant::now();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        assert!(token.sleep(Duration::from_secs(30)).is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
        waker.join().unwrap();
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::new(
            Duration::from_secs(5),
            Duration::from_millis(100),
            2,
            Duration::from_millis(500),
        );

        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_backoff() {
        let mut backoff = Backoff::fixed(Duration::from_millis(300));
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        }
    }

    #[test]
    fn test_supervised_task_stops_on_drop() {
        let root = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let task = SupervisedTask::spawn("test-loop", &root, move |token| {
            while token.sleep(Duration::from_millis(1)).is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        drop(task);

        let seen = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_supervised_task_survives_panic() {
        let root = CancellationToken::new();
        let task = SupervisedTask::spawn("test-panic", &root, |_| panic!("boom")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !task.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(task.is_finished());
        task.stop();
    }

    #[test]
    fn test_parent_cancel_stops_task() {
        let root = CancellationToken::new();
        let task = SupervisedTask::spawn("test-parent", &root, |token| {
            while token.sleep(Duration::from_millis(1)).is_ok() {}
        })
        .unwrap();

        root.cancel();
        assert!(task.token().is_cancelled());
        task.stop();
    }
}
