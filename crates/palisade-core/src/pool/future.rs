use crate::error::RemoteFailure;
use crate::result::SandboxedCallResult;
use crate::{PalisadeError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Outcome = std::result::Result<SandboxedCallResult, RemoteFailure>;

#[derive(Default)]
struct Shared {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

/// Create a connected promise/future pair.
pub(crate) fn pair() -> (Promise, TaskFuture) {
    let shared = Arc::new(Shared::default());
    (
        Promise {
            shared: Some(Arc::clone(&shared)),
        },
        TaskFuture { shared },
    )
}

/// Writing half, owned by whoever executes the task. Dropping it unresolved
/// fails the future with `PoolShutdown`.
pub(crate) struct Promise {
    shared: Option<Arc<Shared>>,
}

impl Promise {
    pub(crate) fn complete(mut self, result: Result<SandboxedCallResult>) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, result.map_err(|e| RemoteFailure::from(&e)));
        }
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, Err(RemoteFailure::from(&PalisadeError::PoolShutdown)));
        }
    }
}

fn resolve(shared: &Shared, outcome: Outcome) {
    let mut slot = shared.outcome.lock();
    if slot.is_none() {
        *slot = Some(outcome);
        shared.ready.notify_all();
    }
}

/// Result of a submitted task, resolved exactly once.
#[derive(Clone)]
pub struct TaskFuture {
    shared: Arc<Shared>,
}

impl TaskFuture {
    /// Block until the task resolves.
    pub fn get(&self) -> Result<SandboxedCallResult> {
        let mut slot = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return unpack(outcome);
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`. The task keeps running after a timeout.
    pub fn get_timeout(&self, timeout: Duration) -> Result<SandboxedCallResult> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return unpack(outcome);
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() && slot.is_none() {
                return Err(PalisadeError::Timeout(timeout));
            }
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// Remote executions cannot be cancelled; always returns false.
    #[allow(clippy::unused_self)]
    #[must_use]
    pub const fn cancel(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture").field("done", &self.is_done()).finish()
    }
}

fn unpack(outcome: &Outcome) -> Result<SandboxedCallResult> {
    outcome.clone().map_err(RemoteFailure::into_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::DomainId;
    use serde_json::json;

    #[test]
    fn completion_wakes_a_waiting_getter() {
        let (promise, future) = pair();
        let waiter = {
            let future = future.clone();
            std::thread::spawn(move || future.get())
        };
        promise.complete(Ok(SandboxedCallResult::new(json!(7), DomainId::host())));
        let result = waiter.join().expect("join").expect("result");
        assert_eq!(result.raw(), &json!(7));
        assert!(future.is_done());
    }

    #[test]
    fn timeout_leaves_the_future_pending() {
        let (_promise, future) = pair();
        assert!(matches!(
            future.get_timeout(Duration::from_millis(20)),
            Err(PalisadeError::Timeout(_))
        ));
        assert!(!future.is_done());
        assert!(!future.cancel());
    }

    #[test]
    fn dropped_promise_fails_with_pool_shutdown() {
        let (promise, future) = pair();
        drop(promise);
        assert!(matches!(future.get(), Err(PalisadeError::PoolShutdown)));
    }

    #[test]
    fn failures_keep_their_kind() {
        let (promise, future) = pair();
        promise.complete(Err(PalisadeError::UnsafeKillSignaled));
        assert!(matches!(future.get(), Err(PalisadeError::UnsafeKillSignaled)));
    }
}
