use super::future::Promise;
use super::SandboxTask;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

pub(crate) struct QueuedTask {
    pub(crate) task: SandboxTask,
    pub(crate) promise: Promise,
    /// Times this task was handed back after its process died
    pub(crate) attempts: u32,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<QueuedTask>,
    closed: bool,
}

/// Blocking double-ended task queue shared by a pool's worker threads.
#[derive(Default)]
pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TaskQueue {
    /// Append a task. A closed queue drops it, failing its future.
    pub(crate) fn push_back(&self, task: QueuedTask) {
        self.push(task, false);
    }

    /// Put a task ahead of everything queued.
    pub(crate) fn push_front(&self, task: QueuedTask) {
        self.push(task, true);
    }

    fn push(&self, task: QueuedTask, front: bool) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            drop(task);
            return;
        }
        if front {
            state.tasks.push_front(task);
        } else {
            state.tasks.push_back(task);
        }
        self.available.notify_one();
    }

    /// Next task from the front; `None` once the queue is closed.
    pub(crate) fn pop(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            self.available.wait(&mut state);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Close the queue and fail every task still in it.
    pub(crate) fn close(&self) {
        let drained: Vec<QueuedTask> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.tasks.drain(..).collect()
        };
        self.available.notify_all();
        drop(drained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RunMode;
    use crate::policy::PermissionPolicy;
    use crate::pool::future::{pair, TaskFuture};
    use crate::PalisadeError;

    fn queued(unit: &str) -> (QueuedTask, TaskFuture) {
        let (promise, future) = pair();
        let task = SandboxTask::new(unit, PermissionPolicy::new("p").freeze(), RunMode::Sandboxed, Vec::new());
        (
            QueuedTask {
                task,
                promise,
                attempts: 0,
            },
            future,
        )
    }

    #[test]
    fn front_insertions_overtake_queued_tasks() {
        let queue = TaskQueue::default();
        queue.push_back(queued("a").0);
        queue.push_back(queued("b").0);
        queue.push_front(queued("retry").0);
        let order: Vec<String> = (0..3)
            .filter_map(|_| queue.pop())
            .map(|t| t.task.unit().to_string())
            .collect();
        assert_eq!(order, ["retry", "a", "b"]);
    }

    #[test]
    fn closing_fails_pending_futures_and_wakes_poppers() {
        let queue = std::sync::Arc::new(TaskQueue::default());
        let popper = {
            let queue = std::sync::Arc::clone(&queue);
            std::thread::spawn(move || queue.pop().is_none())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (task, future) = queued("late");
        queue.close();
        queue.push_back(task);
        assert!(popper.join().expect("join"));
        assert!(matches!(future.get(), Err(PalisadeError::PoolShutdown)));
        assert_eq!(queue.len(), 0);
    }
}
