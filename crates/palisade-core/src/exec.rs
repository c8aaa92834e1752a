//! Shared state of one running execution
//!
//! The sandboxed side maintains frames and critical sections; the monitor
//! reads them, measures time and requests cancellation.

use crate::stack::AccessStack;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_EXECUTION: AtomicU64 = AtomicU64::new(1);

/// How a kill ended, as classified at kill time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRecord {
    pub reason: String,
    /// No critical section was held when the kill was issued
    pub safe: bool,
}

#[derive(Debug)]
pub struct ExecutionState {
    id: u64,
    parent: Option<Arc<ExecutionState>>,
    cancelled: AtomicBool,
    finished: AtomicBool,
    frames: Mutex<Vec<String>>,
    held_sections: AtomicUsize,
    cpu_clock: Mutex<Option<CpuClock>>,
    kill: Mutex<Option<KillRecord>>,
}

impl ExecutionState {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_parent(None))
    }

    /// State for a thread started from this execution. Cancelling the
    /// parent cancels the child.
    #[must_use]
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self::with_parent(Some(Arc::clone(self))))
    }

    fn with_parent(parent: Option<Arc<Self>>) -> Self {
        Self {
            id: NEXT_EXECUTION.fetch_add(1, Ordering::Relaxed),
            parent,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            frames: Mutex::new(Vec::new()),
            held_sections: AtomicUsize::new(0),
            cpu_clock: Mutex::new(None),
            kill: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn push_frame(&self, type_name: impl Into<String>) {
        self.frames.lock().push(type_name.into());
    }

    pub fn pop_frame(&self) {
        self.frames.lock().pop();
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    #[must_use]
    pub fn access_stack(&self) -> AccessStack {
        AccessStack::from_call_order(self.frames.lock().clone())
    }

    pub fn enter_critical(&self) {
        self.held_sections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit_critical(&self) {
        self.held_sections.fetch_sub(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn held_sections(&self) -> usize {
        self.held_sections.load(Ordering::SeqCst)
    }

    /// Measure CPU time from the calling thread from now on.
    pub fn bind_current_thread(&self) {
        *self.cpu_clock.lock() = CpuClock::current_thread();
    }

    /// CPU time of the bound thread, if the platform exposes it.
    #[must_use]
    pub fn cpu_time(&self) -> Option<Duration> {
        self.cpu_clock.lock().as_ref().and_then(CpuClock::elapsed)
    }

    /// Store the kill outcome. The first record wins.
    pub fn record_kill(&self, record: KillRecord) -> bool {
        let mut kill = self.kill.lock();
        if kill.is_some() {
            return false;
        }
        *kill = Some(record);
        true
    }

    #[must_use]
    pub fn kill_record(&self) -> Option<KillRecord> {
        self.kill.lock().clone()
    }
}

/// Pops the frame it pushed when dropped.
#[must_use = "the frame is popped as soon as the guard is dropped"]
#[derive(Debug)]
pub struct FrameGuard {
    state: Arc<ExecutionState>,
}

impl FrameGuard {
    pub(crate) fn enter(state: &Arc<ExecutionState>, type_name: impl Into<String>) -> Self {
        state.push_frame(type_name);
        Self {
            state: Arc::clone(state),
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.state.pop_frame();
    }
}

/// Marks shared state as being mutated. A kill issued while one is held is
/// reported as unsafe.
#[must_use = "the section ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct CriticalSection {
    state: Arc<ExecutionState>,
}

impl CriticalSection {
    pub(crate) fn enter(state: &Arc<ExecutionState>) -> Self {
        state.enter_critical();
        Self {
            state: Arc::clone(state),
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.state.exit_critical();
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
struct CpuClock(libc::clockid_t);

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
impl CpuClock {
    fn current_thread() -> Option<Self> {
        let mut clock: libc::clockid_t = 0;
        // SAFETY: pthread_self() is a valid handle for the calling thread and
        // `clock` is a valid out pointer.
        let ret = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut clock) };
        (ret == 0).then_some(Self(clock))
    }

    fn elapsed(&self) -> Option<Duration> {
        // SAFETY: timespec is plain old data
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        // SAFETY: `ts` is a valid out pointer; a clock of an exited thread
        // makes the call fail rather than misbehave.
        let ret = unsafe { libc::clock_gettime(self.0, &mut ts) };
        if ret != 0 {
            return None;
        }
        let secs = u64::try_from(ts.tv_sec).ok()?;
        let nanos = u32::try_from(ts.tv_nsec).ok()?;
        Some(Duration::new(secs, nanos))
    }
}

#[cfg(not(target_os = "linux"))]
#[derive(Debug, Clone, Copy)]
struct CpuClock;

#[cfg(not(target_os = "linux"))]
impl CpuClock {
    const fn current_thread() -> Option<Self> {
        None
    }

    const fn elapsed(&self) -> Option<Duration> {
        None
    }
}
