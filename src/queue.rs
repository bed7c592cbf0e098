//! Work deques and the open-jobs tracker behind quiescence detection.
//!
//! Both worker groups feed from a deque that supports prepend and append:
//! final results are prepended so finality propagates before refinable
//! churn, intermediate results are appended. A shared atomic counter tracks
//! jobs that are queued or in flight; it reaches zero iff both deques are
//! drained and no worker holds a job, and the phase controller blocks on
//! exactly that transition. Waits use a bounded timeout, so spurious
//! wake-ups and missed notifications both resolve within one poll interval.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Poll interval for blocking waits. Short enough that suspend and stop
/// flags are observed promptly, long enough not to matter for throughput.
const WAIT_INTERVAL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Work deque
// ---------------------------------------------------------------------------

/// A double-ended work queue with blocking pop.
#[derive(Debug)]
pub struct WorkDeque<T> {
    inner: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> WorkDeque<T> {
    /// Create an empty deque.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Prepend an item: it is popped before everything already queued.
    pub fn push_front(&self, item: T) {
        let mut q = self.inner.lock().expect("work deque lock poisoned");
        q.push_front(item);
        self.available.notify_one();
    }

    /// Append an item.
    pub fn push_back(&self, item: T) {
        let mut q = self.inner.lock().expect("work deque lock poisoned");
        q.push_back(item);
        self.available.notify_one();
    }

    /// Non-blocking pop from the front.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().expect("work deque lock poisoned").pop_front()
    }

    /// Blocking pop: returns `None` once `stop` is set and the deque has
    /// been observed empty. While `suspend` is set, items stay queued and
    /// the caller sleeps.
    pub fn pop_wait(&self, stop: &AtomicBool, suspend: &AtomicBool) -> Option<T> {
        let mut q = self.inner.lock().expect("work deque lock poisoned");
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if !suspend.load(Ordering::Acquire) {
                if let Some(item) = q.pop_front() {
                    return Some(item);
                }
            }
            let (guard, _timeout) = self
                .available
                .wait_timeout(q, WAIT_INTERVAL)
                .expect("work deque lock poisoned");
            q = guard;
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("work deque lock poisoned").len()
    }

    /// Whether the deque is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything queued. Interruption path only.
    pub fn drain(&self) -> Vec<T> {
        let mut q = self.inner.lock().expect("work deque lock poisoned");
        q.drain(..).collect()
    }

    /// Wake every blocked consumer, e.g. after setting the stop flag.
    pub fn notify_all(&self) {
        self.available.notify_all();
    }
}

impl<T> Default for WorkDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Open-jobs tracker
// ---------------------------------------------------------------------------

/// Counts jobs that are queued or held by a worker, and lets the phase
/// controller block until the count reaches zero.
///
/// The discipline that makes the count sound: whoever enqueues work calls
/// [`add`](JobTracker::add) *before* the push, and a worker calls
/// [`complete`](JobTracker::complete) only after everything the job
/// spawned has itself been added. The count therefore never dips to zero
/// while follow-up work is still unannounced.
#[derive(Debug)]
pub struct JobTracker {
    open: AtomicUsize,
    lock: Mutex<()>,
    quiescent: Condvar,
}

impl JobTracker {
    /// Create a tracker with no open jobs.
    pub fn new() -> Self {
        Self {
            open: AtomicUsize::new(0),
            lock: Mutex::new(()),
            quiescent: Condvar::new(),
        }
    }

    /// Announce `n` new jobs. Called before the corresponding pushes.
    pub fn add(&self, n: usize) {
        self.open.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one job finished. Fires the quiescence notification on the
    /// nonzero to zero transition.
    ///
    /// Saturates at zero: a worker finishing its last job after an
    /// interruption reset the count must not underflow it.
    pub fn complete(&self) {
        let mut current = self.open.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            match self.open.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        let _guard = self.lock.lock().expect("job tracker lock poisoned");
                        self.quiescent.notify_all();
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Current number of queued or in-flight jobs.
    pub fn open_jobs(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Reset the count to zero after draining the deques. Interruption
    /// path only.
    pub fn reset(&self) {
        self.open.store(0, Ordering::Release);
        let _guard = self.lock.lock().expect("job tracker lock poisoned");
        self.quiescent.notify_all();
    }

    /// Wake all waiters without changing the count, e.g. when a failure is
    /// recorded and the phase wait must re-check.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock().expect("job tracker lock poisoned");
        self.quiescent.notify_all();
    }

    /// Block until the count is zero or `interrupt` is set. Spurious
    /// wake-ups are tolerated: the condition is re-checked on every wake.
    pub fn await_quiescence(&self, interrupt: &AtomicBool) {
        let mut guard = self.lock.lock().expect("job tracker lock poisoned");
        while self.open.load(Ordering::Acquire) > 0 && !interrupt.load(Ordering::Acquire) {
            let (g, _timeout) = self
                .quiescent
                .wait_timeout(guard, WAIT_INTERVAL)
                .expect("job tracker lock poisoned");
            guard = g;
        }
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}
