// vim: tw=80
//! Deferred work, scheduled onto a tokio runtime.
//!
//! A [`Work`] is a reusable unit of work.  Queueing a `Work` that is already
//! pending is a no-op, so any number of wake-ups that arrive before the work
//! runs coalesce into a single execution.  The pending bit is cleared just
//! before the work's function runs, so a wake-up that arrives while the
//! function is running will cause it to run once more afterwards.  A `Work`
//! never runs concurrently with itself, even on a multi-threaded runtime.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering}
    },
    time::Duration
};

use tokio::{runtime::Handle, sync::Notify};

/// A reusable, coalescing unit of work.
pub struct Work {
    pending: AtomicBool,
    /// Held for the duration of each execution
    running: Mutex<()>,
    func: Box<dyn Fn() + Send + Sync>,
}

impl Work {
    pub fn new<F>(func: F) -> Arc<Self>
        where F: Fn() + Send + Sync + 'static
    {
        Arc::new(Work {
            pending: AtomicBool::new(false),
            running: Mutex::new(()),
            func: Box::new(func)
        })
    }

    /// Is this work queued but not yet started?
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn run(&self) {
        let _running = self.running.lock().unwrap();
        self.pending.store(false, Ordering::Release);
        (self.func)()
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Counts work that has been queued but not yet finished.
#[derive(Debug, Default)]
struct Inflight {
    count: AtomicUsize,
    idle: Notify,
}

impl Inflight {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A queue of deferred work, executed on a tokio runtime.
///
/// The runtime is captured at construction time, so work may be queued from
/// any thread, including threads that aren't part of the runtime.
#[derive(Clone, Debug)]
pub struct Workqueue {
    name: &'static str,
    handle: Handle,
    inflight: Arc<Inflight>,
}

impl Workqueue {
    /// Create a new `Workqueue` on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new(name: &'static str) -> Self {
        Self::with_handle(name, Handle::current())
    }

    pub fn with_handle(name: &'static str, handle: Handle) -> Self {
        Workqueue {
            name,
            handle,
            inflight: Arc::default()
        }
    }

    /// Wait until all work queued so far, and any work that it queues in
    /// turn, has finished.
    pub async fn flush(&self) {
        loop {
            let idle = self.inflight.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.inflight.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Is there no queued work, either pending or running?
    pub fn is_idle(&self) -> bool {
        self.inflight.count.load(Ordering::Acquire) == 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run a future on the queue's runtime.
    ///
    /// Unlike queued work, spawned futures are not waited for by
    /// [`flush`](Self::flush).
    pub fn spawn<F>(&self, fut: F)
        where F: Future<Output = ()> + Send + 'static
    {
        self.handle.spawn(fut);
    }

    /// Queue `work` for execution.
    ///
    /// Returns `false` if it was already pending.
    pub fn queue(&self, work: &Arc<Work>) -> bool {
        self.queue_delayed(work, Duration::ZERO)
    }

    /// Queue `work` for execution after `delay` has elapsed.
    ///
    /// Returns `false` if it was already pending.
    pub fn queue_delayed(&self, work: &Arc<Work>, delay: Duration) -> bool {
        if work.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inflight.start();
        let work = work.clone();
        let inflight = self.inflight.clone();
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            work.run();
            inflight.finish();
        });
        true
    }
}

// LCOV_EXCL_STOP
