// vim: tw=80
//! Asynchronous bulk copy engine
//!
//! Copies one source region to up to [`MAX_REGIONS`] destination regions, or
//! fills destinations with zeros.  Every job flows through three queues:
//!
//! * **pages**: waiting for buffers from the engine's [`PagePool`]
//! * **io**: ready to issue its next read or write
//! * **complete**: finished; its pages go back to the pool and its callback
//!   runs
//!
//! A single coalescing work item drains the queues in the order complete,
//! pages, io.  Completions free pages, which lets waiting jobs get their
//! pages, which in turn lets them issue I/O, all within one pass.
//!
//! Large copies are split into segments of at most [`SUB_JOB_SIZE`] sectors.
//! [`SPLIT_COUNT`] segments are in flight at once, each one claiming the next
//! chunk of the range when it finishes.

use std::{
    collections::VecDeque,
    mem,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering}
    }
};

use tokio::sync::Notify as WaitQueue;

use crate::{
    io::{CopyIo, Direction},
    page_pool::{Page, PagePool},
    types::*,
    util::pages_for,
    workqueue::{Work, Workqueue},
};

mod job;

use self::job::{Job, Notify, Split};
pub use self::job::NotifyFn;

/// Maximum number of destinations for a single copy
pub const MAX_REGIONS: usize = 8;

/// Copies larger than this many sectors are split into segments
pub const SUB_JOB_SIZE: SectorT = 128;

/// Number of segments of a split job that are in flight at once
pub const SPLIT_COUNT: u32 = 8;

/// Options for a single copy
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CopyFlags {
    /// Keep going after I/O errors, accumulating them for the final report
    pub ignore_errors: bool,
}

/// Sizing of a [`Kcopyd`] instance
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KcopydConfig {
    /// Pages in the engine's buffer pool
    pub nr_pages: usize,
    /// Maximum number of outstanding `copy` or `zero` calls
    pub max_jobs: usize,
}

impl Default for KcopydConfig {
    fn default() -> Self {
        KcopydConfig {
            nr_pages: 4 * pages_for(SUB_JOB_SIZE),
            max_jobs: 64,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Queue {
    Complete,
    Pages,
    Io,
}

#[derive(Debug, Default)]
struct Queues {
    complete: VecDeque<Job>,
    pages: VecDeque<Job>,
    io: VecDeque<Job>,
}

impl Queues {
    fn get(&mut self, q: Queue) -> &mut VecDeque<Job> {
        match q {
            Queue::Complete => &mut self.complete,
            Queue::Pages => &mut self.pages,
            Queue::Io => &mut self.io,
        }
    }
}

struct Inner {
    queues: Mutex<Queues>,
    pool: PagePool,
    io: Arc<dyn CopyIo>,
    wq: Workqueue,
    work: Arc<Work>,
    /// Jobs issued but not yet completed, including the parents of split jobs
    nr_jobs: AtomicUsize,
    destroyq: WaitQueue,
    /// Outstanding calls to `copy` and `zero`
    caller_jobs: AtomicUsize,
    max_jobs: usize,
}

impl Inner {
    /// Queue a job for page allocation
    fn dispatch_job(&self, job: Job) {
        self.nr_jobs.fetch_add(1, Ordering::AcqRel);
        self.push(Queue::Pages, job);
        self.wake();
    }

    fn do_work(self: &Arc<Self>) {
        self.process_jobs(Queue::Complete);
        self.process_jobs(Queue::Pages);
        self.process_jobs(Queue::Io);
    }

    /// Handle the completion of a job's read or write
    fn complete_io(&self, mut job: Job, pages: Vec<Page>, error: u32) {
        job.pages = pages;
        if error != 0 {
            match job.rw {
                Direction::Write => job.write_err |= error,
                Direction::Read => job.read_err = true,
            }
            tracing::debug!(?job, error, "copy I/O error");
            if !job.flags.ignore_errors {
                self.push(Queue::Complete, job);
                self.wake();
                return;
            }
        }
        match job.rw {
            Direction::Write => self.push(Queue::Complete, job),
            Direction::Read => {
                job.rw = Direction::Write;
                self.push(Queue::Io, job);
            }
        }
        self.wake();
    }

    fn pop(&self, q: Queue) -> Option<Job> {
        self.queues.lock().unwrap().get(q).pop_front()
    }

    fn process_jobs(self: &Arc<Self>, q: Queue) {
        while let Some(job) = self.pop(q) {
            match q {
                Queue::Complete => self.run_complete_job(job),
                Queue::Io => self.run_io_job(job),
                Queue::Pages => {
                    if let Err(job) = self.run_pages_job(job) {
                        // Not enough pages.  Wait for some to be freed.
                        self.queues.lock().unwrap().pages.push_front(job);
                        break;
                    }
                }
            }
        }
    }

    fn push(&self, q: Queue, job: Job) {
        self.queues.lock().unwrap().get(q).push_back(job);
    }

    fn run_complete_job(self: &Arc<Self>, job: Job) {
        let Job { pages, notify, read_err, write_err, .. } = job;
        self.pool.put(pages);
        match notify {
            Notify::Caller(f) => {
                self.caller_jobs.fetch_sub(1, Ordering::AcqRel);
                f(read_err, write_err);
            }
            Notify::Segment(split) => {
                self.segment_complete(&split, read_err, write_err);
            }
        }
        if self.nr_jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.destroyq.notify_waiters();
        }
    }

    fn run_io_job(self: &Arc<Self>, mut job: Job) {
        let pages = mem::take(&mut job.pages);
        let fut = match (job.rw, &job.source) {
            (Direction::Read, Some(source)) => self.io.read(source, pages),
            _ => self.io.write(&job.dests, pages),
        };
        let inner = self.clone();
        self.wq.spawn(async move {
            let (pages, error) = fut.await;
            inner.complete_io(job, pages, error);
        });
    }

    /// Try to get pages for a job.  On failure, give the job back.
    fn run_pages_job(&self, mut job: Job) -> std::result::Result<(), Job> {
        let nr_pages = pages_for(job.count());
        match self.pool.get(nr_pages) {
            Some(mut pages) => {
                if job.source.is_none() {
                    pages.iter_mut().for_each(Page::zero);
                }
                job.pages = pages;
                self.push(Queue::Io, job);
                Ok(())
            }
            None => Err(job)
        }
    }

    /// Completion handler for each segment of a split job
    fn segment_complete(&self, split: &Arc<Split>, read_err: bool,
                        write_err: u32)
    {
        match split.advance(read_err, write_err, SUB_JOB_SIZE) {
            Some((offset, count)) => {
                let job = split.segment(split.clone(), offset, count);
                self.dispatch_job(job);
            }
            None => {
                if split.sub_jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.push(Queue::Complete, split.finish());
                    self.wake();
                }
            }
        }
    }

    fn split_job(&self, split: Split) {
        let split = Arc::new(split);
        tracing::debug!(count = split.count, "splitting copy");
        self.nr_jobs.fetch_add(1, Ordering::AcqRel);
        split.sub_jobs.store(SPLIT_COUNT, Ordering::Release);
        for _ in 0..SPLIT_COUNT {
            self.segment_complete(&split, false, 0);
        }
    }

    fn wake(&self) {
        self.wq.queue(&self.work);
    }
}

/// A bulk copy engine.
///
/// Completion callbacks always run on the engine's own worker, never from
/// within `copy` or `zero`.  They must not block.
pub struct Kcopyd {
    inner: Arc<Inner>,
}

impl Kcopyd {
    /// Check a request and reserve a job slot for it
    fn admit(&self, count: SectorT, dests: &[Region]) -> Result<()> {
        if dests.is_empty() || dests.len() > MAX_REGIONS {
            return Err(Error::EINVAL);
        }
        if dests.iter().any(|d| d.count != count) {
            return Err(Error::EINVAL);
        }
        if pages_for(count.min(SUB_JOB_SIZE)) > self.inner.pool.capacity() {
            // Such a job could never get its pages
            return Err(Error::EINVAL);
        }
        let inner = &self.inner;
        if inner.caller_jobs.fetch_add(1, Ordering::AcqRel) >= inner.max_jobs {
            inner.caller_jobs.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ENOMEM);
        }
        Ok(())
    }

    /// Copy `from` to every region in `dests`.
    ///
    /// Returns immediately.  `notify` will be called exactly once, from the
    /// engine's worker, with the read error flag and the write error bitmask.
    /// Every destination must be the same length as `from`.
    pub fn copy<F>(&self, from: Region, dests: &[Region], flags: CopyFlags,
                   notify: F) -> Result<()>
        where F: FnOnce(bool, u32) + Send + 'static
    {
        self.admit(from.count, dests)?;
        self.issue(Some(from), dests.to_vec(), flags, Box::new(notify));
        Ok(())
    }

    /// Wait for all outstanding jobs to complete, then shut down.
    pub async fn destroy(self) {
        loop {
            let idle = self.inner.destroyq.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.inner.nr_jobs.load(Ordering::Acquire) == 0 {
                break;
            }
            idle.await;
        }
        self.inner.wq.flush().await;
        let queues = self.inner.queues.lock().unwrap();
        debug_assert!(queues.complete.is_empty());
        debug_assert!(queues.pages.is_empty());
        debug_assert!(queues.io.is_empty());
    }

    fn issue(&self, source: Option<Region>, dests: Vec<Region>,
             flags: CopyFlags, notify: NotifyFn)
    {
        let count = dests[0].count;
        if count <= SUB_JOB_SIZE {
            let job = Job::new(source, dests, flags, Notify::Caller(notify));
            self.inner.dispatch_job(job);
        } else {
            let split = Split::new(source, dests, count, flags, notify);
            self.inner.split_job(split);
        }
    }

    /// Create a new engine.  Must be called from within a tokio runtime.
    pub fn new(io: Arc<dyn CopyIo>, config: KcopydConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<Inner>| {
            let weak = weak.clone();
            let work = Work::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.do_work();
                }
            });
            Inner {
                queues: Mutex::default(),
                pool: PagePool::new(config.nr_pages),
                io,
                wq: Workqueue::new("kcopyd"),
                work,
                nr_jobs: AtomicUsize::new(0),
                destroyq: WaitQueue::new(),
                caller_jobs: AtomicUsize::new(0),
                max_jobs: config.max_jobs,
            }
        });
        Kcopyd { inner }
    }

    /// Number of jobs in flight, including the parents of split jobs
    pub fn nr_jobs(&self) -> usize {
        self.inner.nr_jobs.load(Ordering::Acquire)
    }

    /// Number of buffer pages not currently lent to a job
    pub fn nr_free_pages(&self) -> usize {
        self.inner.pool.nr_free()
    }

    /// Change the size of the buffer pool.  Only allowed while idle.
    pub fn resize_pages(&self, nr_pages: usize) -> Result<()> {
        if self.nr_jobs() > 0 {
            return Err(Error::EBUSY);
        }
        self.inner.pool.resize(nr_pages)
    }

    /// Fill every region in `dests` with zeros.
    ///
    /// Like [`copy`](Self::copy), but there is no source to read.  Every
    /// destination must be the same length.
    pub fn zero<F>(&self, dests: &[Region], flags: CopyFlags, notify: F)
        -> Result<()>
        where F: FnOnce(bool, u32) + Send + 'static
    {
        let count = dests.first().ok_or(Error::EINVAL)?.count;
        self.admit(count, dests)?;
        self.issue(None, dests.to_vec(), flags, Box::new(notify));
        Ok(())
    }
}

// LCOV_EXCL_STOP
