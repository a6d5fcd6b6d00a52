// vim: tw=80
//! Copy jobs and the bookkeeping for jobs that get split into segments

use std::{
    fmt,
    sync::{Mutex, atomic::AtomicU32}
};

use crate::{
    io::Direction,
    page_pool::Page,
    types::*,
};

use super::CopyFlags;

/// Completion callback supplied by the caller of `copy` or `zero`.
///
/// Arguments are the read error flag and the write error bitmask, which has
/// one bit per destination region.
pub type NotifyFn = Box<dyn FnOnce(bool, u32) + Send>;

/// What to do when a job completes
pub(super) enum Notify {
    /// Report to whoever issued the copy
    Caller(NotifyFn),
    /// This job is one segment of a larger, split job
    Segment(std::sync::Arc<Split>),
}

/// One unit of copying that flows through the engine's queues.
pub(super) struct Job {
    pub flags: CopyFlags,
    pub read_err: bool,
    pub write_err: u32,
    /// Which phase of the copy comes next
    pub rw: Direction,
    /// Where to read from.  `None` for zeroing jobs.
    pub source: Option<Region>,
    pub dests: Vec<Region>,
    pub pages: Vec<Page>,
    pub notify: Notify,
}

impl Job {
    pub fn new(
        source: Option<Region>,
        dests: Vec<Region>,
        flags: CopyFlags,
        notify: Notify
    ) -> Self
    {
        let rw = if source.is_some() {
            Direction::Read
        } else {
            Direction::Write
        };
        Job {
            flags,
            read_err: false,
            write_err: 0,
            rw,
            source,
            dests,
            pages: Vec::new(),
            notify
        }
    }

    /// Number of sectors that this job transfers
    pub fn count(&self) -> SectorT {
        match &self.source {
            Some(r) => r.count,
            None => self.dests[0].count
        }
    }

    /// Has the job failed in a way that should stop further processing?
    pub fn is_failed(&self) -> bool {
        (self.read_err || self.write_err != 0) && !self.flags.ignore_errors
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("rw", &self.rw)
            .field("source", &self.source)
            .field("dests", &self.dests)
            .field("read_err", &self.read_err)
            .field("write_err", &self.write_err)
            .field("pages", &self.pages.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub(super) struct Progress {
    pub read_err: bool,
    pub write_err: u32,
    /// Sectors already handed out to segments
    pub progress: SectorT,
}

/// The parent of a split job.  It owns no pages.  Its segments walk through
/// the range one chunk at a time, and it completes when the last of its
/// segments does.
pub(super) struct Split {
    pub flags: CopyFlags,
    pub source: Option<Region>,
    pub dests: Vec<Region>,
    pub count: SectorT,
    pub state: Mutex<Progress>,
    /// Segment chains that haven't yet run out of work
    pub sub_jobs: AtomicU32,
    pub notify: Mutex<Option<NotifyFn>>,
}

impl Split {
    pub fn new(
        source: Option<Region>,
        dests: Vec<Region>,
        count: SectorT,
        flags: CopyFlags,
        notify: NotifyFn
    ) -> Self
    {
        Split {
            flags,
            source,
            dests,
            count,
            state: Mutex::new(Progress::default()),
            sub_jobs: AtomicU32::new(0),
            notify: Mutex::new(Some(notify))
        }
    }

    /// Merge a segment's errors and claim the next chunk, if there is one
    /// and no unignorable error has occurred.
    ///
    /// Returns the chunk's offset and length.
    pub fn advance(&self, read_err: bool, write_err: u32, chunk: SectorT)
        -> Option<(SectorT, SectorT)>
    {
        let mut state = self.state.lock().unwrap();
        state.read_err |= read_err;
        state.write_err |= write_err;
        let failed = state.read_err || state.write_err != 0;
        if failed && !self.flags.ignore_errors {
            return None;
        }
        let remaining = self.count - state.progress;
        if remaining == 0 {
            return None;
        }
        let count = remaining.min(chunk);
        let offset = state.progress;
        state.progress += count;
        Some((offset, count))
    }

    /// Build the job for one chunk of the range
    pub fn segment(&self, this: std::sync::Arc<Split>, offset: SectorT,
                   count: SectorT) -> Job
    {
        let source = self.source.as_ref().map(|r| r.slice(offset, count));
        let dests = self.dests.iter()
            .map(|r| r.slice(offset, count))
            .collect();
        Job::new(source, dests, self.flags, Notify::Segment(this))
    }

    /// Build the job that reports the split job's final status
    pub fn finish(&self) -> Job {
        let state = self.state.lock().unwrap();
        let notify = self.notify.lock().unwrap().take()
            .expect("split job completed twice");
        let mut job = Job::new(self.source.clone(), self.dests.clone(),
            self.flags, Notify::Caller(notify));
        job.read_err = state.read_err;
        job.write_err = state.write_err;
        job
    }
}

// LCOV_EXCL_STOP
