// vim: tw=80
//! Multipath I/O routing
//!
//! A [`Multipath`] presents several paths to the same storage as a single
//! device.  Paths are arranged into priority groups.  I/O flows down one group
//! at a time, spread across that group's paths by the group's
//! [`PathSelector`].  When a path fails the router moves to another path of
//! the same group, and only when the group has no usable paths left does it
//! move on to another group.
//!
//! Some storage arrays must be told before a group's paths can be used.  If a
//! [`HwHandler`] is configured, every group switch queues I/O until the
//! handler has activated the new group's paths.
//!
//! Background work happens on two [`Workqueue`]s: `kmultipathd` redrives
//! queued I/O and delivers events, and `kmpath_handlerd` activates paths.

use std::{
    collections::VecDeque,
    fmt,
    mem,
    sync::{Arc, Mutex, Weak},
    time::Duration
};

use thiserror::Error;
use tokio::sync::{Notify, broadcast, watch};

use crate::{
    hw_handler::{ActivateStatus, ErrorAction, HwHandler},
    io::{Dispatcher, IoContext, Request},
    path_selector::{PathSelector, StatusKind},
    registry::Registry,
    table::{Features, GroupSpec, HwSpec, PathSpec, Table, TableError},
    types::*,
    workqueue::{Work, Workqueue},
};


/// Depth of the path event channel.  Slow subscribers miss old events.
const PATH_EVENT_CAPACITY: usize = 64;

/// Identifies one path of a [`Multipath`]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PathId {
    pg: usize,
    path: usize,
}

impl PathId {
    /// 1-based number of the path's priority group
    pub fn group(self) -> u32 {
        self.pg as u32 + 1
    }

    /// Position of the path within its group
    pub fn index(self) -> usize {
        self.path
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group(), self.path)
    }
}

/// What the router is doing with new I/O
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// I/O flows straight to the current path
    Idle,
    /// I/O is held until the current group has been activated
    Queueing,
    /// Like `Queueing`, and activations are in flight
    ActivatingGroup,
}

/// Result of [`Multipath::map`]
#[derive(Debug, Eq, PartialEq)]
pub enum MapOutcome {
    /// The request has been bound to a path.  The caller must submit it, and
    /// report its completion to [`Multipath::end_io`] along with the context.
    Forwarded(Request, IoContext),
    /// The router now owns the request and will redrive it later
    Queued,
    /// No path is available
    Failed(Request, Error),
    /// No path is available right now.  The caller should retry later
    /// without reporting an error.
    Requeue(Request),
}

/// Result of [`Multipath::end_io`]
#[derive(Debug, Eq, PartialEq)]
pub enum EndIo {
    /// The request is finished, successfully or not
    Done(Request, Result<()>),
    /// The caller should retry later without reporting an error
    Requeue(Request),
    /// The router has taken the request back and will redrive it
    Incomplete,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathEventKind {
    Failed,
    Reinstated,
}

/// Sent whenever a path fails or is reinstated
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathEvent {
    pub kind: PathEventKind,
    pub dev: DevId,
    /// Number of usable paths, after the change
    pub nr_valid_paths: u32,
}

/// A snapshot of one path's state
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathInfo {
    pub dev: DevId,
    pub is_active: bool,
    pub fail_count: u64,
}

/// Reasons an administrative message may be rejected
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MessageError {
    #[error("Unrecognised multipath message received")]
    Unrecognised,
    #[error("invalid PG number")]
    InvalidPg,
    #[error("no path uses device {0}")]
    NoDevice(String),
    #[error(transparent)]
    Errno(#[from] Error),
}

struct PgPath {
    dev: DevId,
    is_active: bool,
    fail_count: u64,
    /// Asks the hardware handler to activate this path
    activate: Arc<Work>,
}

struct PriorityGroup {
    selector: Box<dyn PathSelector>,
    bypassed: bool,
    paths: Vec<PgPath>,
}

struct State {
    pgs: Vec<PriorityGroup>,
    has_hw_handler: bool,
    nr_valid_paths: u32,

    current_path: Option<PathId>,
    current_pg: Option<usize>,
    /// Group to switch to at the next path selection
    next_pg: Option<usize>,
    /// I/Os remaining before asking the selector again
    repeat_count: u32,

    phase: Phase,
    queue_if_no_path: bool,
    saved_queue_if_no_path: bool,
    noflush_suspending: bool,
    suspended: bool,

    pg_init_required: bool,
    pg_init_delay_retry: bool,
    pg_init_in_progress: u32,
    pg_init_count: u32,
    pg_init_retries: u32,
    pg_init_delay_msecs: u32,

    queued_ios: VecDeque<Request>,
    /// Queued requests, including any that the redrive worker has taken off
    /// of `queued_ios` but not yet remapped.
    queue_size: usize,
}

impl State {
    fn choose_path_in_pg(&mut self, pg: usize, nr_bytes: usize) -> bool {
        let Some(path) = self.pgs[pg].selector
            .select_path(&mut self.repeat_count, nr_bytes)
        else {
            return false;
        };
        debug_assert!(self.pgs[pg].paths[path].is_active);
        self.current_path = Some(PathId { pg, path });
        if self.current_pg != Some(pg) {
            self.switch_pg(pg);
        }
        true
    }

    fn choose_pgpath(&mut self, nr_bytes: usize) {
        if self.nr_valid_paths > 0 {
            if let Some(pg) = self.next_pg.take() {
                if self.choose_path_in_pg(pg, nr_bytes) {
                    return;
                }
            }
            // Don't change groups until this one has no usable paths left
            if let Some(pg) = self.current_pg {
                if self.choose_path_in_pg(pg, nr_bytes) {
                    return;
                }
            }
            // First try the groups that aren't bypassed, then the ones that
            // are.
            for bypassed in [false, true] {
                for pg in 0..self.pgs.len() {
                    if self.pgs[pg].bypassed != bypassed {
                        continue;
                    }
                    if self.choose_path_in_pg(pg, nr_bytes) {
                        if bypassed {
                            self.pg_init_delay_retry = true;
                        }
                        return;
                    }
                }
            }
        }
        self.current_path = None;
        self.current_pg = None;
    }

    /// Should I/O be retried later, rather than failed?
    fn must_push_back(&self) -> bool {
        self.queue_if_no_path != self.saved_queue_if_no_path &&
            self.noflush_suspending
    }

    fn pg_index(&self, group: u32) -> Result<usize> {
        if group == 0 || group as usize > self.pgs.len() {
            Err(Error::EINVAL)
        } else {
            Ok(group as usize - 1)
        }
    }

    /// Number of the group that the next I/O will probably use
    fn pg_num(&self) -> u32 {
        match (self.next_pg, self.current_pg) {
            (Some(pg), _) | (None, Some(pg)) => pg as u32 + 1,
            (None, None) => u32::from(!self.pgs.is_empty())
        }
    }

    fn queue_io(&self) -> bool {
        self.phase != Phase::Idle
    }

    fn set_queue_io(&mut self, queue_io: bool) {
        self.phase = match (queue_io, self.pg_init_in_progress) {
            (false, _) => Phase::Idle,
            (true, 0) => Phase::Queueing,
            (true, _) => Phase::ActivatingGroup,
        };
    }

    fn switch_pg(&mut self, pg: usize) {
        self.current_pg = Some(pg);
        // Must we activate the group first, and queue I/O till it's ready?
        self.pg_init_required = self.has_hw_handler;
        self.set_queue_io(self.has_hw_handler);
        self.pg_init_count = 0;
        tracing::debug!(group = pg + 1, "switching priority group");
    }

    fn update_phase(&mut self) {
        self.set_queue_io(self.queue_io());
    }
}

struct Shared {
    state: Mutex<State>,
    hw_handler: Option<Arc<dyn HwHandler>>,
    hw_spec: Option<HwSpec>,
    dispatcher: Arc<dyn Dispatcher>,
    kmultipathd: Workqueue,
    kmpath_handlerd: Workqueue,
    process_queued_ios: Arc<Work>,
    trigger_event: Arc<Work>,
    events: watch::Sender<u64>,
    path_events: broadcast::Sender<PathEvent>,
    /// Signalled whenever the last in-flight activation finishes
    pg_init_wait: Notify,
}

impl Shared {
    fn activate_path(self: &Arc<Self>, id: PathId) {
        let dev = self.state.lock().unwrap().pgs[id.pg].paths[id.path]
            .dev.clone();
        match &self.hw_handler {
            Some(hwh) => {
                let shared = self.clone();
                hwh.activate(&dev, Box::new(move |status| {
                    shared.pg_init_done(id, status)
                }));
            }
            None => self.pg_init_done(id, ActivateStatus::Ok)
        }
    }

    fn bypass_pg(&self, pg: usize, bypassed: bool) {
        {
            let mut st = self.state.lock().unwrap();
            st.pgs[pg].bypassed = bypassed;
            st.current_path = None;
            st.current_pg = None;
        }
        self.kmultipathd.queue(&self.trigger_event);
    }

    fn dispatch_queued_ios(&self) {
        let queued = mem::take(&mut self.state.lock().unwrap().queued_ios);
        for req in queued {
            match self.map_io(req, true) {
                MapOutcome::Forwarded(req, ctx) =>
                    self.dispatcher.submit(req, ctx),
                MapOutcome::Queued => (),
                MapOutcome::Failed(req, e) =>
                    self.dispatcher.complete(req, Err(e)),
                MapOutcome::Requeue(req) =>
                    self.dispatcher.complete(req, Err(Error::EAGAIN)),
            }
        }
    }

    fn do_end_io(&self, mut req: Request, error: Error, ctx: &IoContext)
        -> EndIo
    {
        if (error == Error::EAGAIN && req.read_ahead) || error.is_final() {
            return EndIo::Done(req, Err(error));
        }

        let no_paths = {
            let st = self.state.lock().unwrap();
            if st.nr_valid_paths == 0 {
                if st.must_push_back() {
                    return EndIo::Requeue(req);
                } else if !st.queue_if_no_path {
                    return EndIo::Done(req, Err(Error::EIO));
                }
                true
            } else {
                false
            }
        };

        // Without the path, there's nothing to blame
        if let (false, Some(id)) = (no_paths, ctx.path) {
            let action = self.hw_handler.as_ref()
                .map_or(ErrorAction::FailPath,
                        |hwh| hwh.classify_error(&req, error));
            tracing::debug!(path = %id, ?error, ?action, "I/O error");
            match action {
                ErrorAction::None => (),
                ErrorAction::FailPath => {
                    let _ = self.fail_path(id);
                }
                ErrorAction::BypassGroup => self.bypass_pg(id.pg, true),
                ErrorAction::HardError => return EndIo::Done(req, Err(error)),
            }
        }

        req.restore(&ctx.details);
        let mut st = self.state.lock().unwrap();
        st.queued_ios.push_back(req);
        st.queue_size += 1;
        if !st.queue_io() {
            self.kmultipathd.queue(&self.process_queued_ios);
        }
        EndIo::Incomplete
    }

    fn end_io(&self, req: Request, result: Result<()>, ctx: IoContext)
        -> EndIo
    {
        let r = match result {
            Ok(()) => EndIo::Done(req, Ok(())),
            Err(e) => self.do_end_io(req, e, &ctx)
        };
        if let Some(id) = ctx.path {
            self.state.lock().unwrap().pgs[id.pg].selector
                .end_io(id.path, ctx.nr_bytes);
        }
        r
    }

    fn fail_path(&self, id: PathId) -> Result<()> {
        let (dev, nr_valid_paths) = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            let pg = st.pgs.get_mut(id.pg).ok_or(Error::ENOENT)?;
            let path = pg.paths.get_mut(id.path).ok_or(Error::ENOENT)?;
            if !path.is_active {
                return Err(Error::EALREADY);
            }
            tracing::warn!(dev = %path.dev, "Failing path");
            pg.selector.fail_path(id.path);
            path.is_active = false;
            path.fail_count += 1;
            let dev = path.dev.clone();
            st.nr_valid_paths -= 1;
            if st.current_path == Some(id) {
                st.current_path = None;
            }
            (dev, st.nr_valid_paths)
        };
        self.path_event(PathEventKind::Failed, dev, nr_valid_paths);
        Ok(())
    }

    /// Wait for background work to finish, including any that it queues.
    async fn flush_work(&self) {
        loop {
            self.kmpath_handlerd.flush().await;
            self.wait_for_pg_init_completion().await;
            self.kmultipathd.flush().await;
            if self.kmpath_handlerd.is_idle() &&
                self.kmultipathd.is_idle() &&
                self.state.lock().unwrap().pg_init_in_progress == 0
            {
                break;
            }
        }
    }

    fn map_io(&self, mut req: Request, was_queued: bool) -> MapOutcome {
        let mut ctx = IoContext::new(&req);
        let mut st = self.state.lock().unwrap();

        // Do we need to select a new path?
        let reselect = st.current_path.is_none() || (!st.queue_io() &&
            st.repeat_count > 0 && {
                st.repeat_count -= 1;
                st.repeat_count == 0
            });
        if reselect {
            st.choose_pgpath(req.nr_bytes);
        }
        let path = st.current_path;

        if was_queued {
            st.queue_size -= 1;
        }

        if (path.is_some() && st.queue_io()) ||
            (path.is_none() && st.queue_if_no_path)
        {
            // Queue for the daemon to resubmit
            st.queued_ios.push_back(req);
            st.queue_size += 1;
            if (st.pg_init_required && st.pg_init_in_progress == 0) ||
                !st.queue_io()
            {
                self.kmultipathd.queue(&self.process_queued_ios);
            }
            return MapOutcome::Queued;
        }

        match path {
            Some(id) => {
                let pg = &mut st.pgs[id.pg];
                req.bind(pg.paths[id.path].dev.clone());
                pg.selector.start_io(id.path, ctx.nr_bytes);
                ctx.path = Some(id);
                MapOutcome::Forwarded(req, ctx)
            }
            None if st.must_push_back() => MapOutcome::Requeue(req),
            None => MapOutcome::Failed(req, Error::EIO)
        }
    }

    fn path_event(&self, kind: PathEventKind, dev: DevId, nr_valid_paths: u32)
    {
        // It's not an error for nobody to be listening
        let _ = self.path_events.send(PathEvent { kind, dev, nr_valid_paths });
        self.kmultipathd.queue(&self.trigger_event);
    }

    /// Queue activation of every usable path in the group
    fn pg_init_all_paths(&self, st: &mut State, pg: usize) {
        st.pg_init_count += 1;
        st.pg_init_required = false;
        let delay = if st.pg_init_delay_retry {
            Duration::from_millis(st.pg_init_delay_msecs.into())
        } else {
            Duration::ZERO
        };
        let mut started = 0;
        for p in st.pgs[pg].paths.iter().filter(|p| p.is_active) {
            if self.kmpath_handlerd.queue_delayed(&p.activate, delay) {
                started += 1;
            }
        }
        st.pg_init_in_progress += started;
        st.update_phase();
        tracing::debug!(group = pg + 1, started, ?delay, "activating group");
    }

    /// Called by the hardware handler when it's done activating a path.
    fn pg_init_done(&self, id: PathId, status: ActivateStatus) {
        let bypassed = self.state.lock().unwrap().pgs[id.pg].bypassed;
        let status = if status.is_error() && bypassed {
            // Don't leave a failed, bypassed group half-initialized
            ActivateStatus::FailPath
        } else {
            status
        };

        let mut delay_retry = false;
        let errors = match status {
            ActivateStatus::Ok => false,
            ActivateStatus::Retry { delay } => {
                delay_retry = delay;
                let limit_reached = {
                    let mut st = self.state.lock().unwrap();
                    if st.pg_init_count <= st.pg_init_retries {
                        st.pg_init_required = true;
                        false
                    } else {
                        true
                    }
                };
                if limit_reached {
                    tracing::error!(path = %id, "pg_init retries exhausted");
                    let _ = self.fail_path(id);
                }
                false
            }
            ActivateStatus::BypassGroup => {
                // Probably doing something like a firmware upgrade on the
                // controller.  Try another group.
                self.bypass_pg(id.pg, true);
                true
            }
            ActivateStatus::FailPath | ActivateStatus::Error => {
                tracing::error!(path = %id, ?status, "Could not failover path");
                let _ = self.fail_path(id);
                true
            }
        };

        let mut st = self.state.lock().unwrap();
        if errors {
            st.current_path = None;
            st.current_pg = None;
        } else if !st.pg_init_required {
            st.pgs[id.pg].bypassed = false;
        }

        debug_assert!(st.pg_init_in_progress > 0);
        st.pg_init_in_progress = st.pg_init_in_progress.saturating_sub(1);
        if st.pg_init_in_progress > 0 {
            // Activations of other paths are still ongoing
            st.update_phase();
            return;
        }
        let queue_io = st.pg_init_required && st.queue_io();
        st.set_queue_io(queue_io);
        st.pg_init_delay_retry = delay_retry;
        self.kmultipathd.queue(&self.process_queued_ios);
        self.pg_init_wait.notify_waiters();
    }

    fn process_queued_ios(&self) {
        let must_queue = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            if st.queue_size == 0 {
                return;
            }
            if st.current_path.is_none() {
                st.choose_pgpath(0);
            }
            let path = st.current_path;
            let must_queue = !((path.is_some() && !st.queue_io()) ||
                (path.is_none() && !st.queue_if_no_path));
            if let Some(id) = path {
                if st.pg_init_required && st.pg_init_in_progress == 0 {
                    self.pg_init_all_paths(st, id.pg);
                }
            }
            must_queue
        };
        if !must_queue {
            self.dispatch_queued_ios();
        }
    }

    fn queue_if_no_path(&self, queue_if_no_path: bool, save_old: bool) {
        let mut st = self.state.lock().unwrap();
        st.saved_queue_if_no_path = if save_old {
            st.queue_if_no_path
        } else {
            queue_if_no_path
        };
        st.queue_if_no_path = queue_if_no_path;
        if !queue_if_no_path && st.queue_size > 0 {
            self.kmultipathd.queue(&self.process_queued_ios);
        }
    }

    fn reinstate_path(&self, id: PathId) -> Result<()> {
        let (dev, nr_valid_paths) = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            let pg = st.pgs.get_mut(id.pg).ok_or(Error::ENOENT)?;
            let path = pg.paths.get_mut(id.path).ok_or(Error::ENOENT)?;
            if path.is_active {
                return Err(Error::EALREADY);
            }
            if let Err(e) = pg.selector.reinstate_path(id.path) {
                tracing::warn!(dev = %path.dev, selector = pg.selector.name(),
                    "Reinstate path not supported by path selector");
                return Err(e);
            }
            path.is_active = true;
            let dev = path.dev.clone();
            let activate = path.activate.clone();
            st.nr_valid_paths += 1;
            if st.nr_valid_paths == 1 && st.queue_size > 0 {
                st.current_path = None;
                self.kmultipathd.queue(&self.process_queued_ios);
            } else if st.has_hw_handler && st.current_pg == Some(id.pg) &&
                self.kmpath_handlerd.queue(&activate)
            {
                st.pg_init_in_progress += 1;
                st.update_phase();
            }
            (dev, st.nr_valid_paths)
        };
        tracing::info!(%dev, "Reinstated path");
        self.path_event(PathEventKind::Reinstated, dev, nr_valid_paths);
        Ok(())
    }

    fn trigger_event(&self) {
        self.events.send_modify(|n| *n = n.wrapping_add(1));
    }

    async fn wait_for_pg_init_completion(&self) {
        loop {
            let done = self.pg_init_wait.notified();
            tokio::pin!(done);
            done.as_mut().enable();
            if self.state.lock().unwrap().pg_init_in_progress == 0 {
                break;
            }
            done.await;
        }
    }
}

fn parse_group(s: &str) -> std::result::Result<u32, MessageError> {
    s.parse::<u32>().map_err(|_| MessageError::InvalidPg)
}

/// A multipath device
pub struct Multipath {
    shared: Arc<Shared>,
}

impl Multipath {
    /// Apply `f` to every path that uses the device named `dev`
    fn action_dev<F>(&self, dev: &str, f: F)
        -> std::result::Result<(), MessageError>
        where F: Fn(&Self, PathId) -> Result<()>
    {
        let paths = self.paths_by_dev(dev);
        if paths.is_empty() {
            return Err(MessageError::NoDevice(dev.to_owned()));
        }
        for id in paths {
            match f(self, id) {
                Ok(()) | Err(Error::EALREADY) => (),
                Err(e) => return Err(e.into())
            }
        }
        Ok(())
    }

    /// Tear down the router.
    ///
    /// Waits for all background work to finish.  Any I/O that is still
    /// queued afterwards gets failed.
    pub async fn destroy(self) {
        self.shared.flush_work().await;
        let queued = {
            let mut st = self.shared.state.lock().unwrap();
            st.queue_size = 0;
            mem::take(&mut st.queued_ios)
        };
        if !queued.is_empty() {
            tracing::warn!(n = queued.len(), "failing queued I/O at teardown");
        }
        for req in queued {
            self.shared.dispatcher.complete(req, Err(Error::EIO));
        }
    }

    /// Deprioritize a group.  It will only be used if no other group has a
    /// usable path.
    #[tracing::instrument(skip(self))]
    pub fn disable_group(&self, group: u32) -> Result<()> {
        let pg = self.shared.state.lock().unwrap().pg_index(group)?;
        self.shared.bypass_pg(pg, true);
        Ok(())
    }

    /// Undo [`disable_group`](Self::disable_group)
    #[tracing::instrument(skip(self))]
    pub fn enable_group(&self, group: u32) -> Result<()> {
        let pg = self.shared.state.lock().unwrap().pg_index(group)?;
        self.shared.bypass_pg(pg, false);
        Ok(())
    }

    /// Handle the completion of a request that [`map`](Self::map) forwarded.
    pub fn end_io(&self, req: Request, result: Result<()>, ctx: IoContext)
        -> EndIo
    {
        self.shared.end_io(req, result, ctx)
    }

    /// Stop using a path.
    ///
    /// Returns `EALREADY` if it was already failed.
    pub fn fail_path(&self, path: PathId) -> Result<()> {
        self.shared.fail_path(path)
    }

    /// Wait until all background work, and any work that it spawns, has
    /// finished.
    pub async fn flush(&self) {
        self.shared.flush_work().await
    }

    /// Route a new request
    pub fn map(&self, req: Request) -> MapOutcome {
        self.shared.map_io(req, false)
    }

    /// Handle an administrative message, such as `fail_path sda` or
    /// `switch_group 2`.
    #[tracing::instrument(skip(self))]
    pub fn message(&self, msg: &str) -> std::result::Result<(), MessageError>
    {
        if self.shared.state.lock().unwrap().suspended {
            return Err(Error::EBUSY.into());
        }
        let argv = msg.split_whitespace().collect::<Vec<_>>();
        let r = match argv.as_slice() {
            ["queue_if_no_path"] => {
                self.queue_if_no_path(true, false);
                Ok(())
            }
            ["fail_if_no_path"] => {
                self.queue_if_no_path(false, false);
                Ok(())
            }
            ["disable_group", n] => self.disable_group(parse_group(n)?),
            ["enable_group", n] => self.enable_group(parse_group(n)?),
            ["switch_group", n] => self.switch_group(parse_group(n)?),
            ["reinstate_path", dev] =>
                return self.action_dev(dev, Self::reinstate_path),
            ["fail_path", dev] => return self.action_dev(dev, Self::fail_path),
            _ => {
                tracing::warn!("Unrecognised multipath message received");
                return Err(MessageError::Unrecognised);
            }
        };
        r.map_err(|_| MessageError::InvalidPg)
    }

    /// Create a new router from its table.
    ///
    /// Must be called from within a tokio runtime.  Nothing is created
    /// unless the whole table is valid.
    pub fn new(
        table: &Table,
        registry: &Registry,
        dispatcher: Arc<dyn Dispatcher>
    ) -> std::result::Result<Self, TableError>
    {
        let hw_handler = table.hw_handler.as_ref()
            .map(|hw| registry.hw_handler(&hw.name, &hw.args))
            .transpose()?;
        let mut groups = Vec::with_capacity(table.groups.len());
        for g in table.groups.iter() {
            let mut selector = registry.selector(&g.selector,
                                                 &g.selector_args)?;
            for (i, p) in g.paths.iter().enumerate() {
                selector.add_path(i, &p.args)?;
            }
            groups.push((selector, g));
        }
        let Features {
            queue_if_no_path, pg_init_retries, pg_init_delay_msecs
        } = table.features;
        let (events, _) = watch::channel(0);
        let (path_events, _) = broadcast::channel(PATH_EVENT_CAPACITY);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let pgs = groups.into_iter()
                .enumerate()
                .map(|(pg, (selector, spec))| {
                    let paths = spec.paths.iter()
                        .enumerate()
                        .map(|(path, p)| {
                            let id = PathId { pg, path };
                            let weak = weak.clone();
                            let activate = Work::new(move || {
                                if let Some(shared) = weak.upgrade() {
                                    shared.activate_path(id);
                                }
                            });
                            PgPath {
                                dev: p.dev.clone(),
                                is_active: true,
                                fail_count: 0,
                                activate
                            }
                        }).collect();
                    PriorityGroup { selector, bypassed: false, paths }
                }).collect();
            let w = weak.clone();
            let process_queued_ios = Work::new(move || {
                if let Some(shared) = w.upgrade() {
                    shared.process_queued_ios();
                }
            });
            let w = weak.clone();
            let trigger_event = Work::new(move || {
                if let Some(shared) = w.upgrade() {
                    shared.trigger_event();
                }
            });
            let state = State {
                pgs,
                has_hw_handler: hw_handler.is_some(),
                nr_valid_paths: table.nr_paths() as u32,
                current_path: None,
                current_pg: None,
                next_pg: table.initial_group.checked_sub(1)
                    .map(|n| n as usize),
                repeat_count: 0,
                phase: Phase::Idle,
                queue_if_no_path,
                saved_queue_if_no_path: queue_if_no_path,
                noflush_suspending: false,
                suspended: false,
                pg_init_required: false,
                pg_init_delay_retry: false,
                pg_init_in_progress: 0,
                pg_init_count: 0,
                pg_init_retries,
                pg_init_delay_msecs,
                queued_ios: VecDeque::new(),
                queue_size: 0,
            };
            Shared {
                state: Mutex::new(state),
                hw_handler,
                hw_spec: table.hw_handler.clone(),
                dispatcher,
                kmultipathd: Workqueue::new("kmultipathd"),
                kmpath_handlerd: Workqueue::new("kmpath_handlerd"),
                process_queued_ios,
                trigger_event,
                events,
                path_events,
                pg_init_wait: Notify::new(),
            }
        });
        Ok(Multipath { shared })
    }

    /// Subscribe to path failures and reinstatements
    pub fn path_events(&self) -> broadcast::Receiver<PathEvent> {
        self.shared.path_events.subscribe()
    }

    /// Stop the device.  Queued I/O is no longer held for want of a path.
    pub fn presuspend(&self) {
        self.shared.queue_if_no_path(false, true);
    }

    /// Finish stopping the device: wait for all background work.
    pub async fn postsuspend(&self) {
        self.shared.state.lock().unwrap().suspended = true;
        self.shared.flush_work().await;
    }

    /// Set whether requests may queue when no path is usable.
    ///
    /// If `save_old` is set, the previous setting is remembered so that
    /// [`resume`](Self::resume) can restore it.
    #[tracing::instrument(skip(self))]
    pub fn queue_if_no_path(&self, queue_if_no_path: bool, save_old: bool) {
        self.shared.queue_if_no_path(queue_if_no_path, save_old)
    }

    /// Make a failed path usable again.
    ///
    /// Returns `EALREADY` if it was already usable, or `EOPNOTSUPP` if its
    /// group's selector can't reinstate paths.
    pub fn reinstate_path(&self, path: PathId) -> Result<()> {
        self.shared.reinstate_path(path)
    }

    /// Restart the device after a suspension
    pub fn resume(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.suspended = false;
        st.queue_if_no_path = st.saved_queue_if_no_path;
    }

    /// Tell the router whether it's being suspended without flushing I/O.
    ///
    /// While that's going on, requests that can't be mapped are requeued
    /// instead of failed.
    pub fn set_noflush_suspending(&self, noflush: bool) {
        self.shared.state.lock().unwrap().noflush_suspending = noflush;
    }

    /// Report the router's state.
    ///
    /// The `Table` form can be parsed back into a [`Table`].
    pub fn status(&self, kind: StatusKind) -> String {
        let st = self.shared.state.lock().unwrap();
        match kind {
            StatusKind::Info => self.info_status(&st),
            StatusKind::Table => self.table_status(&st).to_string(),
        }
    }

    /// Subscribe to topology changes.
    ///
    /// The value is a counter.  Changes that happen in quick succession may
    /// be reported only once.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.events.subscribe()
    }

    /// Use the given group for the next I/O, and clear every group's
    /// bypassed flag.
    #[tracing::instrument(skip(self))]
    pub fn switch_group(&self, group: u32) -> Result<()> {
        {
            let mut st = self.shared.state.lock().unwrap();
            let pg = st.pg_index(group)?;
            for g in st.pgs.iter_mut() {
                g.bypassed = false;
            }
            st.current_path = None;
            st.current_pg = None;
            st.next_pg = Some(pg);
        }
        self.shared.kmultipathd.queue(&self.shared.trigger_event);
        Ok(())
    }

    fn info_status(&self, st: &State) -> String {
        let mut v = vec![
            "2".to_owned(),
            st.queue_size.to_string(),
            st.pg_init_count.to_string()
        ];
        let hw = self.shared.hw_handler.as_ref()
            .map(|hwh| hwh.status(StatusKind::Info))
            .unwrap_or_default();
        v.push(hw.len().to_string());
        v.extend(hw);
        v.push(st.pgs.len().to_string());
        v.push(st.pg_num().to_string());
        for (i, pg) in st.pgs.iter().enumerate() {
            let state = if pg.bypassed {
                "D"
            } else if st.current_pg == Some(i) {
                "A"
            } else {
                "E"
            };
            v.push(state.to_owned());
            let args = pg.selector.status(None, StatusKind::Info);
            v.push(args.len().to_string());
            v.extend(args);
            v.push(pg.paths.len().to_string());
            v.push(pg.selector.info_args().to_string());
            for (j, p) in pg.paths.iter().enumerate() {
                v.push(p.dev.to_string());
                v.push(if p.is_active { "A" } else { "F" }.to_owned());
                v.push(p.fail_count.to_string());
                v.extend(pg.selector.status(Some(j), StatusKind::Info));
            }
        }
        v.join(" ")
    }

    fn table_status(&self, st: &State) -> Table {
        let features = Features {
            queue_if_no_path: st.queue_if_no_path,
            pg_init_retries: st.pg_init_retries,
            pg_init_delay_msecs: st.pg_init_delay_msecs,
        };
        let groups = st.pgs.iter().map(|pg| {
            let paths = pg.paths.iter().enumerate().map(|(i, p)| PathSpec {
                dev: p.dev.clone(),
                args: pg.selector.status(Some(i), StatusKind::Table)
            }).collect();
            GroupSpec {
                selector: pg.selector.name().to_owned(),
                selector_args: pg.selector.status(None, StatusKind::Table),
                nr_path_args: pg.selector.table_args(),
                paths
            }
        }).collect();
        Table {
            features,
            hw_handler: self.shared.hw_spec.clone(),
            initial_group: st.pg_num(),
            groups
        }
    }

    /// The path that the next I/O will probably use
    pub fn current_path(&self) -> Option<PathId> {
        self.shared.state.lock().unwrap().current_path
    }

    /// 1-based number of the active group
    pub fn current_group(&self) -> Option<u32> {
        self.shared.state.lock().unwrap().current_pg.map(|pg| pg as u32 + 1)
    }

    /// Is the given group bypassed?  `None` if there's no such group.
    pub fn is_bypassed(&self, group: u32) -> Option<bool> {
        let st = self.shared.state.lock().unwrap();
        let pg = st.pg_index(group).ok()?;
        Some(st.pgs[pg].bypassed)
    }

    pub fn nr_valid_paths(&self) -> u32 {
        self.shared.state.lock().unwrap().nr_valid_paths
    }

    /// Number of activations started since the last group switch
    pub fn pg_init_count(&self) -> u32 {
        self.shared.state.lock().unwrap().pg_init_count
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().unwrap().phase
    }

    pub fn path_info(&self, id: PathId) -> Option<PathInfo> {
        let st = self.shared.state.lock().unwrap();
        let p = st.pgs.get(id.pg)?.paths.get(id.path)?;
        Some(PathInfo {
            dev: p.dev.clone(),
            is_active: p.is_active,
            fail_count: p.fail_count
        })
    }

    /// Every path, in table order
    pub fn paths(&self) -> Vec<PathId> {
        let st = self.shared.state.lock().unwrap();
        st.pgs.iter()
            .enumerate()
            .flat_map(|(pg, g)| {
                (0..g.paths.len()).map(move |path| PathId { pg, path })
            }).collect()
    }

    /// Every path that uses the device named `dev`
    pub fn paths_by_dev(&self, dev: &str) -> Vec<PathId> {
        let st = self.shared.state.lock().unwrap();
        st.pgs.iter()
            .enumerate()
            .flat_map(|(pg, g)| {
                g.paths.iter()
                    .enumerate()
                    .filter(|(_, p)| p.dev.as_str() == dev)
                    .map(move |(path, _)| PathId { pg, path })
            }).collect()
    }

    /// Number of requests held by the router
    pub fn queue_size(&self) -> usize {
        self.shared.state.lock().unwrap().queue_size
    }
}

impl fmt::Debug for Multipath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multipath")
            .field("status", &self.status(StatusKind::Info))
            .finish()
    }
}
