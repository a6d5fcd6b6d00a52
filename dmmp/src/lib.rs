// vim: tw=80
//! Failover scenarios for the multipath router
//!
//! A [`Scenario`] describes a multipath table and a sequence of steps: I/O,
//! device failures, administrative messages, and background copies.  A
//! [`Simulator`] plays it against RAM-backed devices and reports what
//! happened, one line per event.

use std::{io::Write, sync::Arc};

use dmmp_core::{
    io::{Direction, IoContext, Request},
    kcopyd::{CopyFlags, Kcopyd, KcopydConfig},
    memdev::{ChannelDispatcher, Dispatched, MemDevices},
    mpath::{EndIo, MapOutcome, Multipath},
    path_selector::StatusKind,
    registry::Registry,
    table::{Table, TableError},
    util::SECTORS_PER_PAGE,
};
pub use dmmp_core::{DevId, Error, Region, Result, SectorT};
use serde_derive::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Default size of each simulated device, in sectors
pub const DEFAULT_SECTORS: SectorT = 2048;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid scenario: {0}")]
    Scenario(#[from] serde_yaml_ng::Error),
    #[error("invalid table: {0}")]
    Table(#[from] TableError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Errno(#[from] Error),
}

/// A sector range, as written in a scenario file
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RegionSpec {
    pub dev: String,
    #[serde(default)]
    pub sector: SectorT,
    pub count: SectorT,
}

impl From<&RegionSpec> for Region {
    fn from(r: &RegionSpec) -> Self {
        Region::new(r.dev.as_str(), r.sector, r.count)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StatusArg {
    Info,
    Table,
}

impl From<StatusArg> for StatusKind {
    fn from(s: StatusArg) -> Self {
        match s {
            StatusArg::Info => StatusKind::Info,
            StatusArg::Table => StatusKind::Table,
        }
    }
}

/// One step of a scenario
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Issue this many reads through the router
    Io(u64),
    /// Make a device fail all I/O
    FailDevice(String),
    /// Make a device work again
    RestoreDevice(String),
    /// Send an administrative message to the router
    Message(String),
    /// Print the router's status
    Status(StatusArg),
    /// Copy one region to others in the background
    Copy {
        from: RegionSpec,
        to: Vec<RegionSpec>,
        #[serde(default)]
        ignore_errors: bool
    },
    /// Zero regions in the background
    Zero(Vec<RegionSpec>),
    /// Suspend the router and resume it again
    SuspendResume,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// The multipath table
    pub table: String,
    /// Size of every device, in sectors
    #[serde(default = "default_sectors")]
    pub sectors: SectorT,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_sectors() -> SectorT {
    DEFAULT_SECTORS
}

impl Scenario {
    pub fn from_yaml(s: &str) -> std::result::Result<Self, SimError> {
        Ok(serde_yaml_ng::from_str(s)?)
    }
}

/// Plays a [`Scenario`]
pub struct Simulator<W: Write> {
    devs: Arc<MemDevices>,
    mp: Multipath,
    kcopyd: Kcopyd,
    rx: mpsc::UnboundedReceiver<Dispatched>,
    next_id: u64,
    sectors: SectorT,
    out: W,
}

impl<W: Write> Simulator<W> {
    /// Create the devices and the router.  Must be called from within a
    /// tokio runtime.
    pub fn new(scenario: &Scenario, out: W)
        -> std::result::Result<Self, SimError>
    {
        if scenario.sectors < SECTORS_PER_PAGE {
            return Err(Error::EINVAL.into());
        }
        let table = scenario.table.parse::<Table>()?;
        let devs = Arc::new(MemDevices::default());
        for p in table.groups.iter().flat_map(|g| g.paths.iter()) {
            match devs.add(p.dev.clone(), scenario.sectors) {
                // Several paths may share a device
                Ok(()) | Err(Error::EEXIST) => (),
                Err(e) => return Err(e.into())
            }
        }
        let (dispatcher, rx) = ChannelDispatcher::new();
        let mp = Multipath::new(&table, &Registry::default(), dispatcher)?;
        let kcopyd = Kcopyd::new(devs.clone(), KcopydConfig::default());
        Ok(Simulator {
            devs,
            mp,
            kcopyd,
            rx,
            next_id: 0,
            sectors: scenario.sectors,
            out
        })
    }

    /// Report a request's completion
    fn complete(&mut self, req: &Request, result: Result<()>)
        -> std::io::Result<()>
    {
        Self::write_completion(&mut self.out, req, result)
    }

    fn write_completion(out: &mut W, req: &Request, result: Result<()>)
        -> std::io::Result<()>
    {
        match (result, req.dev()) {
            (Ok(()), Some(dev)) => writeln!(out, "io {}: {dev}", req.id),
            (Ok(()), None) => writeln!(out, "io {}: ok", req.id),
            (Err(e), _) => writeln!(out, "io {}: error {e:?}", req.id),
        }
    }

    async fn copy(&mut self, from: Option<&RegionSpec>, to: &[RegionSpec],
                  ignore_errors: bool) -> std::result::Result<(), SimError>
    {
        let dests = to.iter().map(Region::from).collect::<Vec<_>>();
        let flags = CopyFlags { ignore_errors };
        let (tx, rx) = oneshot::channel();
        let notify = move |read_err, write_err| {
            let _ = tx.send((read_err, write_err));
        };
        let verb = if from.is_some() { "copy" } else { "zero" };
        let r = match from {
            Some(from) => self.kcopyd.copy(from.into(), &dests, flags, notify),
            None => self.kcopyd.zero(&dests, flags, notify),
        };
        if let Err(e) = r {
            writeln!(self.out, "{verb}: error {e:?}")?;
            return Ok(());
        }
        let (read_err, write_err) = rx.await.map_err(|_| Error::EPIPE)?;
        if read_err || write_err != 0 {
            writeln!(self.out, "{verb}: read_err={read_err} \
                     write_err={write_err:#x}")?;
        } else {
            writeln!(self.out, "{verb}: ok")?;
        }
        Ok(())
    }

    /// Tear everything down, failing any I/O still queued in the router
    pub async fn finish(mut self) -> std::result::Result<W, SimError> {
        self.mp.destroy().await;
        self.kcopyd.destroy().await;
        while let Ok(d) = self.rx.try_recv() {
            if let Dispatched::Complete(req, result) = d {
                Self::write_completion(&mut self.out, &req, result)?;
            }
        }
        Ok(self.out)
    }

    fn issue(&mut self, req: Request, ctx: IoContext) -> std::io::Result<()> {
        let result = self.devs.execute(&req);
        match self.mp.end_io(req, result, ctx) {
            EndIo::Done(req, result) => self.complete(&req, result),
            EndIo::Requeue(req) =>
                writeln!(self.out, "io {}: requeued", req.id),
            // The router will redrive it
            EndIo::Incomplete => Ok(())
        }
    }

    async fn io(&mut self, n: u64) -> std::io::Result<()> {
        let slots = self.sectors / SECTORS_PER_PAGE;
        for _ in 0..n {
            let id = self.next_id;
            self.next_id += 1;
            let sector = (id % slots) * SECTORS_PER_PAGE;
            let req = Request::new(id, Direction::Read, sector, 4096);
            match self.mp.map(req) {
                MapOutcome::Forwarded(req, ctx) => self.issue(req, ctx)?,
                MapOutcome::Queued => writeln!(self.out, "io {id}: queued")?,
                MapOutcome::Failed(req, e) => self.complete(&req, Err(e))?,
                MapOutcome::Requeue(_) =>
                    writeln!(self.out, "io {id}: requeued")?,
            }
        }
        self.settle().await
    }

    /// Run the whole scenario
    pub async fn run(&mut self, steps: &[Step])
        -> std::result::Result<(), SimError>
    {
        for step in steps {
            self.step(step).await?;
        }
        Ok(())
    }

    /// Let the router's background work finish, and carry out whatever I/O
    /// it redrives.
    async fn settle(&mut self) -> std::io::Result<()> {
        loop {
            self.mp.flush().await;
            let mut progress = false;
            while let Ok(d) = self.rx.try_recv() {
                progress = true;
                match d {
                    Dispatched::Submit(req, ctx) => self.issue(req, ctx)?,
                    Dispatched::Complete(req, r) => self.complete(&req, r)?,
                }
            }
            if !progress {
                break Ok(());
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn step(&mut self, step: &Step)
        -> std::result::Result<(), SimError>
    {
        match step {
            Step::Io(n) => self.io(*n).await?,
            Step::FailDevice(dev) => {
                self.devs.set_failing(&DevId::new(dev), true)?;
            }
            Step::RestoreDevice(dev) => {
                self.devs.set_failing(&DevId::new(dev), false)?;
            }
            Step::Message(msg) => {
                match self.mp.message(msg) {
                    Ok(()) => writeln!(self.out, "message {msg}: ok")?,
                    Err(e) => writeln!(self.out, "message {msg}: {e}")?,
                }
                self.settle().await?;
            }
            Step::Status(kind) => {
                let status = self.mp.status((*kind).into());
                writeln!(self.out, "{status}")?;
            }
            Step::Copy { from, to, ignore_errors } => {
                self.copy(Some(from), to, *ignore_errors).await?;
            }
            Step::Zero(to) => self.copy(None, to, false).await?,
            Step::SuspendResume => {
                self.mp.presuspend();
                self.mp.postsuspend().await;
                self.mp.resume();
                self.settle().await?;
            }
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
