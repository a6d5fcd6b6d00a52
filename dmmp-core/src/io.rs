// vim: tw=80
//! Interfaces to the block I/O layer beneath dmmp
//!
//! dmmp doesn't perform any I/O itself.  The multipath router hands mapped
//! requests to a [`Dispatcher`], and the copy engine reads and writes through
//! a [`CopyIo`].

use std::{future::Future, pin::Pin};

#[cfg(test)] use mockall::automock;

use crate::{
    page_pool::Page,
    types::*,
};

/// Data direction of a request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// A block I/O request, as seen by the multipath router.
///
/// The router only inspects and rewrites the addressing fields.  The payload
/// is owned by whoever submitted the request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    /// Opaque identifier chosen by the submitter
    pub id: u64,
    pub dir: Direction,
    /// First sector of the transfer
    pub sector: SectorT,
    /// Transfer length in bytes
    pub nr_bytes: usize,
    /// Speculative read that the submitter would rather fail than wait for
    pub read_ahead: bool,
    /// The underlying device that the request has been bound to, if any
    dev: Option<DevId>,
}

impl Request {
    pub fn new(id: u64, dir: Direction, sector: SectorT, nr_bytes: usize)
        -> Self
    {
        Request { id, dir, sector, nr_bytes, read_ahead: false, dev: None }
    }

    pub fn read_ahead(mut self) -> Self {
        self.read_ahead = true;
        self
    }

    /// Direct the request at an underlying device
    pub fn bind(&mut self, dev: DevId) {
        self.dev = Some(dev);
    }

    /// The underlying device this request is bound to, if any.
    pub fn dev(&self) -> Option<&DevId> {
        self.dev.as_ref()
    }

    /// Save enough of the request to restore it for resubmission
    pub(crate) fn details(&self) -> RequestDetails {
        RequestDetails {
            sector: self.sector,
            nr_bytes: self.nr_bytes,
        }
    }

    /// Undo any changes that lower layers made while processing the request
    pub(crate) fn restore(&mut self, details: &RequestDetails) {
        self.sector = details.sector;
        self.nr_bytes = details.nr_bytes;
        self.dev = None;
    }
}

/// The fields of a [`Request`] that lower layers may modify
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RequestDetails {
    sector: SectorT,
    nr_bytes: usize,
}

/// The router's side of a request that has been forwarded.
///
/// The submitter must give it back, along with the request, to
/// [`Multipath::end_io`](crate::mpath::Multipath::end_io).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoContext {
    /// The path this request was forwarded down, if any.
    pub(crate) path: Option<crate::mpath::PathId>,
    pub(crate) nr_bytes: usize,
    pub(crate) details: RequestDetails,
}

impl IoContext {
    pub(crate) fn new(req: &Request) -> Self {
        IoContext {
            path: None,
            nr_bytes: req.nr_bytes,
            details: req.details(),
        }
    }

    pub fn path(&self) -> Option<crate::mpath::PathId> {
        self.path
    }
}

/// Sends mapped requests to the underlying devices.
///
/// The multipath router's background worker uses this to resubmit requests
/// that it had queued.
#[cfg_attr(test, automock)]
pub trait Dispatcher: Send + Sync {
    /// Submit a request that has been bound to a device.  Its completion must
    /// eventually be reported to `Multipath::end_io`.
    fn submit(&self, req: Request, ctx: IoContext);

    /// Complete a request back to its originator.
    fn complete(&self, req: Request, result: Result<()>);
}

/// Future returned by [`CopyIo`] methods.  It returns the buffers along with a
/// bitmask of failed regions.
pub type CopyIoFut = Pin<Box<dyn Future<Output = (Vec<Page>, u32)> + Send>>;

/// Reads and writes sector ranges for the copy engine.
pub trait CopyIo: Send + Sync {
    /// Read `region` into `pages`.  On failure, bit 0 of the mask is set.
    fn read(&self, region: &Region, pages: Vec<Page>) -> CopyIoFut;

    /// Write `pages` to every one of `regions`.  Bit `i` of the returned mask
    /// is set if the write to `regions[i]` failed.
    fn write(&self, regions: &[Region], pages: Vec<Page>) -> CopyIoFut;
}

// LCOV_EXCL_STOP
