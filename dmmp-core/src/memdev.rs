// vim: tw=80
//! RAM-backed block devices, for testing and simulation.
//!
//! [`MemDevices`] implements [`CopyIo`] so it can back a
//! [`Kcopyd`](crate::kcopyd::Kcopyd), and it can execute the requests that a
//! [`Multipath`](crate::mpath::Multipath) forwards.  Any device can be told to
//! fail its reads or its writes, to simulate a broken path.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex}
};

use futures::FutureExt;
use tokio::sync::mpsc;

use crate::{
    io::{CopyIo, CopyIoFut, Direction, Dispatcher, IoContext, Request},
    page_pool::Page,
    types::*,
    util::*,
};

#[derive(Default)]
struct MemDev {
    data: Vec<u8>,
    fail_reads: bool,
    fail_writes: bool,
    /// Number of requests executed, including failed ones
    nr_ios: u64,
}

impl MemDev {
    fn range(&self, sector: SectorT, count: SectorT)
        -> Result<std::ops::Range<usize>>
    {
        let start = usize::try_from(sector).map_err(|_| Error::EINVAL)?
            .checked_mul(BYTES_PER_SECTOR)
            .ok_or(Error::EINVAL)?;
        let len = usize::try_from(count).map_err(|_| Error::EINVAL)?
            .checked_mul(BYTES_PER_SECTOR)
            .ok_or(Error::EINVAL)?;
        let end = start.checked_add(len).ok_or(Error::EINVAL)?;
        if end > self.data.len() {
            return Err(Error::ENXIO);
        }
        Ok(start..end)
    }
}

/// A collection of RAM disks, addressed by name
#[derive(Default)]
pub struct MemDevices {
    devs: Mutex<BTreeMap<DevId, MemDev>>,
}

impl MemDevices {
    /// Add a zero-filled device
    pub fn add<D: Into<DevId>>(&self, dev: D, sectors: SectorT) -> Result<()> {
        let len = usize::try_from(sectors).map_err(|_| Error::EINVAL)?
            .checked_mul(BYTES_PER_SECTOR)
            .ok_or(Error::EINVAL)?;
        let mut devs = self.devs.lock().unwrap();
        let dev = dev.into();
        if devs.contains_key(&dev) {
            return Err(Error::EEXIST);
        }
        devs.insert(dev, MemDev { data: vec![0; len], ..Default::default() });
        Ok(())
    }

    /// Run `f` on the named device
    fn with_dev<F, R>(&self, dev: &DevId, f: F) -> Result<R>
        where F: FnOnce(&mut MemDev) -> Result<R>
    {
        let mut devs = self.devs.lock().unwrap();
        devs.get_mut(dev).map_or(Err(Error::ENXIO), f)
    }

    /// Execute a request that a router forwarded to one of these devices.
    ///
    /// Requests carry no payload, so only the addressing is checked.
    pub fn execute(&self, req: &Request) -> Result<()> {
        let dev = req.dev().ok_or(Error::EINVAL)?;
        self.with_dev(dev, |d| {
            d.nr_ios += 1;
            let failing = match req.dir {
                Direction::Read => d.fail_reads,
                Direction::Write => d.fail_writes,
            };
            if failing {
                return Err(Error::EIO);
            }
            let count = div_roundup(req.nr_bytes as SectorT,
                                    BYTES_PER_SECTOR as SectorT);
            d.range(req.sector, count).map(drop)
        })
    }

    /// Make every subsequent read and write of `dev` fail, or stop doing so.
    pub fn set_failing(&self, dev: &DevId, failing: bool) -> Result<()> {
        self.with_dev(dev, |d| {
            d.fail_reads = failing;
            d.fail_writes = failing;
            Ok(())
        })
    }

    pub fn set_fail_reads(&self, dev: &DevId, failing: bool) -> Result<()> {
        self.with_dev(dev, |d| {
            d.fail_reads = failing;
            Ok(())
        })
    }

    pub fn set_fail_writes(&self, dev: &DevId, failing: bool) -> Result<()> {
        self.with_dev(dev, |d| {
            d.fail_writes = failing;
            Ok(())
        })
    }

    /// Number of router requests that `dev` has executed
    pub fn nr_ios(&self, dev: &DevId) -> Result<u64> {
        self.with_dev(dev, |d| Ok(d.nr_ios))
    }

    /// Read a region's contents directly, bypassing failure injection
    pub fn read_region(&self, region: &Region) -> Result<Vec<u8>> {
        self.with_dev(&region.dev, |d| {
            let r = d.range(region.sector, region.count)?;
            Ok(d.data[r].to_vec())
        })
    }

    /// Overwrite a region directly, bypassing failure injection
    pub fn write_region(&self, region: &Region, data: &[u8]) -> Result<()> {
        self.with_dev(&region.dev, |d| {
            let r = d.range(region.sector, region.count)?;
            if r.len() != data.len() {
                return Err(Error::EINVAL);
            }
            d.data[r].copy_from_slice(data);
            Ok(())
        })
    }

    fn read_into(&self, region: &Region, pages: &mut [Page]) -> Result<()> {
        self.with_dev(&region.dev, |d| {
            if d.fail_reads {
                return Err(Error::EIO);
            }
            let r = d.range(region.sector, region.count)?;
            let src = &d.data[r];
            for (page, chunk) in pages.iter_mut().zip(src.chunks(PAGE_SIZE)) {
                page[..chunk.len()].copy_from_slice(chunk);
            }
            Ok(())
        })
    }

    fn write_from(&self, region: &Region, pages: &[Page]) -> Result<()> {
        self.with_dev(&region.dev, |d| {
            if d.fail_writes {
                return Err(Error::EIO);
            }
            let r = d.range(region.sector, region.count)?;
            let dst = &mut d.data[r];
            for (chunk, page) in dst.chunks_mut(PAGE_SIZE).zip(pages.iter()) {
                let len = chunk.len();
                chunk.copy_from_slice(&page[..len]);
            }
            Ok(())
        })
    }
}

impl CopyIo for MemDevices {
    fn read(&self, region: &Region, mut pages: Vec<Page>) -> CopyIoFut {
        let mask = match self.read_into(region, &mut pages) {
            Ok(()) => 0,
            Err(e) => {
                tracing::debug!(dev = %region.dev, ?e, "read failed");
                1
            }
        };
        async move {
            // Complete asynchronously, like real hardware
            tokio::task::yield_now().await;
            (pages, mask)
        }.boxed()
    }

    fn write(&self, regions: &[Region], pages: Vec<Page>) -> CopyIoFut {
        let mask = regions.iter()
            .enumerate()
            .filter(|(_, r)| self.write_from(r, &pages).is_err())
            .fold(0u32, |mask, (i, _)| mask | (1 << i));
        async move {
            tokio::task::yield_now().await;
            (pages, mask)
        }.boxed()
    }
}

impl fmt::Debug for MemDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let devs = self.devs.lock().unwrap();
        f.debug_map()
            .entries(devs.iter().map(|(k, v)| (k, v.data.len())))
            .finish()
    }
}

/// Something that a [`ChannelDispatcher`] was asked to do
#[derive(Debug, Eq, PartialEq)]
pub enum Dispatched {
    Submit(Request, IoContext),
    Complete(Request, Result<()>),
}

/// A [`Dispatcher`] that forwards everything to a channel, so the owner of
/// the receiver can decide what to do with redriven I/O.
#[derive(Debug)]
pub struct ChannelDispatcher(mpsc::UnboundedSender<Dispatched>);

impl ChannelDispatcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Dispatched>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelDispatcher(tx)), rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn submit(&self, req: Request, ctx: IoContext) {
        // The receiver may have been dropped during shutdown
        let _ = self.0.send(Dispatched::Submit(req, ctx));
    }

    fn complete(&self, req: Request, result: Result<()>) {
        let _ = self.0.send(Dispatched::Complete(req, result));
    }
}

// LCOV_EXCL_STOP
