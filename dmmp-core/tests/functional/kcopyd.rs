// vim: tw=80
//! End to end tests of the copy engine, using RAM-backed devices
use std::sync::{Arc, Mutex};

use dmmp_core::{
    io::{CopyIo, CopyIoFut},
    kcopyd::*,
    memdev::MemDevices,
    page_pool::Page,
    DevId,
    Error,
    Region,
    BYTES_PER_SECTOR,
};
use pretty_assertions::assert_eq;
use rstest::{fixture, rstest};
use tokio::sync::oneshot;

/// Records the regions read, then passes everything through to RAM disks
#[derive(Default)]
struct Recorder {
    devs: MemDevices,
    reads: Mutex<Vec<Region>>,
}

impl CopyIo for Recorder {
    fn read(&self, region: &Region, pages: Vec<Page>) -> CopyIoFut {
        self.reads.lock().unwrap().push(region.clone());
        self.devs.read(region, pages)
    }

    fn write(&self, regions: &[Region], pages: Vec<Page>) -> CopyIoFut {
        self.devs.write(regions, pages)
    }
}

struct Harness {
    io: Arc<Recorder>,
    kcopyd: Kcopyd,
}

#[fixture]
fn harness() -> Harness {
    harness_with(KcopydConfig::default())
}

fn harness_with(config: KcopydConfig) -> Harness {
    let io = Arc::new(Recorder::default());
    for dev in ["src", "dst0", "dst1"] {
        io.devs.add(dev, 4096).unwrap();
    }
    let kcopyd = Kcopyd::new(io.clone(), config);
    Harness { io, kcopyd }
}

/// Fill a region with a recognizable pattern
fn fill(devs: &MemDevices, region: &Region) -> Vec<u8> {
    let len = region.count as usize * BYTES_PER_SECTOR;
    let data = (0..len)
        .map(|i| (i / BYTES_PER_SECTOR + i % 7) as u8)
        .collect::<Vec<_>>();
    devs.write_region(region, &data).unwrap();
    data
}

/// Returns a completion callback, and a receiver for its arguments
fn notifier() -> (impl FnOnce(bool, u32) + Send + 'static,
                  oneshot::Receiver<(bool, u32)>)
{
    let (tx, rx) = oneshot::channel();
    (move |read_err, write_err| tx.send((read_err, write_err)).unwrap(), rx)
}

/// A small copy through a pool that it fills exactly
#[tokio::test]
async fn copy_small() {
    let h = harness_with(KcopydConfig { nr_pages: 4, max_jobs: 1 });
    let src = Region::new("src", 100, 32);
    let data = fill(&h.io.devs, &src);
    let (notify, rx) = notifier();
    h.kcopyd.copy(src, &[Region::new("dst0", 0, 32)], CopyFlags::default(),
                  notify).unwrap();
    assert_eq!(rx.await.unwrap(), (false, 0));
    assert_eq!(h.io.devs.read_region(&Region::new("dst0", 0, 32)).unwrap(),
               data);
    assert_eq!(h.kcopyd.nr_free_pages(), 4);
    assert_eq!(h.kcopyd.nr_jobs(), 0);
    h.kcopyd.destroy().await;
}

/// A large copy is carried out as a sequence of fixed-size chunks
#[rstest]
#[tokio::test]
async fn copy_split(harness: Harness) {
    let src = Region::new("src", 8, 1000);
    let data = fill(&harness.io.devs, &src);
    let dests = [Region::new("dst0", 2000, 1000), Region::new("dst1", 0, 1000)];
    let (notify, rx) = notifier();
    harness.kcopyd.copy(src, &dests, CopyFlags::default(), notify).unwrap();
    assert_eq!(rx.await.unwrap(), (false, 0));

    let mut reads = harness.io.reads.lock().unwrap().clone();
    reads.sort_by_key(|r| r.sector);
    let expected = (0..8)
        .map(|i| Region::new("src", 8 + i * 128, if i < 7 { 128 } else { 104 }))
        .collect::<Vec<_>>();
    assert_eq!(reads, expected);
    for d in dests.iter() {
        assert_eq!(harness.io.devs.read_region(d).unwrap(), data);
    }
    // The parent job is gone too
    assert_eq!(harness.kcopyd.nr_jobs(), 0);
}

/// Many concurrent copies share a small pool without deadlocking
#[tokio::test]
async fn copy_starved() {
    let h = harness_with(KcopydConfig { nr_pages: 16, max_jobs: 8 });
    let src = Region::new("src", 0, 512);
    let data = fill(&h.io.devs, &src);
    let mut rxs = Vec::new();
    for i in 0..4 {
        let (notify, rx) = notifier();
        let dst = Region::new("dst0", i * 512, 512);
        h.kcopyd.copy(src.clone(), &[dst], CopyFlags::default(), notify)
            .unwrap();
        rxs.push(rx);
    }
    for rx in rxs {
        assert_eq!(rx.await.unwrap(), (false, 0));
    }
    for i in 0..4 {
        let dst = Region::new("dst0", i * 512, 512);
        assert_eq!(h.io.devs.read_region(&dst).unwrap(), data);
    }
    h.kcopyd.destroy().await;
}

#[rstest]
#[tokio::test]
async fn read_error(harness: Harness) {
    harness.io.devs.set_fail_reads(&DevId::new("src"), true).unwrap();
    let (notify, rx) = notifier();
    harness.kcopyd.copy(Region::new("src", 0, 64),
        &[Region::new("dst0", 0, 64)], CopyFlags::default(), notify).unwrap();
    assert_eq!(rx.await.unwrap(), (true, 0));
}

/// With ignore_errors, a write failure on one destination doesn't stop the
/// others from being written.
#[rstest]
#[tokio::test]
async fn write_error_ignored(harness: Harness) {
    let src = Region::new("src", 0, 256);
    let data = fill(&harness.io.devs, &src);
    harness.io.devs.set_fail_writes(&DevId::new("dst0"), true).unwrap();
    let dests = [Region::new("dst0", 0, 256), Region::new("dst1", 0, 256)];
    let (notify, rx) = notifier();
    let flags = CopyFlags { ignore_errors: true };
    harness.kcopyd.copy(src, &dests, flags, notify).unwrap();
    assert_eq!(rx.await.unwrap(), (false, 0b01));
    assert_eq!(harness.io.devs.read_region(&dests[1]).unwrap(), data);
}

#[rstest]
#[tokio::test]
async fn no_destinations(harness: Harness) {
    let (notify, _rx) = notifier();
    let r = harness.kcopyd.copy(Region::new("src", 0, 8), &[],
                                CopyFlags::default(), notify);
    assert_eq!(r, Err(Error::EINVAL));
    assert_eq!(harness.kcopyd.nr_jobs(), 0);
}

#[rstest]
#[tokio::test]
async fn zero(harness: Harness) {
    let dests = [Region::new("dst0", 0, 300), Region::new("dst1", 16, 300)];
    for d in dests.iter() {
        fill(&harness.io.devs, d);
    }
    let (notify, rx) = notifier();
    harness.kcopyd.zero(&dests, CopyFlags::default(), notify).unwrap();
    assert_eq!(rx.await.unwrap(), (false, 0));
    for d in dests.iter() {
        assert!(harness.io.devs.read_region(d).unwrap().iter().all(|b| *b == 0));
    }
    assert!(harness.io.reads.lock().unwrap().is_empty());
}

/// Destroying the engine waits for outstanding jobs
#[rstest]
#[tokio::test]
async fn destroy_waits(harness: Harness) {
    let Harness { io, kcopyd } = harness;
    let src = Region::new("src", 0, 1024);
    let data = fill(&io.devs, &src);
    let dst = Region::new("dst1", 1024, 1024);
    kcopyd.copy(src, &[dst.clone()], CopyFlags::default(), |_, _| ()).unwrap();
    kcopyd.destroy().await;
    assert_eq!(io.devs.read_region(&dst).unwrap(), data);
}
