// vim: tw=80
//! End to end tests of the multipath router, using RAM-backed devices
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use dmmp_core::{
    hw_handler::{ActivateDone, ActivateStatus, ErrorAction, HwHandler},
    io::{Direction, IoContext, Request},
    memdev::{ChannelDispatcher, Dispatched, MemDevices},
    mpath::*,
    path_selector::StatusKind,
    registry::Registry,
    table::Table,
    DevId,
    Error,
    Result,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

/// How a request turned out: the device it finished on, or its error
type Completion = (u64, std::result::Result<String, Error>);

struct Harness {
    devs: Arc<MemDevices>,
    mp: Multipath,
    rx: mpsc::UnboundedReceiver<Dispatched>,
}

impl Harness {
    fn new(table: &str) -> Self {
        Self::with_registry(table, &Registry::default())
    }

    fn with_registry(table: &str, registry: &Registry) -> Self {
        let table = table.parse::<Table>().unwrap();
        let devs = Arc::new(MemDevices::default());
        for p in table.groups.iter().flat_map(|g| g.paths.iter()) {
            devs.add(p.dev.clone(), 1024).unwrap();
        }
        let (dispatcher, rx) = ChannelDispatcher::new();
        let mp = Multipath::new(&table, registry, dispatcher).unwrap();
        Harness { devs, mp, rx }
    }

    fn execute(&self, req: Request, ctx: IoContext) -> Option<Completion> {
        let r = self.devs.execute(&req);
        match self.mp.end_io(req, r, ctx) {
            EndIo::Done(req, r) => Some(Self::completion(&req, r)),
            EndIo::Requeue(req) => panic!("Unexpected requeue of {req:?}"),
            EndIo::Incomplete => None,
        }
    }

    fn completion(req: &Request, r: Result<()>) -> Completion {
        (req.id, r.map(|_| req.dev().unwrap().to_string()))
    }

    fn fail_dev(&self, dev: &str) {
        self.devs.set_failing(&DevId::new(dev), true).unwrap();
    }

    /// Issue a read, and report its completion if it didn't get queued.
    fn io(&self, id: u64) -> Option<Completion> {
        let req = Request::new(id, Direction::Read, 8 * id, 4096);
        match self.mp.map(req) {
            MapOutcome::Forwarded(req, ctx) => self.execute(req, ctx),
            MapOutcome::Queued => None,
            MapOutcome::Failed(req, e) => Some((req.id, Err(e))),
            MapOutcome::Requeue(req) => panic!("Unexpected requeue of {req:?}"),
        }
    }

    fn path(&self, dev: &str) -> PathId {
        self.mp.paths_by_dev(dev)[0]
    }

    /// Run background work to completion, carrying out any I/O that the
    /// router redrives.  Returns the requests that completed.
    async fn settle(&mut self) -> Vec<Completion> {
        let mut completions = Vec::new();
        loop {
            self.mp.flush().await;
            let mut progress = false;
            while let Ok(d) = self.rx.try_recv() {
                progress = true;
                match d {
                    Dispatched::Submit(req, ctx) => {
                        completions.extend(self.execute(req, ctx));
                    }
                    Dispatched::Complete(req, r) => {
                        completions.push(Self::completion(&req, r));
                    }
                }
            }
            if !progress {
                break completions;
            }
        }
    }
}

fn ok(id: u64, dev: &str) -> Option<Completion> {
    Some((id, Ok(dev.to_owned())))
}

/// A hardware handler that activates instantly, and bypasses a path's group
/// whenever it sees an I/O error on it
#[derive(Default)]
struct BypassingHandler {
    activated: Mutex<Vec<DevId>>,
}

impl HwHandler for BypassingHandler {
    fn name(&self) -> &'static str {
        "bypassing"
    }

    fn activate(&self, dev: &DevId, done: ActivateDone) {
        self.activated.lock().unwrap().push(dev.clone());
        done(ActivateStatus::Ok)
    }

    fn classify_error(&self, _req: &Request, _error: Error) -> ErrorAction {
        ErrorAction::BypassGroup
    }
}

fn bypassing_registry() -> (Registry, Arc<BypassingHandler>) {
    let hwh = Arc::new(BypassingHandler::default());
    let hwh2 = hwh.clone();
    let mut registry = Registry::default();
    registry.register_hw_handler("bypassing", move |_| Ok(hwh2.clone()))
        .unwrap();
    (registry, hwh)
}

const TWO_GROUPS: &str =
    "0 0 2 1 round-robin 0 2 0 sda sdb round-robin 0 1 0 sdc";

/// Fail paths administratively, one at a time.  The router stays in the
/// first group for as long as it has a usable path.
#[test_log::test(tokio::test)]
async fn failover() {
    let h = Harness::new(TWO_GROUPS);
    assert_eq!(h.io(0), ok(0, "sda"));
    h.mp.fail_path(h.path("sda")).unwrap();
    assert_eq!(h.io(1), ok(1, "sdb"));
    assert_eq!(h.mp.current_group(), Some(1));
    h.mp.fail_path(h.path("sdb")).unwrap();
    assert_eq!(h.io(2), ok(2, "sdc"));
    assert_eq!(h.mp.current_group(), Some(2));
}

/// When the device under a path breaks, I/O gets redriven down another path
/// and the broken path is failed.
#[tokio::test]
async fn failover_on_error() {
    let mut h = Harness::new(TWO_GROUPS);
    assert_eq!(h.io(0), ok(0, "sda"));
    h.fail_dev("sda");
    assert_eq!(h.io(1), None);
    assert_eq!(h.settle().await, vec![(1, Ok("sdb".to_owned()))]);
    let info = h.mp.path_info(h.path("sda")).unwrap();
    assert!(!info.is_active);
    assert_eq!(info.fail_count, 1);

    h.fail_dev("sdb");
    assert_eq!(h.io(2), None);
    assert_eq!(h.settle().await, vec![(2, Ok("sdc".to_owned()))]);
    assert_eq!(h.mp.nr_valid_paths(), 1);
}

/// No request is lost when many of them hit a failing path
#[tokio::test]
async fn failover_many() {
    let mut h = Harness::new(TWO_GROUPS);
    h.fail_dev("sda");
    let mut completions = (0..100)
        .filter_map(|id| h.io(id))
        .collect::<Vec<_>>();
    completions.extend(h.settle().await);
    completions.sort_by_key(|c| c.0);
    assert_eq!(completions.len(), 100);
    assert!(completions.iter()
        .enumerate()
        .all(|(i, c)| c == &(i as u64, Ok("sdb".to_owned()))));
    assert_eq!(h.devs.nr_ios(&DevId::new("sdb")), Ok(100));
}

/// With queue_if_no_path, I/O waits until a path comes back
#[tokio::test]
async fn queue_until_reinstated() {
    let mut h = Harness::new(
        "1 queue_if_no_path 0 2 1 round-robin 0 2 0 sda sdb \
         round-robin 0 1 0 sdc");
    for dev in ["sda", "sdb", "sdc"] {
        h.mp.fail_path(h.path(dev)).unwrap();
    }
    assert_eq!(h.io(0), None);
    assert_eq!(h.mp.queue_size(), 1);
    assert!(h.settle().await.is_empty());
    assert_eq!(h.mp.queue_size(), 1);

    h.mp.reinstate_path(h.path("sda")).unwrap();
    assert_eq!(h.settle().await, vec![(0, Ok("sda".to_owned()))]);
    assert_eq!(h.mp.queue_size(), 0);
}

/// Turning off queue_if_no_path releases queued I/O with an error
#[tokio::test]
async fn queue_then_give_up() {
    let mut h = Harness::new("1 queue_if_no_path 0 1 1 round-robin 0 1 0 sda");
    h.fail_dev("sda");
    assert_eq!(h.io(0), None);
    assert!(h.settle().await.is_empty());
    h.mp.message("fail_if_no_path").unwrap();
    assert_eq!(h.settle().await, vec![(0, Err(Error::EIO))]);
}

/// An error classified as "bypass group" moves I/O to another group without
/// failing any path.
#[tokio::test]
async fn bypass_group() {
    let (registry, hwh) = bypassing_registry();
    let mut h = Harness::with_registry(
        "0 1 bypassing 2 1 round-robin 0 2 0 sda sdb round-robin 0 1 0 sdc",
        &registry);
    // Switching to the first group requires activating it
    assert_eq!(h.io(0), None);
    assert_eq!(h.settle().await, vec![(0, Ok("sda".to_owned()))]);

    h.fail_dev("sda");
    assert_eq!(h.io(1), None);
    assert_eq!(h.mp.is_bypassed(1), Some(true));
    assert_eq!(h.mp.current_path(), None);
    assert_eq!(h.mp.current_group(), None);
    assert_eq!(h.settle().await, vec![(1, Ok("sdc".to_owned()))]);
    assert_eq!(h.mp.nr_valid_paths(), 3);

    let mut activated = hwh.activated.lock().unwrap().iter()
        .map(DevId::to_string)
        .collect::<Vec<_>>();
    activated.sort();
    assert_eq!(activated, vec!["sda", "sdb", "sdc"]);
}

/// A bypassed group is used when nothing else is left.  Activating it is
/// delayed.
#[tokio::test(start_paused = true)]
async fn bypassed_group_last_resort() {
    let (registry, _hwh) = bypassing_registry();
    let mut h = Harness::with_registry(
        "0 1 bypassing 2 1 round-robin 0 2 0 sda sdb round-robin 0 1 0 sdc",
        &registry);
    h.io(0);
    h.settle().await;
    h.mp.disable_group(1).unwrap();
    h.mp.fail_path(h.path("sdc")).unwrap();
    assert_eq!(h.io(1), None);
    assert_eq!(h.settle().await, vec![(1, Ok("sda".to_owned()))]);
    assert_eq!(h.mp.current_group(), Some(1));
    // Activation succeeded, so the group is no longer bypassed
    assert_eq!(h.mp.is_bypassed(1), Some(false));
}

/// The queue-length selector spreads in-flight I/O across paths
#[tokio::test]
async fn queue_length_balances() {
    let h = Harness::new("0 0 1 1 queue-length 0 2 1 sda 1 sdb 1");
    let mut per_dev = BTreeMap::<String, usize>::new();
    let mut inflight = Vec::new();
    for id in 0..8 {
        let req = Request::new(id, Direction::Read, 0, 4096);
        let MapOutcome::Forwarded(req, ctx) = h.mp.map(req) else {
            panic!("not forwarded");
        };
        *per_dev.entry(req.dev().unwrap().to_string()).or_default() += 1;
        inflight.push((req, ctx));
    }
    assert_eq!(per_dev.get("sda"), Some(&4));
    assert_eq!(per_dev.get("sdb"), Some(&4));
    for (req, ctx) in inflight {
        assert!(matches!(h.mp.end_io(req, Ok(()), ctx), EndIo::Done(_, Ok(()))));
    }
    assert!(h.mp.status(StatusKind::Info).ends_with("sda A 0 0 sdb A 0 0"));
}

/// A repaired path can be put back into service with a message
#[tokio::test]
async fn repair() {
    let mut h = Harness::new("0 0 1 1 round-robin 0 2 0 sda sdb");
    let mut events = h.mp.path_events();
    h.fail_dev("sda");
    h.io(0);
    assert_eq!(h.settle().await, vec![(0, Ok("sdb".to_owned()))]);
    assert_eq!(events.recv().await.unwrap().kind, PathEventKind::Failed);

    h.devs.set_failing(&DevId::new("sda"), false).unwrap();
    h.mp.message("reinstate_path sda").unwrap();
    assert_eq!(events.recv().await.unwrap(), PathEvent {
        kind: PathEventKind::Reinstated,
        dev: DevId::new("sda"),
        nr_valid_paths: 2
    });
    h.fail_dev("sdb");
    h.io(1);
    assert_eq!(h.settle().await, vec![(1, Ok("sda".to_owned()))]);
}

/// The table status reflects administrative changes, and can be used to
/// recreate an equivalent router.
#[tokio::test]
async fn status_round_trip() {
    let h = Harness::new(TWO_GROUPS);
    h.mp.message("queue_if_no_path").unwrap();
    h.mp.message("switch_group 2").unwrap();
    let status = h.mp.status(StatusKind::Table);
    assert_eq!(status, "1 queue_if_no_path 0 2 2 round-robin 0 2 1 sda 1000 \
               sdb 1000 round-robin 0 1 1 sdc 1000");
    let h2 = Harness::new(&status);
    assert_eq!(h2.io(0), ok(0, "sdc"));
    assert_eq!(h2.mp.status(StatusKind::Table), status);
}

/// Teardown fails any I/O still waiting for a path
#[tokio::test]
async fn destroy_with_queued_io() {
    let h = Harness::new("1 queue_if_no_path 0 1 1 round-robin 0 1 0 sda");
    h.mp.fail_path(h.path("sda")).unwrap();
    assert_eq!(h.io(0), None);
    assert_eq!(h.io(1), None);
    let Harness { mp, mut rx, .. } = h;
    mp.destroy().await;
    let mut failed = Vec::new();
    while let Ok(Dispatched::Complete(req, r)) = rx.try_recv() {
        failed.push((req.id, r));
    }
    assert_eq!(failed, vec![(0, Err(Error::EIO)), (1, Err(Error::EIO))]);
}

#[tokio::test]
async fn topology_events() {
    let h = Harness::new(TWO_GROUPS);
    let mut events = h.mp.subscribe();
    h.mp.message("disable_group 2").unwrap();
    h.mp.flush().await;
    assert!(events.has_changed().unwrap());
    events.borrow_and_update();
    h.mp.message("fail_path sdb").unwrap();
    h.mp.flush().await;
    assert!(events.has_changed().unwrap());
}
