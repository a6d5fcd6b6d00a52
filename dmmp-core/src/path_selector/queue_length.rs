// vim: tw=80
//! Least-pending-I/O path selection

use std::collections::VecDeque;

use crate::{table::TableError, types::*};
use super::{PathSelector, StatusKind, parse_repeat_count};

pub const QL_MIN_IO: u32 = 128;

#[derive(Clone, Copy, Debug, Default)]
struct PathInfo {
    repeat_count: u32,
    /// Number of I/Os in flight on this path
    qlen: usize,
}

/// Chooses whichever valid path has the fewest I/Os in flight.
#[derive(Debug, Default)]
pub struct QueueLength {
    paths: Vec<PathInfo>,
    valid: VecDeque<usize>,
    failed: Vec<usize>,
}

impl QueueLength {
    pub const NAME: &'static str = "queue-length";

    pub fn new() -> Self {
        Self::default()
    }
}

impl PathSelector for QueueLength {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_path(&mut self, path: usize, args: &[String])
        -> std::result::Result<(), TableError>
    {
        let repeat_count = parse_repeat_count(Self::NAME, args, QL_MIN_IO)?;
        if self.paths.len() <= path {
            self.paths.resize(path + 1, PathInfo::default());
        }
        self.paths[path] = PathInfo { repeat_count, qlen: 0 };
        self.valid.push_back(path);
        Ok(())
    }

    fn fail_path(&mut self, path: usize) {
        if let Some(i) = self.valid.iter().position(|p| *p == path) {
            self.valid.remove(i);
            self.failed.push(path);
        }
    }

    fn reinstate_path(&mut self, path: usize) -> Result<()> {
        if let Some(i) = self.failed.iter().position(|p| *p == path) {
            self.failed.remove(i);
            self.valid.push_back(path);
        }
        Ok(())
    }

    fn select_path(&mut self, repeat_count: &mut u32, _nr_bytes: usize)
        -> Option<usize>
    {
        // Rotate the preferred path, so ties are broken evenly
        self.valid.rotate_left(1.min(self.valid.len()));
        let mut best: Option<usize> = None;
        for &p in self.valid.iter() {
            if best.map_or(true, |b| self.paths[p].qlen < self.paths[b].qlen) {
                best = Some(p);
            }
            if self.paths[p].qlen == 0 {
                break;
            }
        }
        let best = best?;
        *repeat_count = self.paths[best].repeat_count;
        Some(best)
    }

    fn start_io(&mut self, path: usize, _nr_bytes: usize) {
        self.paths[path].qlen += 1;
    }

    fn end_io(&mut self, path: usize, _nr_bytes: usize) {
        let qlen = &mut self.paths[path].qlen;
        *qlen = qlen.saturating_sub(1);
    }

    fn status(&self, path: Option<usize>, kind: StatusKind) -> Vec<String> {
        let Some(p) = path else {
            return Vec::new();
        };
        let info = &self.paths[p];
        match kind {
            StatusKind::Info => vec![info.qlen.to_string()],
            StatusKind::Table => vec![info.repeat_count.to_string()],
        }
    }

    fn info_args(&self) -> usize {
        1
    }

    fn table_args(&self) -> usize {
        1
    }
}

// LCOV_EXCL_STOP
