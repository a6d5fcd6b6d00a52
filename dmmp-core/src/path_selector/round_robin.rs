// vim: tw=80
//! Round-robin path selection

use std::collections::VecDeque;

use crate::{table::TableError, types::*};
use super::{PathSelector, StatusKind, parse_repeat_count};

pub const RR_MIN_IO: u32 = 1000;

/// Rotates through the group's valid paths, sending a fixed number of I/Os
/// down each before moving on.
#[derive(Debug, Default)]
pub struct RoundRobin {
    /// Repeat count of each path, indexed by path
    repeat_count: Vec<u32>,
    valid: VecDeque<usize>,
    invalid: Vec<usize>,
}

impl RoundRobin {
    pub const NAME: &'static str = "round-robin";

    pub fn new() -> Self {
        Self::default()
    }
}

impl PathSelector for RoundRobin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_path(&mut self, path: usize, args: &[String])
        -> std::result::Result<(), TableError>
    {
        let repeat_count = parse_repeat_count(Self::NAME, args, RR_MIN_IO)?;
        if self.repeat_count.len() <= path {
            self.repeat_count.resize(path + 1, RR_MIN_IO);
        }
        self.repeat_count[path] = repeat_count;
        self.valid.push_back(path);
        Ok(())
    }

    fn fail_path(&mut self, path: usize) {
        if let Some(i) = self.valid.iter().position(|p| *p == path) {
            self.valid.remove(i);
            self.invalid.push(path);
        }
    }

    fn reinstate_path(&mut self, path: usize) -> Result<()> {
        if let Some(i) = self.invalid.iter().position(|p| *p == path) {
            self.invalid.remove(i);
            self.valid.push_back(path);
        }
        Ok(())
    }

    fn select_path(&mut self, repeat_count: &mut u32, _nr_bytes: usize)
        -> Option<usize>
    {
        let path = self.valid.pop_front()?;
        self.valid.push_back(path);
        *repeat_count = self.repeat_count[path];
        Some(path)
    }

    fn status(&self, path: Option<usize>, kind: StatusKind) -> Vec<String> {
        match (path, kind) {
            (Some(p), StatusKind::Table) => vec![self.repeat_count[p].to_string()],
            _ => Vec::new()
        }
    }

    fn table_args(&self) -> usize {
        1
    }
}

// LCOV_EXCL_STOP
