// vim: tw=80
//! Path selection policies
//!
//! Each priority group owns one selector instance.  The selector knows the
//! group's paths only by their index within the group, and it never sees a
//! path that the router considers failed unless the router reinstates it.

use crate::{table::TableError, types::*};

mod queue_length;
mod round_robin;

pub use self::queue_length::QueueLength;
pub use self::round_robin::RoundRobin;

/// Which form of status to report
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusKind {
    /// Runtime state, for humans and monitoring tools
    Info,
    /// Enough to reconstruct the configuration
    Table,
}

/// A policy for choosing one of a priority group's paths.
pub trait PathSelector: Send {
    /// The name by which this selector is registered
    fn name(&self) -> &'static str;

    /// Add the group's next path, with its per-path table arguments.
    fn add_path(&mut self, path: usize, args: &[String])
        -> std::result::Result<(), TableError>;

    /// Stop choosing `path`
    fn fail_path(&mut self, path: usize);

    /// Make a previously failed path eligible again.
    ///
    /// Selectors that can't do that needn't implement it.
    fn reinstate_path(&mut self, _path: usize) -> Result<()> {
        Err(Error::EOPNOTSUPP)
    }

    /// Pick a path for an I/O of `nr_bytes`.
    ///
    /// On success, also sets `repeat_count` to the number of further I/Os
    /// that may reuse the same path without asking again.
    fn select_path(&mut self, repeat_count: &mut u32, nr_bytes: usize)
        -> Option<usize>;

    /// An I/O has been sent down `path`
    fn start_io(&mut self, _path: usize, _nr_bytes: usize) {}

    /// An I/O sent down `path` has finished
    fn end_io(&mut self, _path: usize, _nr_bytes: usize) {}

    /// Status arguments for the whole group (`path == None`) or for one path.
    fn status(&self, _path: Option<usize>, _kind: StatusKind) -> Vec<String> {
        Vec::new()
    }

    /// Number of per-path arguments reported by `status(Some(_), Info)`
    fn info_args(&self) -> usize {
        0
    }

    /// Number of per-path arguments reported by `status(Some(_), Table)`
    fn table_args(&self) -> usize {
        0
    }
}

/// Parse the optional repeat count argument shared by the built-in selectors
fn parse_repeat_count(selector: &'static str, args: &[String], default: u32)
    -> std::result::Result<u32, TableError>
{
    match args {
        [] => Ok(default),
        [arg] => arg.parse::<u32>()
            .map_err(|_| TableError::RepeatCount(selector)),
        _ => Err(TableError::SelectorArgs(selector))
    }
}

// LCOV_EXCL_STOP
