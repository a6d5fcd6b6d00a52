// vim: tw=80
//! The multipath table: a router's textual configuration.
//!
//! ```text
//! <#features> [features...]
//! <#hw args> [<hw handler> [hw args...]]
//! <#groups> <initial group>
//! for each group:
//!     <selector> <#selector args> [selector args...] <#paths> <#path args>
//!     for each path:
//!         <device> [path args...]
//! ```
//!
//! Features are `queue_if_no_path`, `pg_init_retries <n>` and
//! `pg_init_delay_msecs <n>`.

use std::{fmt, ops::RangeInclusive, slice, str::FromStr};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{types::*, util::shift};

pub const MAX_PATHS_PER_GROUP: u32 = 1024;
pub const PG_INIT_DELAY_DEFAULT: u32 = 2000;
pub const PG_INIT_DELAY_MAX: u32 = 60000;
pub const PG_INIT_RETRIES_MAX: u32 = 50;

/// Reasons that a table may be rejected
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TableError {
    #[error("not enough arguments")]
    NotEnoughArgs,
    #[error("invalid number of feature args")]
    FeatureCount,
    #[error("unrecognised multipath feature request: {0}")]
    UnknownFeature(String),
    #[error("invalid number of pg_init retries")]
    PgInitRetries,
    #[error("invalid pg_init_delay_msecs")]
    PgInitDelay,
    #[error("invalid number of hardware handler args")]
    HwArgCount,
    #[error("unknown hardware handler type: {0}")]
    UnknownHwHandler(String),
    #[error("invalid number of priority groups")]
    GroupCount,
    #[error("invalid initial priority group")]
    InitialGroup,
    #[error("priority group count mismatch")]
    GroupCountMismatch,
    #[error("unknown path selector type: {0}")]
    UnknownSelector(String),
    #[error("invalid number of path selector args")]
    SelectorArgCount,
    #[error("invalid number of paths")]
    PathCount,
    #[error("invalid number of selector args")]
    PathArgCount,
    #[error("{0} ps: incorrect number of arguments")]
    SelectorArgs(&'static str),
    #[error("{0} ps: invalid repeat count")]
    RepeatCount(&'static str),
}

impl From<TableError> for Error {
    fn from(_: TableError) -> Self {
        Error::EINVAL
    }
}

type Args<'a> = slice::Iter<'a, String>;
type TResult<T> = std::result::Result<T, TableError>;

/// Read a bounded numeric parameter
fn read_param(args: &mut Args, range: RangeInclusive<u32>, err: TableError)
    -> TResult<u32>
{
    let s = shift(args, TableError::NotEnoughArgs)?;
    s.parse::<u32>()
        .ok()
        .filter(|n| range.contains(n))
        .ok_or(err)
}

fn take(args: &mut Args, n: u32) -> TResult<Vec<String>> {
    (0..n).map(|_| shift(args, TableError::NotEnoughArgs).map(str::to_owned))
        .collect()
}

/// Router-wide options
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Features {
    /// Queue I/O instead of failing it when no path is usable
    pub queue_if_no_path: bool,
    /// How many times to retry activating a group
    pub pg_init_retries: u32,
    /// How long to wait before retrying an activation that asked for a delay
    pub pg_init_delay_msecs: u32,
}

impl Features {
    fn parse(args: &mut Args) -> TResult<Self> {
        let mut features = Features::default();
        let mut argc = read_param(args, 0..=6, TableError::FeatureCount)?;
        while argc > 0 {
            let name = shift(args, TableError::NotEnoughArgs)?;
            argc -= 1;
            match name {
                "queue_if_no_path" => features.queue_if_no_path = true,
                "pg_init_retries" if argc > 0 => {
                    features.pg_init_retries = read_param(args,
                        1..=PG_INIT_RETRIES_MAX, TableError::PgInitRetries)?;
                    argc -= 1;
                }
                "pg_init_delay_msecs" if argc > 0 => {
                    features.pg_init_delay_msecs = read_param(args,
                        0..=PG_INIT_DELAY_MAX, TableError::PgInitDelay)?;
                    argc -= 1;
                }
                _ => return Err(TableError::UnknownFeature(name.to_owned()))
            }
        }
        Ok(features)
    }

    fn tokens(&self) -> Vec<String> {
        let mut v = Vec::new();
        if self.queue_if_no_path {
            v.push("queue_if_no_path".to_owned());
        }
        if self.pg_init_retries > 0 {
            v.push("pg_init_retries".to_owned());
            v.push(self.pg_init_retries.to_string());
        }
        if self.pg_init_delay_msecs != PG_INIT_DELAY_DEFAULT {
            v.push("pg_init_delay_msecs".to_owned());
            v.push(self.pg_init_delay_msecs.to_string());
        }
        v.insert(0, v.len().to_string());
        v
    }
}

impl Default for Features {
    fn default() -> Self {
        Features {
            queue_if_no_path: false,
            pg_init_retries: 0,
            pg_init_delay_msecs: PG_INIT_DELAY_DEFAULT
        }
    }
}

/// Names a hardware handler and its arguments
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HwSpec {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathSpec {
    pub dev: DevId,
    /// Arguments for the group's path selector
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupSpec {
    pub selector: String,
    pub selector_args: Vec<String>,
    /// Number of selector arguments that follow each path's device
    pub nr_path_args: usize,
    pub paths: Vec<PathSpec>,
}

impl GroupSpec {
    fn parse(args: &mut Args) -> TResult<Self> {
        let selector = shift(args, TableError::NotEnoughArgs)?.to_owned();
        let nsel = read_param(args, 0..=1024, TableError::SelectorArgCount)?;
        let selector_args = take(args, nsel)?;
        let npaths = read_param(args, 1..=MAX_PATHS_PER_GROUP,
                                TableError::PathCount)?;
        let nargs = read_param(args, 0..=1024, TableError::PathArgCount)?;
        let paths = (0..npaths).map(|_| {
            let dev = DevId::new(shift(args, TableError::NotEnoughArgs)?);
            let args = take(args, nargs)?;
            Ok(PathSpec { dev, args })
        }).collect::<TResult<Vec<_>>>()?;
        let nr_path_args = nargs as usize;
        Ok(GroupSpec { selector, selector_args, nr_path_args, paths })
    }

    fn tokens(&self) -> Vec<String> {
        let mut v = vec![self.selector.clone()];
        v.push(self.selector_args.len().to_string());
        v.extend(self.selector_args.iter().cloned());
        v.push(self.paths.len().to_string());
        v.push(self.nr_path_args.to_string());
        for p in self.paths.iter() {
            v.push(p.dev.to_string());
            v.extend(p.args.iter().cloned());
        }
        v
    }
}

/// A parsed multipath table
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Table {
    pub features: Features,
    pub hw_handler: Option<HwSpec>,
    /// 1-based number of the group to try first.  0 iff there are no groups.
    pub initial_group: u32,
    pub groups: Vec<GroupSpec>,
}

impl Table {
    /// Total number of paths in all groups
    pub fn nr_paths(&self) -> usize {
        self.groups.iter().map(|g| g.paths.len()).sum()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut v = self.features.tokens();
        match &self.hw_handler {
            None => v.push("0".to_owned()),
            Some(hw) => {
                v.push((1 + hw.args.len()).to_string());
                v.push(hw.name.clone());
                v.extend(hw.args.iter().cloned());
            }
        }
        v.push(self.groups.len().to_string());
        v.push(self.initial_group.to_string());
        for g in self.groups.iter() {
            v.extend(g.tokens());
        }
        write!(f, "{}", v.join(" "))
    }
}

impl FromStr for Table {
    type Err = TableError;

    fn from_str(s: &str) -> TResult<Self> {
        let tokens = s.split_whitespace()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        let mut args = tokens.iter();

        let features = Features::parse(&mut args)?;

        let nhw = read_param(&mut args, 0..=1024, TableError::HwArgCount)?;
        let hw_handler = if nhw > 0 {
            let mut hw = take(&mut args, nhw)?;
            let name = hw.remove(0);
            Some(HwSpec { name, args: hw })
        } else {
            None
        };

        let nr_groups = read_param(&mut args, 0..=1024,
                                   TableError::GroupCount)?;
        let initial_group = read_param(&mut args, 0..=1024,
                                       TableError::InitialGroup)?;
        if (nr_groups == 0) != (initial_group == 0) ||
            initial_group > nr_groups
        {
            return Err(TableError::InitialGroup);
        }

        let mut groups = Vec::new();
        while args.len() > 0 {
            groups.push(GroupSpec::parse(&mut args)?);
        }
        if groups.len() != nr_groups as usize {
            return Err(TableError::GroupCountMismatch);
        }
        Ok(Table { features, hw_handler, initial_group, groups })
    }
}

// LCOV_EXCL_STOP
