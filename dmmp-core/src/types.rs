// vim: tw=80
//! Common type definitions used throughout dmmp

use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
    str::FromStr,
    sync::Arc,
};

/// Indexes a 512-byte sector on a block device
pub type SectorT = u64;

/// dmmp's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    // Standard errnos
    #[error("Operation not permitted")]
    EPERM           = libc::EPERM as isize,
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Interrupted system call")]
    EINTR           = libc::EINTR as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Argument list too long")]
    E2BIG           = libc::E2BIG as isize,
    #[error("Bad file descriptor")]
    EBADF           = libc::EBADF as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("Permission denied")]
    EACCES          = libc::EACCES as isize,
    #[error("Device busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("File exists")]
    EEXIST          = libc::EEXIST as isize,
    #[error("Operation not supported by device")]
    ENODEV          = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Read-only file system")]
    EROFS           = libc::EROFS as isize,
    #[error("Broken pipe")]
    EPIPE           = libc::EPIPE as isize,
    #[error("Result too large")]
    ERANGE          = libc::ERANGE as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Operation already in progress")]
    EALREADY        = libc::EALREADY as isize,
    #[error("Operation not supported")]
    EOPNOTSUPP      = libc::EOPNOTSUPP as isize,
    #[error("Operation timed out")]
    ETIMEDOUT       = libc::ETIMEDOUT as isize,
    #[error("Host is down")]
    EHOSTDOWN       = libc::EHOSTDOWN as isize,
    #[error("Illegal byte sequence")]
    EILSEQ          = libc::EILSEQ as isize,

    //// dmmp custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 256,
}

impl Error {
    /// Errors that must be returned to the submitter as-is, rather than
    /// retried down another path.
    ///
    /// `EAGAIN` only qualifies for read-ahead requests, so the caller must
    /// check that separately.
    pub fn is_final(self) -> bool {
        matches!(self, Error::EOPNOTSUPP | Error::EILSEQ)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap()
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Names an underlying block device, like "8:16" or "sdb".
///
/// This is an opaque handle as far as dmmp is concerned.  Cloning is cheap.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DevId(Arc<str>);

impl DevId {
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        DevId(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DevId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.contains(char::is_whitespace) {
            Err(Error::EINVAL)
        } else {
            Ok(DevId::new(s))
        }
    }
}

impl From<&str> for DevId {
    fn from(s: &str) -> Self {
        DevId::new(s)
    }
}

/// A contiguous range of sectors on one device
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub dev: DevId,
    pub sector: SectorT,
    pub count: SectorT,
}

impl Region {
    pub fn new<D: Into<DevId>>(dev: D, sector: SectorT, count: SectorT)
        -> Self
    {
        Region { dev: dev.into(), sector, count }
    }

    /// The sub-range `[offset, offset + count)` of this region.
    pub fn slice(&self, offset: SectorT, count: SectorT) -> Region {
        debug_assert!(offset + count <= self.count);
        Region {
            dev: self.dev.clone(),
            sector: self.sector + offset,
            count
        }
    }
}

// LCOV_EXCL_STOP
