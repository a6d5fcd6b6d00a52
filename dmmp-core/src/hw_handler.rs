// vim: tw=80
//! Hardware handlers: vendor-specific path activation and error classification

#[cfg(test)] use mockall::automock;

use crate::{
    io::Request,
    path_selector::StatusKind,
    types::*,
};

/// Outcome of an attempt to activate a path
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActivateStatus {
    Ok,
    /// The device is busy.  Try again, optionally after waiting for the
    /// router's `pg_init_delay_msecs`.
    Retry { delay: bool },
    /// The path can't be activated
    FailPath,
    /// The whole priority group is temporarily unusable
    BypassGroup,
    /// Any other failure.  The path gets failed.
    Error,
}

impl ActivateStatus {
    pub fn is_error(self) -> bool {
        matches!(self,
            ActivateStatus::FailPath |
            ActivateStatus::BypassGroup |
            ActivateStatus::Error)
    }
}

/// What the router should do about an I/O error on a path
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorAction {
    /// Retry the I/O without failing anything
    None,
    /// Fail the path and retry on another one
    #[default]
    FailPath,
    /// Bypass the path's group and retry elsewhere
    BypassGroup,
    /// Complete the I/O with its error
    HardError,
}

/// Continuation for [`HwHandler::activate`]
pub type ActivateDone = Box<dyn FnOnce(ActivateStatus) + Send>;

/// Knows how to switch a storage array's controllers over to a path.
#[cfg_attr(test, automock)]
pub trait HwHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Begin activating `dev`.  `done` must eventually be called exactly
    /// once.  It may be called before `activate` returns.
    fn activate(&self, dev: &DevId, done: ActivateDone);

    /// Decide how the router should react to `error` on `req`
    fn classify_error(&self, _req: &Request, _error: Error) -> ErrorAction {
        ErrorAction::FailPath
    }

    /// Status arguments
    fn status(&self, _kind: StatusKind) -> Vec<String> {
        Vec::new()
    }
}

// LCOV_EXCL_STOP
