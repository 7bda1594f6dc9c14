//! OS process introspection used by enrichment and the injection check.
//!
//! Each query is independent and may fail on its own (process gone, access
//! denied); callers decide what a failure means.

use std::{io, path::PathBuf, sync::Arc, time::SystemTime};

use thiserror::Error;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

/// What backs the memory at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Mapped from an executable image by the loader.
    Image,
    /// Mapped view of a data file or section.
    Mapped,
    /// Private (anonymous) allocation.
    Private,
    /// Not allocated.
    Free,
}

#[derive(Debug, Error)]
pub enum IntrospectError {
    #[error("process {0} not found")]
    NoSuchProcess(i32),

    #[error("access to process {0} denied")]
    AccessDenied(i32),

    #[error("{op} failed with OS error {code}")]
    Os { op: &'static str, code: u32 },

    #[error("unexpected {what} format")]
    Parse { what: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("process introspection is not supported on this platform")]
    Unsupported,
}

pub trait ProcessIntrospector: Send + Sync + 'static {
    /// Full path of the main executable of `pid`.
    fn executable_path(&self, pid: i32) -> Result<PathBuf, IntrospectError>;

    /// Wall-clock time `pid` was started.
    fn start_time(&self, pid: i32) -> Result<SystemTime, IntrospectError>;

    /// Kind of the region containing `address` in `pid`'s address space.
    fn region_kind(&self, pid: i32, address: u64) -> Result<RegionKind, IntrospectError>;
}

/// Introspector for the platform this binary runs on.
pub fn native() -> Arc<dyn ProcessIntrospector> {
    #[cfg(windows)]
    {
        Arc::new(windows::WinIntrospector)
    }
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::ProcfsIntrospector::default())
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        Arc::new(Unsupported)
    }
}

/// Every query fails with [`IntrospectError::Unsupported`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

impl ProcessIntrospector for Unsupported {
    fn executable_path(&self, _pid: i32) -> Result<PathBuf, IntrospectError> {
        Err(IntrospectError::Unsupported)
    }

    fn start_time(&self, _pid: i32) -> Result<SystemTime, IntrospectError> {
        Err(IntrospectError::Unsupported)
    }

    fn region_kind(&self, _pid: i32, _address: u64) -> Result<RegionKind, IntrospectError> {
        Err(IntrospectError::Unsupported)
    }
}
