//! Error types for the KMS resource manager

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A dma-buf fd could not be turned into a GEM handle
    #[error("import of fd {fd} failed: {source}")]
    Import {
        fd: i32,
        #[source]
        source: io::Error,
    },

    /// Kernel allocation or mapping failure
    #[error("allocation failed: {0}")]
    Alloc(String),

    #[error("format {fourcc} (modifier {modifier:#x}) unsupported: {reason}")]
    FormatUnsupported {
        fourcc: String,
        modifier: u64,
        reason: String,
    },

    #[error("atomic commit rejected: errno {errno}")]
    CommitRejected { errno: i32 },

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("pool exhausted: {max} framebuffers already live")]
    PoolExhausted { max: usize },

    #[error("property {0} not present")]
    PropertyMissing(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("object busy: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Kernel errno carried by this error, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Import { source, .. } => source.raw_os_error(),
            Error::CommitRejected { errno } => Some(*errno),
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn commit(e: io::Error) -> Self {
        Error::CommitRejected {
            errno: e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub(crate) fn format(fourcc: u32, modifier: u64, reason: impl Into<String>) -> Self {
        Error::FormatUnsupported {
            fourcc: crate::fourcc::fourcc_string(fourcc),
            modifier,
            reason: reason.into(),
        }
    }

    /// True for errnos that mean the device node itself has gone away
    pub fn is_device_gone(errno: i32) -> bool {
        matches!(errno, libc::ENODEV | libc::EIO | libc::ENXIO)
    }
}
