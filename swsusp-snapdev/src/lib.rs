//! Userspace access to the Linux hibernation ("swsusp") kernel interface.
//!
//! The snapshot device is the kernel's control endpoint: it freezes tasks,
//! produces the atomic in-memory image, hands out swap pages and performs the
//! final platform transitions. The resume device is the swap-backed block
//! device the image is written to. Both are thin fd wrappers here; policy
//! lives in the image-writer crates on top.

pub mod ioctl;
mod resume;
mod signature;
mod snapshot;

pub use resume::ResumeDevice;
pub use signature::{mark_swap, reset_signature, SwapHeader, SWAP_HEADER_SIZE, SWSUSP_SIG};
pub use snapshot::{power_off, reboot, Snapshot, SnapshotDevice};

use std::io;

/// Errors surfaced by the control interface.
///
/// No call at this layer is retried beyond the modern-to-legacy opcode
/// fallback; the caller decides what is fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    /// Both the modern and the legacy opcode came back `ENOTTY`.
    #[error("kernel supports neither the modern nor the legacy form of {op}")]
    Unsupported { op: &'static str },
    /// The resume device does not carry a swap signature we recognize.
    #[error("no swap signature on the resume device")]
    NoSignature,
    /// A signature we wrote is not there on re-read. The on-disk state is no
    /// longer trustworthy; the caller must not hand control back to a live
    /// system that believes the commit happened.
    #[error("swap signature re-read does not match what was written")]
    CommitCorrupted,
}

impl Error {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Error::Io { op, source }
    }

    /// The `errno` to report for this failure, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            Error::Unsupported { .. } => Some(libc::ENOTTY),
            Error::NoSignature => Some(libc::ENODEV),
            Error::CommitCorrupted => None,
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
