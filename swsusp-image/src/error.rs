use std::io;

/// Failure kinds of the image writer.
///
/// The first error raised in any pipeline stage wins; later ones are
/// dropped. Nothing here is retried internally — the one sanctioned retry
/// (a second write attempt with a minimal image after `NoSwapSpace`) is the
/// supervisor's business.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Preflight shortfall, or the kernel handed out offset zero midstream.
    #[error("not enough free swap")]
    NoSwapSpace,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Kernel(#[from] swsusp_snapdev::Error),
    #[error("cipher setup failed: {0}")]
    Crypto(String),
    /// The user asked for the image to be abandoned; the system keeps
    /// running.
    #[error("image write aborted")]
    Aborted,
    /// A re-read of the written image does not hash to the stored digest.
    #[error("image verification failed: checksum mismatch")]
    ChecksumMismatch,
    /// The on-disk image structure cannot be walked back.
    #[error("image data malformed: {0}")]
    Corrupt(&'static str),
}

impl Error {
    /// The `errno` to surface as the process exit code, when meaningful.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::NoSwapSpace => Some(libc::ENOSPC),
            Error::Io(err) => err.raw_os_error().or(Some(libc::EIO)),
            Error::Kernel(err) => err.raw_os_error(),
            Error::Aborted => Some(libc::EINTR),
            Error::ChecksumMismatch | Error::Corrupt(_) => Some(libc::EIO),
            Error::Crypto(_) => None,
        }
    }

    pub fn is_no_swap_space(&self) -> bool {
        matches!(self, Error::NoSwapSpace)
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
