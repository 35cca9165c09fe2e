//! Error kinds for the downloader, per the severity classes of the error
//! handling design: configuration, I/O, and peer-protocol failures.

use thiserror::Error;

/// Top-level error type returned by every fallible operation in this crate.
///
/// `main` maps variants onto the process exit codes of the external
/// interface: configuration and usage errors exit 1 or 2, I/O failures
/// during setup exit 1, and a closed UART after the session has started
/// exits 2.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("payload {len} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("the phone closed the serial line")]
    PeerClosed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DownloadError>;
