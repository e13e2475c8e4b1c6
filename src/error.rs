//! Error types for the framebuffer shim

use crate::display::PixelFormat;
use std::os::raw::c_int;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("display initialization failed: {0}")]
    DisplayInit(String),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("unsupported pixel format: {0}")]
    UnsupportedPixelFormat(PixelFormat),

    #[error("{width}x{height} frame at {bytes_per_pixel} bytes per pixel does not fit in 4 GiB")]
    FrameTooLarge {
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown display backend: {0}")]
    UnknownBackend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// errno value reported to the C caller for this error
    pub fn errno(&self) -> c_int {
        match self {
            Error::UnsupportedPixelFormat(_) | Error::Config(_) | Error::UnknownBackend(_) => {
                libc::EINVAL
            }
            Error::DisplayInit(_) => libc::ENODEV,
            Error::Surface(_) => libc::EIO,
            Error::FrameTooLarge { .. } => libc::EOVERFLOW,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
