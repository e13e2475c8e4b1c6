//! Linux framebuffer shim over a userspace display stack
//!
//! This library lets programs written against `/dev/fb*` run unmodified on
//! top of another display system (DirectFB, or an in-process surface).
//! Preloaded with `LD_PRELOAD`, it intercepts `open`, `ioctl`, `mmap`,
//! `munmap` and `close`, and answers them for the framebuffer device from
//! a single fullscreen display surface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │           Legacy framebuffer application                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!           open / ioctl / mmap / munmap / close
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      fbdev-shim                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   c_api     │  │  session    │  │  real (RTLD_NEXT)   │  │
//! │  │ (exports)   │─▶│ (one fb fd) │  │  pass-through calls │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     display backend trait
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │             DirectFB  /  in-memory surface                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```sh
//! FBDEV_SHIM_BACKEND=directfb LD_PRELOAD=libfbdev_shim.so ./fbdemo
//! ```

pub mod c_api;
pub mod config;
#[cfg(feature = "directfb")]
pub mod directfb;
pub mod display;
pub mod error;
pub mod fb;
pub mod memory;
pub mod real;
pub mod session;

pub use config::Config;
pub use display::{DisplayBackend, DisplayContext, PixelFormat, Surface};
pub use error::Error;
pub use session::{Intercept, Interceptor};

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
