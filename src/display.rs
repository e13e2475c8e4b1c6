//! Display backend capability interface
//!
//! The shim only needs a handful of operations from the display stack it
//! sits on: bring the subsystem up, get a fullscreen context, create the
//! primary surface, and query/lock that surface. Any backend offering these
//! can drive a framebuffer session.
//!
//! Releasing a context or surface is `Drop`.

use crate::{Error, Result};
use std::fmt;
use std::os::raw::c_void;
use std::ptr::NonNull;
use tracing::warn;

/// Pixel layout of a surface, as far as the framebuffer ABI can express it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 16 bpp, 5-6-5, no alpha
    Rgb16,
    /// 24 bpp, 8-8-8, no alpha
    Rgb24,
    /// 32 bpp, 8-8-8 with the top byte as alpha
    Rgb32,
    /// Anything else, carrying the backend's own format code
    Unsupported(u32),
}

impl PixelFormat {
    pub fn bits_per_pixel(&self) -> Option<u32> {
        self.bytes_per_pixel().map(|b| b * 8)
    }

    pub fn bytes_per_pixel(&self) -> Option<u32> {
        match self {
            PixelFormat::Rgb16 => Some(2),
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Rgb32 => Some(4),
            PixelFormat::Unsupported(_) => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Rgb16 => f.write_str("rgb16"),
            PixelFormat::Rgb24 => f.write_str("rgb24"),
            PixelFormat::Rgb32 => f.write_str("rgb32"),
            PixelFormat::Unsupported(code) => write!(f, "0x{:08x}", code),
        }
    }
}

/// How the primary surface should be created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDescription {
    /// Cover the whole screen
    pub fullscreen: bool,
    /// Request the primary (visible) surface
    pub primary: bool,
}

impl SurfaceDescription {
    pub fn primary_fullscreen() -> Self {
        Self {
            fullscreen: true,
            primary: true,
        }
    }
}

/// Access requested when locking a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAccess {
    Read,
    Write,
}

/// Memory handed out by a surface lock
#[derive(Debug, Clone, Copy)]
pub struct LockedBuffer {
    pub addr: NonNull<c_void>,
    /// Row pitch in bytes
    pub pitch: u32,
}

/// Entry point of a display stack
pub trait DisplayBackend: Send {
    /// Short name used in logs and configuration
    fn name(&self) -> &'static str;

    /// Initialize the display subsystem
    fn init(&mut self) -> Result<()>;

    /// Set a subsystem option (e.g. "no-vt")
    fn set_option(&mut self, name: &str, value: Option<&str>) -> Result<()>;

    /// Create a connection to the display
    fn create_context(&mut self) -> Result<Box<dyn DisplayContext>>;
}

/// An owned display connection
pub trait DisplayContext: Send {
    /// Take the display over in fullscreen exclusive mode
    fn set_fullscreen_exclusive(&mut self) -> Result<()>;

    fn create_surface(&mut self, desc: &SurfaceDescription) -> Result<Box<dyn Surface>>;
}

/// A drawable owned by a display context
pub trait Surface: Send {
    fn size(&self) -> Result<(u32, u32)>;

    fn pixel_format(&self) -> Result<PixelFormat>;

    fn lock(&mut self, access: LockAccess) -> Result<LockedBuffer>;

    fn unlock(&mut self) -> Result<()>;
}

/// Scoped write lock on a surface, unlocked on drop
pub struct WriteLock<'a> {
    surface: &'a mut dyn Surface,
    buffer: LockedBuffer,
}

impl<'a> WriteLock<'a> {
    pub fn acquire(surface: &'a mut dyn Surface) -> Result<Self> {
        let buffer = surface.lock(LockAccess::Write)?;
        Ok(Self { surface, buffer })
    }

    pub fn addr(&self) -> NonNull<c_void> {
        self.buffer.addr
    }

    pub fn pitch(&self) -> u32 {
        self.buffer.pitch
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.surface.unlock() {
            warn!("Failed to unlock surface: {}", e);
        }
    }
}

/// Validate a surface format for the framebuffer ABI
pub fn supported_bytes_per_pixel(format: PixelFormat) -> Result<u32> {
    format
        .bytes_per_pixel()
        .ok_or(Error::UnsupportedPixelFormat(format))
}

/// Row pitch and total size in bytes of a tightly packed frame
pub fn packed_frame_size(width: u32, height: u32, bytes_per_pixel: u32) -> Result<(u32, u32)> {
    width
        .checked_mul(bytes_per_pixel)
        .and_then(|pitch| Some((pitch, pitch.checked_mul(height)?)))
        .ok_or(Error::FrameTooLarge {
            width,
            height,
            bytes_per_pixel,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySurface;

    #[test]
    fn test_pixel_format_sizes() {
        assert_eq!(PixelFormat::Rgb16.bits_per_pixel(), Some(16));
        assert_eq!(PixelFormat::Rgb24.bytes_per_pixel(), Some(3));
        assert_eq!(PixelFormat::Rgb32.bits_per_pixel(), Some(32));
        assert_eq!(PixelFormat::Unsupported(0x1234).bytes_per_pixel(), None);
        assert!(matches!(
            supported_bytes_per_pixel(PixelFormat::Unsupported(9)),
            Err(Error::UnsupportedPixelFormat(PixelFormat::Unsupported(9)))
        ));
    }

    #[test]
    fn test_packed_frame_size() {
        assert_eq!(packed_frame_size(640, 480, 4).unwrap(), (2560, 2560 * 480));
        assert_eq!(packed_frame_size(65535, 65535, 1).unwrap(), (65535, 65535 * 65535));
        assert!(matches!(
            packed_frame_size(40000, 30000, 4),
            Err(Error::FrameTooLarge { width: 40000, height: 30000, bytes_per_pixel: 4 })
        ));
        // Pitch alone overflows
        assert!(packed_frame_size(u32::MAX, 1, 2).is_err());
    }

    #[test]
    fn test_write_lock_unlocks_on_drop() {
        let mut surface = MemorySurface::new(4, 4, PixelFormat::Rgb32).unwrap();
        let addr = {
            let lock = WriteLock::acquire(&mut surface).unwrap();
            assert_eq!(lock.pitch(), 16);
            lock.addr()
        };
        assert!(!surface.is_locked());

        // Same backing memory on the next lock
        let lock = WriteLock::acquire(&mut surface).unwrap();
        assert_eq!(lock.addr(), addr);
    }
}
