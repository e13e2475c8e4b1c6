//! In-process display backend
//!
//! Surfaces live in heap memory owned by the shim. Nothing is shown on
//! screen; this backend is for headless runs and for exercising the
//! framebuffer translation without a display stack.

use crate::display::{
    packed_frame_size, DisplayBackend, DisplayContext, LockAccess, LockedBuffer, PixelFormat,
    Surface, SurfaceDescription,
};
use crate::{Error, Result};
use std::os::raw::c_void;
use std::ptr::NonNull;
use tracing::{debug, info};

/// Backend producing heap-backed surfaces of a fixed geometry
pub struct MemoryBackend {
    width: u32,
    height: u32,
    format: PixelFormat,
    initialized: bool,
    options: Vec<(String, Option<String>)>,
}

impl MemoryBackend {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            initialized: false,
            options: Vec::new(),
        }
    }

    /// Options set so far, in order
    pub fn options(&self) -> &[(String, Option<String>)] {
        &self.options
    }
}

impl DisplayBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn init(&mut self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::DisplayInit(format!(
                "invalid geometry {}x{}",
                self.width, self.height
            )));
        }
        MemorySurface::frame_size(self.width, self.height, self.format)?;
        self.initialized = true;
        Ok(())
    }

    fn set_option(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        debug!("memory backend option {}={:?}", name, value);
        self.options
            .push((name.to_string(), value.map(str::to_string)));
        Ok(())
    }

    fn create_context(&mut self) -> Result<Box<dyn DisplayContext>> {
        if !self.initialized {
            return Err(Error::DisplayInit("backend not initialized".into()));
        }
        Ok(Box::new(MemoryContext {
            width: self.width,
            height: self.height,
            format: self.format,
            fullscreen: false,
        }))
    }
}

struct MemoryContext {
    width: u32,
    height: u32,
    format: PixelFormat,
    fullscreen: bool,
}

impl DisplayContext for MemoryContext {
    fn set_fullscreen_exclusive(&mut self) -> Result<()> {
        self.fullscreen = true;
        Ok(())
    }

    fn create_surface(&mut self, desc: &SurfaceDescription) -> Result<Box<dyn Surface>> {
        if desc.primary && !self.fullscreen {
            return Err(Error::Surface(
                "primary surface requires fullscreen mode".into(),
            ));
        }
        info!(
            "Created memory surface {}x{} ({})",
            self.width, self.height, self.format
        );
        Ok(Box::new(MemorySurface::new(
            self.width,
            self.height,
            self.format,
        )?))
    }
}

/// Heap-backed surface
pub struct MemorySurface {
    width: u32,
    height: u32,
    format: PixelFormat,
    pitch: u32,
    pixels: Box<[u8]>,
    locked: bool,
}

impl MemorySurface {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let (pitch, size) = Self::frame_size(width, height, format)?;
        let pixels = vec![0u8; size as usize].into_boxed_slice();
        Ok(Self {
            width,
            height,
            format,
            pitch,
            pixels,
            locked: false,
        })
    }

    fn frame_size(width: u32, height: u32, format: PixelFormat) -> Result<(u32, u32)> {
        // Unknown formats still get backing memory, sized as 32 bpp
        let bpp = format.bytes_per_pixel().unwrap_or(4);
        packed_frame_size(width, height, bpp)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Surface for MemorySurface {
    fn size(&self) -> Result<(u32, u32)> {
        Ok((self.width, self.height))
    }

    fn pixel_format(&self) -> Result<PixelFormat> {
        Ok(self.format)
    }

    fn lock(&mut self, _access: LockAccess) -> Result<LockedBuffer> {
        if self.locked {
            return Err(Error::Surface("surface already locked".into()));
        }
        let addr = NonNull::new(self.pixels.as_mut_ptr() as *mut c_void)
            .ok_or_else(|| Error::Surface("surface has no backing memory".into()))?;
        self.locked = true;
        Ok(LockedBuffer {
            addr,
            pitch: self.pitch,
        })
    }

    fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Err(Error::Surface("surface not locked".into()));
        }
        self.locked = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_requires_init() {
        let mut backend = MemoryBackend::new(640, 480, PixelFormat::Rgb32);
        assert!(backend.create_context().is_err());
        backend.init().unwrap();
        assert!(backend.create_context().is_ok());
    }

    #[test]
    fn test_options_are_recorded() {
        let mut backend = MemoryBackend::new(640, 480, PixelFormat::Rgb32);
        backend.set_option("no-vt", None).unwrap();
        backend.set_option("mode", Some("640x480")).unwrap();
        assert_eq!(
            backend.options(),
            &[
                ("no-vt".to_string(), None),
                ("mode".to_string(), Some("640x480".to_string())),
            ]
        );
    }

    #[test]
    fn test_zero_geometry_fails_init() {
        let mut backend = MemoryBackend::new(0, 480, PixelFormat::Rgb16);
        assert!(matches!(backend.init(), Err(Error::DisplayInit(_))));
    }

    #[test]
    fn test_oversized_geometry_fails_init() {
        let mut backend = MemoryBackend::new(40000, 30000, PixelFormat::Rgb32);
        let err = backend.init().unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
        assert!(backend.create_context().is_err());

        assert!(MemorySurface::new(u32::MAX, 2, PixelFormat::Rgb16).is_err());
        // Unknown formats are sized at 4 bytes per pixel
        assert!(MemorySurface::new(40000, 30000, PixelFormat::Unsupported(1)).is_err());
    }

    #[test]
    fn test_primary_surface_needs_fullscreen() {
        let mut backend = MemoryBackend::new(320, 240, PixelFormat::Rgb16);
        backend.init().unwrap();
        let mut ctx = backend.create_context().unwrap();
        let desc = SurfaceDescription::primary_fullscreen();
        assert!(ctx.create_surface(&desc).is_err());

        ctx.set_fullscreen_exclusive().unwrap();
        let surface = ctx.create_surface(&desc).unwrap();
        assert_eq!(surface.size().unwrap(), (320, 240));
        assert_eq!(surface.pixel_format().unwrap(), PixelFormat::Rgb16);
    }

    #[test]
    fn test_surface_lock_state() {
        let mut surface = MemorySurface::new(10, 2, PixelFormat::Rgb24).unwrap();

        let buf = surface.lock(LockAccess::Write).unwrap();
        assert_eq!(buf.pitch, 30);
        assert!(surface.lock(LockAccess::Write).is_err());

        surface.unlock().unwrap();
        assert!(surface.unlock().is_err());
    }
}
