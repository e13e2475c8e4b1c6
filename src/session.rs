//! Framebuffer session state machine
//!
//! One [`Interceptor`] decides, per intercepted call, whether the call
//! belongs to the emulated framebuffer or has to be forwarded to libc. At
//! most one [`Session`] exists at a time; it lives from the open of a
//! framebuffer path to the close of the descriptor that open returned.

use crate::config::Config;
use crate::display::{DisplayBackend, DisplayContext, Surface, SurfaceDescription, WriteLock};
use crate::fb::{self, FbFixScreeninfo, FbVarScreeninfo};
use crate::real::RealIo;
use crate::{Error, Result};
use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_ulong, c_void};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use tracing::{debug, error, info, warn};

/// Outcome of offering a call to the interceptor
#[derive(Debug)]
pub enum Intercept<T> {
    /// The shim handled the call
    Handled(T),
    /// Not ours; the caller must invoke the real implementation
    Forward,
}

impl<T> Intercept<T> {
    pub fn is_forward(&self) -> bool {
        matches!(self, Intercept::Forward)
    }

    pub fn handled(self) -> Option<T> {
        match self {
            Intercept::Handled(v) => Some(v),
            Intercept::Forward => None,
        }
    }
}

/// Data the C layer copies into the ioctl argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Var(FbVarScreeninfo),
    Fix(FbFixScreeninfo),
    /// Accepted without touching the argument
    None,
}

/// State of the active framebuffer emulation
pub struct Session {
    fd: RawFd,
    // Field order matters: the surface is released before its context
    surface: Box<dyn Surface>,
    context: Box<dyn DisplayContext>,
    mapped: Option<NonNull<c_void>>,
}

// The mapped address is only used as an identity key, never dereferenced here
unsafe impl Send for Session {}

impl Session {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn mapped_addr(&self) -> Option<NonNull<c_void>> {
        self.mapped
    }

    fn surface_geometry(&self) -> Result<(u32, u32, crate::display::PixelFormat)> {
        let (width, height) = self.surface.size()?;
        let format = self.surface.pixel_format()?;
        Ok((width, height, format))
    }

    fn release(self) {
        let Session {
            fd,
            surface,
            context,
            ..
        } = self;
        drop(surface);
        drop(context);
        debug!("Released surface and display context of fd {}", fd);
    }
}

/// Routes intercepted calls to the emulated framebuffer or to libc
pub struct Interceptor {
    config: Config,
    // Created on the first framebuffer open
    backend: Option<Box<dyn DisplayBackend>>,
    session: Option<Session>,
}

impl Interceptor {
    /// Use an explicit backend instead of the configured one
    pub fn new(config: Config, backend: Box<dyn DisplayBackend>) -> Self {
        Self {
            config,
            backend: Some(backend),
            session: None,
        }
    }

    /// The backend named by `config` is instantiated at the first session
    /// start, so a bad backend choice fails that open rather than the load.
    pub fn from_config(config: Config) -> Self {
        info!(
            "Framebuffer shim ready (backend={:?}, device prefix={:?})",
            config.backend, config.device_prefix
        );
        Self {
            config,
            backend: None,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Descriptor of the active session, if any
    pub fn device_fd(&self) -> Option<RawFd> {
        self.session.as_ref().map(Session::fd)
    }

    fn session_for(&mut self, fd: RawFd) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.fd == fd)
    }

    /// Handle `open`. Framebuffer paths start a session when none is active.
    pub fn open(
        &mut self,
        real: &dyn RealIo,
        path: &CStr,
        flags: c_int,
    ) -> Intercept<Result<RawFd>> {
        let path_str = path.to_string_lossy();
        if !self.config.is_framebuffer_path(&path_str) {
            return Intercept::Forward;
        }
        if let Some(session) = &self.session {
            warn!(
                "open({}) while fd {} is already emulating a framebuffer, passing through",
                path_str, session.fd
            );
            return Intercept::Forward;
        }

        info!("Intercepting open of {}", path_str);
        Intercept::Handled(self.start_session(real, flags))
    }

    fn start_session(&mut self, real: &dyn RealIo, flags: c_int) -> Result<RawFd> {
        let discard = CString::new(self.config.discard_path.as_str())
            .map_err(|_| Error::Config("discard path contains a NUL byte".into()))?;
        // Creation flags make no sense for the substitute device
        let flags = flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_TMPFILE);
        let fd = unsafe { real.open(discard.as_ptr(), flags, 0) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            error!("Failed to open {}: {}", self.config.discard_path, err);
            return Err(err.into());
        }

        match self.create_display() {
            Ok((context, surface)) => {
                self.session = Some(Session {
                    fd,
                    surface,
                    context,
                    mapped: None,
                });
                info!("Framebuffer session started on fd {}", fd);
                Ok(fd)
            }
            Err(e) => {
                error!("Display setup failed: {}", e);
                unsafe {
                    real.close(fd);
                }
                Err(e)
            }
        }
    }

    fn create_display(&mut self) -> Result<(Box<dyn DisplayContext>, Box<dyn Surface>)> {
        let backend = match &mut self.backend {
            Some(backend) => backend,
            empty => empty.insert(self.config.create_backend()?),
        };
        debug!("Bringing up {} display", backend.name());
        backend.init()?;
        backend.set_option("no-vt", None)?;
        let mut context = backend.create_context()?;
        context.set_fullscreen_exclusive()?;
        let surface = context.create_surface(&SurfaceDescription::primary_fullscreen())?;
        Ok((context, surface))
    }

    /// Handle `ioctl`. Only the two screen-info queries produce data.
    pub fn ioctl(&mut self, fd: RawFd, request: c_ulong) -> Intercept<Result<IoctlReply>> {
        let Some(session) = self.session_for(fd) else {
            return Intercept::Forward;
        };

        let reply = match request {
            fb::FBIOGET_VSCREENINFO => session
                .surface_geometry()
                .and_then(|(w, h, format)| fb::var_screeninfo(w, h, format))
                .map(IoctlReply::Var),
            fb::FBIOGET_FSCREENINFO => session
                .surface_geometry()
                .and_then(|(w, h, format)| fb::fix_screeninfo(w, h, format))
                .map(IoctlReply::Fix),
            fb::FBIOPUT_VSCREENINFO => {
                debug!("ioctl: FBIOPUT_VSCREENINFO ignored, mode is fixed by the surface");
                Ok(IoctlReply::None)
            }
            other => {
                debug!("ioctl: request 0x{:x} on fd {} accepted as no-op", other, fd);
                Ok(IoctlReply::None)
            }
        };

        if let Err(e) = &reply {
            warn!("ioctl 0x{:x} on fd {} failed: {}", request, fd, e);
        }
        Intercept::Handled(reply)
    }

    /// Handle `mmap`. Returns the surface's base address.
    pub fn mmap(&mut self, fd: RawFd, len: usize) -> Intercept<Result<NonNull<c_void>>> {
        let Some(session) = self.session_for(fd) else {
            return Intercept::Forward;
        };

        let result = session.surface_geometry().and_then(|(width, _, format)| {
            let (addr, pitch) = {
                let lock = WriteLock::acquire(session.surface.as_mut())?;
                (lock.addr(), lock.pitch())
            };
            let line_length = format.bytes_per_pixel().and_then(|bpp| bpp.checked_mul(width));
            if let Some(line_length) = line_length.filter(|&l| l != pitch) {
                warn!(
                    "Surface pitch {} differs from reported line length {}",
                    pitch, line_length
                );
            }
            Ok(addr)
        });

        match &result {
            Ok(addr) => {
                session.mapped = Some(*addr);
                debug!("mmap(fd={}, len={}) -> {:p}", fd, len, addr.as_ptr());
            }
            Err(e) => warn!("mmap on fd {} failed: {}", fd, e),
        }
        Intercept::Handled(result)
    }

    /// Handle `munmap`. Only the recorded mapping is ours.
    pub fn munmap(&mut self, addr: *mut c_void) -> Intercept<()> {
        match self.session.as_mut() {
            Some(session) if session.mapped.map(NonNull::as_ptr) == Some(addr) => {
                session.mapped = None;
                debug!("munmap({:p}) released framebuffer mapping", addr);
                Intercept::Handled(())
            }
            _ => Intercept::Forward,
        }
    }

    /// Handle `close`. Ends the session owning `fd`.
    pub fn close(&mut self, real: &dyn RealIo, fd: RawFd) -> Intercept<Result<()>> {
        if self.device_fd() != Some(fd) {
            return Intercept::Forward;
        }
        let Some(session) = self.session.take() else {
            return Intercept::Forward;
        };

        if session.mapped.is_some() {
            debug!("Closing fd {} with the framebuffer still mapped", fd);
        }
        session.release();
        if unsafe { real.close(fd) } != 0 {
            warn!(
                "Closing substitute descriptor {} failed: {}",
                fd,
                std::io::Error::last_os_error()
            );
        }
        info!("Framebuffer session on fd {} closed", fd);
        Intercept::Handled(Ok(()))
    }
}
