//! DirectFB display backend
//!
//! Raw bindings for the few DirectFB calls the shim needs. Interface
//! structs are vtables; only the entries up to the last one used are
//! spelled out, in the order of `directfb.h` from DirectFB 1.7.

use crate::display::{
    DisplayBackend, DisplayContext, LockAccess, LockedBuffer, PixelFormat, Surface,
    SurfaceDescription,
};
use crate::{Error, Result};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use tracing::{debug, info};

type DFBResult = c_int;

const DFB_OK: DFBResult = 0;

/// DFBCooperativeLevel
const DFSCL_FULLSCREEN: c_uint = 0x0000_0001;

/// DFBSurfaceDescriptionFlags
const DSDESC_CAPS: c_uint = 0x0000_0001;

/// DFBSurfaceCapabilities
const DSCAPS_NONE: c_uint = 0x0000_0000;
const DSCAPS_PRIMARY: c_uint = 0x0000_0001;

/// DFBSurfaceLockFlags
const DSLF_READ: c_uint = 0x0000_0001;
const DSLF_WRITE: c_uint = 0x0000_0002;

/// DFBSurfacePixelFormat values
const DSPF_RGB16: c_uint = 0x0020_0801;
const DSPF_RGB24: c_uint = 0x0030_0c02;
const DSPF_RGB32: c_uint = 0x0040_0c03;

type Slot = *const c_void;

#[repr(C)]
#[allow(dead_code)]
struct IDirectFB {
    priv_: *mut c_void,
    magic: c_int,
    refs: c_int,
    add_ref: Option<unsafe extern "C" fn(*mut IDirectFB) -> DFBResult>,
    release: Option<unsafe extern "C" fn(*mut IDirectFB) -> DFBResult>,
    set_cooperative_level: Option<unsafe extern "C" fn(*mut IDirectFB, c_uint) -> DFBResult>,
    get_device_description: Slot,
    enum_video_modes: Slot,
    set_video_mode: Slot,
    create_surface: Option<
        unsafe extern "C" fn(
            *mut IDirectFB,
            *const DFBSurfaceDescription,
            *mut *mut IDirectFBSurface,
        ) -> DFBResult,
    >,
}

#[repr(C)]
#[allow(dead_code)]
struct IDirectFBSurface {
    priv_: *mut c_void,
    magic: c_int,
    refs: c_int,
    add_ref: Option<unsafe extern "C" fn(*mut IDirectFBSurface) -> DFBResult>,
    release: Option<unsafe extern "C" fn(*mut IDirectFBSurface) -> DFBResult>,
    get_capabilities: Slot,
    get_position: Slot,
    get_size:
        Option<unsafe extern "C" fn(*mut IDirectFBSurface, *mut c_int, *mut c_int) -> DFBResult>,
    get_visible_rectangle: Slot,
    get_pixel_format: Option<unsafe extern "C" fn(*mut IDirectFBSurface, *mut c_uint) -> DFBResult>,
    get_color_space: Slot,
    get_acceleration_mask: Slot,
    get_palette: Slot,
    set_palette: Slot,
    set_alpha_ramp: Slot,
    get_stereo_eye: Slot,
    set_stereo_eye: Slot,
    lock: Option<
        unsafe extern "C" fn(
            *mut IDirectFBSurface,
            c_uint,
            *mut *mut c_void,
            *mut c_int,
        ) -> DFBResult,
    >,
    get_framebuffer_offset: Slot,
    get_physical_address: Slot,
    unlock: Option<unsafe extern "C" fn(*mut IDirectFBSurface) -> DFBResult>,
}

/// Leading fields of DFBSurfaceDescription. DirectFB only reads the fields
/// selected by `flags`; the tail is padding for the rest of the struct.
#[repr(C)]
#[allow(dead_code)]
struct DFBSurfaceDescription {
    flags: c_uint,
    caps: c_uint,
    width: c_int,
    height: c_int,
    pixelformat: c_uint,
    _rest: [u64; 16],
}

#[link(name = "directfb")]
extern "C" {
    fn DirectFBInit(argc: *mut c_int, argv: *mut *mut *mut c_char) -> DFBResult;
    fn DirectFBSetOption(name: *const c_char, value: *const c_char) -> DFBResult;
    fn DirectFBCreate(interface: *mut *mut IDirectFB) -> DFBResult;
    fn DirectFBErrorString(result: DFBResult) -> *const c_char;
}

fn describe(result: DFBResult) -> String {
    let msg = unsafe { DirectFBErrorString(result) };
    if msg.is_null() {
        format!("DirectFB error {}", result)
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

fn check(what: &str, result: DFBResult) -> std::result::Result<(), String> {
    if result == DFB_OK {
        Ok(())
    } else {
        Err(format!("{}: {}", what, describe(result)))
    }
}

fn missing(what: &str) -> String {
    format!("{}: not provided by this DirectFB build", what)
}

pub struct DirectFbBackend;

impl DirectFbBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DirectFbBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayBackend for DirectFbBackend {
    fn name(&self) -> &'static str {
        "directfb"
    }

    fn init(&mut self) -> Result<()> {
        info!("Initializing DirectFB");
        let result = unsafe { DirectFBInit(ptr::null_mut(), ptr::null_mut()) };
        check("DirectFBInit", result).map_err(Error::DisplayInit)
    }

    fn set_option(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let name_c = CString::new(name)
            .map_err(|_| Error::Config(format!("option name {:?} contains NUL", name)))?;
        let value_c = value
            .map(CString::new)
            .transpose()
            .map_err(|_| Error::Config(format!("option value for {} contains NUL", name)))?;
        let value_ptr = value_c.as_ref().map_or(ptr::null(), |v| v.as_ptr());
        let result = unsafe { DirectFBSetOption(name_c.as_ptr(), value_ptr) };
        check("DirectFBSetOption", result).map_err(Error::DisplayInit)
    }

    fn create_context(&mut self) -> Result<Box<dyn DisplayContext>> {
        let mut dfb: *mut IDirectFB = ptr::null_mut();
        let result = unsafe { DirectFBCreate(&mut dfb) };
        check("DirectFBCreate", result).map_err(Error::DisplayInit)?;
        let dfb = NonNull::new(dfb)
            .ok_or_else(|| Error::DisplayInit("DirectFBCreate returned no interface".into()))?;
        debug!("DirectFB interface created at {:p}", dfb.as_ptr());
        Ok(Box::new(DirectFbContext { dfb }))
    }
}

struct DirectFbContext {
    dfb: NonNull<IDirectFB>,
}

// DirectFB interfaces are only driven from behind the shim's session lock
unsafe impl Send for DirectFbContext {}

impl DisplayContext for DirectFbContext {
    fn set_fullscreen_exclusive(&mut self) -> Result<()> {
        let dfb = self.dfb.as_ptr();
        let set_level = unsafe { (*dfb).set_cooperative_level }
            .ok_or_else(|| Error::DisplayInit(missing("SetCooperativeLevel")))?;
        let result = unsafe { set_level(dfb, DFSCL_FULLSCREEN) };
        check("SetCooperativeLevel", result).map_err(Error::DisplayInit)
    }

    fn create_surface(&mut self, desc: &SurfaceDescription) -> Result<Box<dyn Surface>> {
        let dfb = self.dfb.as_ptr();
        let create = unsafe { (*dfb).create_surface }
            .ok_or_else(|| Error::Surface(missing("CreateSurface")))?;

        let dsc = DFBSurfaceDescription {
            flags: DSDESC_CAPS,
            caps: if desc.primary { DSCAPS_PRIMARY } else { DSCAPS_NONE },
            width: 0,
            height: 0,
            pixelformat: 0,
            _rest: [0; 16],
        };
        let mut surface: *mut IDirectFBSurface = ptr::null_mut();
        let result = unsafe { create(dfb, &dsc, &mut surface) };
        check("CreateSurface", result).map_err(Error::Surface)?;
        let surface = NonNull::new(surface)
            .ok_or_else(|| Error::Surface("CreateSurface returned no surface".into()))?;
        info!("DirectFB primary surface created");
        Ok(Box::new(DirectFbSurface { surface }))
    }
}

impl Drop for DirectFbContext {
    fn drop(&mut self) {
        let dfb = self.dfb.as_ptr();
        if let Some(release) = unsafe { (*dfb).release } {
            unsafe { release(dfb) };
        }
        debug!("DirectFB interface released");
    }
}

struct DirectFbSurface {
    surface: NonNull<IDirectFBSurface>,
}

unsafe impl Send for DirectFbSurface {}

impl DirectFbSurface {
    fn vtable(&self) -> &IDirectFBSurface {
        unsafe { self.surface.as_ref() }
    }
}

fn pixel_format_from_dspf(format: c_uint) -> PixelFormat {
    match format {
        DSPF_RGB16 => PixelFormat::Rgb16,
        DSPF_RGB24 => PixelFormat::Rgb24,
        DSPF_RGB32 => PixelFormat::Rgb32,
        other => PixelFormat::Unsupported(other),
    }
}

impl Surface for DirectFbSurface {
    fn size(&self) -> Result<(u32, u32)> {
        let get_size = self
            .vtable()
            .get_size
            .ok_or_else(|| Error::Surface(missing("GetSize")))?;
        let (mut width, mut height) = (0, 0);
        let result = unsafe { get_size(self.surface.as_ptr(), &mut width, &mut height) };
        check("GetSize", result).map_err(Error::Surface)?;
        Ok((width.max(0) as u32, height.max(0) as u32))
    }

    fn pixel_format(&self) -> Result<PixelFormat> {
        let get_format = self
            .vtable()
            .get_pixel_format
            .ok_or_else(|| Error::Surface(missing("GetPixelFormat")))?;
        let mut format: c_uint = 0;
        let result = unsafe { get_format(self.surface.as_ptr(), &mut format) };
        check("GetPixelFormat", result).map_err(Error::Surface)?;
        Ok(pixel_format_from_dspf(format))
    }

    fn lock(&mut self, access: LockAccess) -> Result<LockedBuffer> {
        let lock = self
            .vtable()
            .lock
            .ok_or_else(|| Error::Surface(missing("Lock")))?;
        let flags = match access {
            LockAccess::Read => DSLF_READ,
            LockAccess::Write => DSLF_WRITE,
        };
        let mut addr: *mut c_void = ptr::null_mut();
        let mut pitch: c_int = 0;
        let result = unsafe { lock(self.surface.as_ptr(), flags, &mut addr, &mut pitch) };
        check("Lock", result).map_err(Error::Surface)?;
        let addr =
            NonNull::new(addr).ok_or_else(|| Error::Surface("Lock returned no memory".into()))?;
        Ok(LockedBuffer {
            addr,
            pitch: pitch.max(0) as u32,
        })
    }

    fn unlock(&mut self) -> Result<()> {
        let unlock = self
            .vtable()
            .unlock
            .ok_or_else(|| Error::Surface(missing("Unlock")))?;
        let result = unsafe { unlock(self.surface.as_ptr()) };
        check("Unlock", result).map_err(Error::Surface)
    }
}

impl Drop for DirectFbSurface {
    fn drop(&mut self) {
        if let Some(release) = self.vtable().release {
            unsafe { release(self.surface.as_ptr()) };
        }
        debug!("DirectFB surface released");
    }
}
