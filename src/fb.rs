//! Linux framebuffer ABI
//!
//! Layouts match `struct fb_var_screeninfo` / `struct fb_fix_screeninfo`
//! from `<linux/fb.h>`, plus the translation from a surface's geometry and
//! pixel format into them.

use crate::display::{packed_frame_size, supported_bytes_per_pixel, PixelFormat};
use crate::{Error, Result};
use std::os::raw::{c_char, c_ulong};

/// ioctl request codes
pub const FBIOGET_VSCREENINFO: c_ulong = 0x4600;
pub const FBIOPUT_VSCREENINFO: c_ulong = 0x4601;
pub const FBIOGET_FSCREENINFO: c_ulong = 0x4602;

pub const FB_TYPE_PACKED_PIXELS: u32 = 0;
pub const FB_VISUAL_TRUECOLOR: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbBitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

impl FbBitfield {
    const fn new(offset: u32, length: u32) -> Self {
        Self {
            offset,
            length,
            msb_right: 0,
        }
    }
}

/// Variable screen information (`FBIOGET_VSCREENINFO`)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbVarScreeninfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

/// Fixed screen information (`FBIOGET_FSCREENINFO`)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FbFixScreeninfo {
    pub id: [c_char; 16],
    pub smem_start: c_ulong,
    pub smem_len: u32,
    pub type_: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

/// Build the variable screen info for a surface.
///
/// Virtual resolution always equals the visible one; panning is not
/// supported.
pub fn var_screeninfo(width: u32, height: u32, format: PixelFormat) -> Result<FbVarScreeninfo> {
    let bits_per_pixel = format
        .bits_per_pixel()
        .ok_or(Error::UnsupportedPixelFormat(format))?;
    let mut var = FbVarScreeninfo {
        xres: width,
        yres: height,
        xres_virtual: width,
        yres_virtual: height,
        bits_per_pixel,
        ..Default::default()
    };

    match format {
        PixelFormat::Rgb16 => {
            var.red = FbBitfield::new(11, 5);
            var.green = FbBitfield::new(5, 6);
            var.blue = FbBitfield::new(0, 5);
        }
        PixelFormat::Rgb24 | PixelFormat::Rgb32 => {
            var.red = FbBitfield::new(16, 8);
            var.green = FbBitfield::new(8, 8);
            var.blue = FbBitfield::new(0, 8);
            if format == PixelFormat::Rgb32 {
                var.transp = FbBitfield::new(24, 8);
            }
        }
        PixelFormat::Unsupported(_) => return Err(Error::UnsupportedPixelFormat(format)),
    }

    Ok(var)
}

/// Build the fixed screen info for a surface
pub fn fix_screeninfo(width: u32, height: u32, format: PixelFormat) -> Result<FbFixScreeninfo> {
    let bpp = supported_bytes_per_pixel(format)?;
    let (line_length, smem_len) = packed_frame_size(width, height, bpp)?;
    Ok(FbFixScreeninfo {
        type_: FB_TYPE_PACKED_PIXELS,
        visual: FB_VISUAL_TRUECOLOR,
        smem_len,
        line_length,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_match_kernel() {
        assert_eq!(std::mem::size_of::<FbBitfield>(), 12);
        assert_eq!(std::mem::size_of::<FbVarScreeninfo>(), 160);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(std::mem::size_of::<FbFixScreeninfo>(), 80);
        #[cfg(target_pointer_width = "32")]
        assert_eq!(std::mem::size_of::<FbFixScreeninfo>(), 68);
    }

    #[test]
    fn test_rgb32_var_info() {
        let var = var_screeninfo(640, 480, PixelFormat::Rgb32).unwrap();
        assert_eq!((var.xres, var.yres), (640, 480));
        assert_eq!((var.xres_virtual, var.yres_virtual), (640, 480));
        assert_eq!(var.bits_per_pixel, 32);
        assert_eq!(var.transp, FbBitfield::new(24, 8));
        assert_eq!(var.red, FbBitfield::new(16, 8));
        assert_eq!(var.green, FbBitfield::new(8, 8));
        assert_eq!(var.blue, FbBitfield::new(0, 8));
        assert_eq!((var.xoffset, var.yoffset), (0, 0));
    }

    #[test]
    fn test_rgb16_var_info() {
        let var = var_screeninfo(320, 240, PixelFormat::Rgb16).unwrap();
        assert_eq!(var.bits_per_pixel, 16);
        assert_eq!(var.red, FbBitfield::new(11, 5));
        assert_eq!(var.green, FbBitfield::new(5, 6));
        assert_eq!(var.blue.length, 5);
        assert_eq!(var.transp, FbBitfield::default());
    }

    #[test]
    fn test_rgb24_var_info() {
        let var = var_screeninfo(800, 600, PixelFormat::Rgb24).unwrap();
        assert_eq!(var.bits_per_pixel, 24);
        assert_eq!(var.red.offset, 16);
        assert_eq!(var.green.offset, 8);
        assert_eq!(var.transp.length, 0);
    }

    #[test]
    fn test_fix_info_sizes() {
        let fix = fix_screeninfo(640, 480, PixelFormat::Rgb32).unwrap();
        assert_eq!(fix.visual, FB_VISUAL_TRUECOLOR);
        assert_eq!(fix.smem_len, 640 * 480 * 4);
        assert_eq!(fix.line_length, 640 * 4);
        assert_eq!(fix.id, [0; 16]);

        let fix = fix_screeninfo(100, 10, PixelFormat::Rgb24).unwrap();
        assert_eq!((fix.smem_len, fix.line_length), (3000, 300));

        let fix = fix_screeninfo(100, 10, PixelFormat::Rgb16).unwrap();
        assert_eq!((fix.smem_len, fix.line_length), (2000, 200));
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let err = fix_screeninfo(40000, 30000, PixelFormat::Rgb32).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
        assert_eq!(err.errno(), libc::EOVERFLOW);

        // Largest frame still representable
        let fix = fix_screeninfo(65535, 16384, PixelFormat::Rgb32).unwrap();
        assert_eq!(fix.smem_len, 65535 * 4 * 16384);
    }

    #[test]
    fn test_unsupported_format_is_rejected() {
        let format = PixelFormat::Unsupported(0x00418c04);
        assert!(matches!(
            var_screeninfo(640, 480, format),
            Err(Error::UnsupportedPixelFormat(_))
        ));
        assert!(matches!(
            fix_screeninfo(640, 480, format),
            Err(Error::UnsupportedPixelFormat(_))
        ));
    }
}
