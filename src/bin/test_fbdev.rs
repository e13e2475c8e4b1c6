//! Test binary for the framebuffer shim
//!
//! Links the shim directly, so the libc calls below go through it without
//! LD_PRELOAD. Runs two full sessions to check that state resets between
//! them.

use fbdev_shim::fb::{FbFixScreeninfo, FbVarScreeninfo, FBIOGET_FSCREENINFO, FBIOGET_VSCREENINFO};
use std::ffi::CString;
use std::ptr;

fn main() {
    fbdev_shim::c_api::init_logging();

    let device = std::env::args().nth(1).unwrap_or_else(|| "/dev/fb0".to_string());
    println!("=== Framebuffer Shim Test ({}) ===\n", device);

    for round in 1..=2 {
        println!("--- Session {} ---", round);
        if let Err(e) = run_session(&device) {
            println!("  FAILED: {}", e);
            std::process::exit(1);
        }
    }

    println!("\n=== All tests passed ===");
}

fn run_session(device: &str) -> Result<(), String> {
    let path = CString::new(device).map_err(|e| e.to_string())?;

    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(format!("open: {}", std::io::Error::last_os_error()));
    }
    println!("  OK: opened {} as fd {}", device, fd);

    let mut var = FbVarScreeninfo::default();
    if unsafe { libc::ioctl(fd, FBIOGET_VSCREENINFO as _, &mut var as *mut FbVarScreeninfo) } != 0 {
        return Err(format!("FBIOGET_VSCREENINFO: {}", std::io::Error::last_os_error()));
    }
    println!(
        "  OK: {}x{} (virtual {}x{}), {} bpp",
        var.xres, var.yres, var.xres_virtual, var.yres_virtual, var.bits_per_pixel
    );
    println!(
        "      red {}/{} green {}/{} blue {}/{} transp {}/{}",
        var.red.offset,
        var.red.length,
        var.green.offset,
        var.green.length,
        var.blue.offset,
        var.blue.length,
        var.transp.offset,
        var.transp.length
    );

    let mut fix = FbFixScreeninfo::default();
    if unsafe { libc::ioctl(fd, FBIOGET_FSCREENINFO as _, &mut fix as *mut FbFixScreeninfo) } != 0 {
        return Err(format!("FBIOGET_FSCREENINFO: {}", std::io::Error::last_os_error()));
    }
    println!(
        "  OK: smem_len={} line_length={} visual={}",
        fix.smem_len, fix.line_length, fix.visual
    );

    let len = fix.smem_len as usize;
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED || addr.is_null() {
        return Err(format!("mmap: {}", std::io::Error::last_os_error()));
    }
    println!("  OK: mapped {} bytes at {:p}", len, addr);

    paint_gradient(addr as *mut u8, &var, &fix);
    println!("  OK: painted test pattern");

    if unsafe { libc::munmap(addr, len) } != 0 {
        return Err(format!("munmap: {}", std::io::Error::last_os_error()));
    }
    if unsafe { libc::close(fd) } != 0 {
        return Err(format!("close: {}", std::io::Error::last_os_error()));
    }
    println!("  OK: unmapped and closed");
    Ok(())
}

/// Horizontal red ramp, vertical green ramp
fn paint_gradient(base: *mut u8, var: &FbVarScreeninfo, fix: &FbFixScreeninfo) {
    let bytes_pp = (var.bits_per_pixel / 8) as usize;
    let max = |len: u32| (1u32 << len) - 1;

    for y in 0..var.yres {
        let row = unsafe { base.add(y as usize * fix.line_length as usize) };
        for x in 0..var.xres {
            let r = x * max(var.red.length) / var.xres.max(1);
            let g = y * max(var.green.length) / var.yres.max(1);
            let pixel = (r << var.red.offset)
                | (g << var.green.offset)
                | (max(var.transp.length) << var.transp.offset);
            let bytes = pixel.to_le_bytes();
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), row.add(x as usize * bytes_pp), bytes_pp);
            }
        }
    }
}
