//! The genuine libc implementations behind the intercepted symbols
//!
//! Resolved once per process with `dlsym(RTLD_NEXT, ...)` and cached, so
//! forwarded calls never come back into the shim.

use std::os::raw::{c_char, c_int, c_ulong, c_void};
use std::sync::OnceLock;
use tracing::{error, info};

type OpenFn = unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
type MmapFn = unsafe extern "C" fn(*mut c_void, libc::size_t, c_int, c_int, c_int, libc::off_t) -> *mut c_void;
type Mmap64Fn = unsafe extern "C" fn(*mut c_void, libc::size_t, c_int, c_int, c_int, libc::off64_t) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> c_int;

/// Forwarding target for calls the shim does not handle
pub trait RealIo {
    unsafe fn open(&self, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int;
    unsafe fn open64(&self, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int;
    unsafe fn close(&self, fd: c_int) -> c_int;
    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int;
    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void;
    unsafe fn mmap64(
        &self,
        addr: *mut c_void,
        len: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off64_t,
    ) -> *mut c_void;
    unsafe fn munmap(&self, addr: *mut c_void, len: libc::size_t) -> c_int;
}

/// Function pointers to the next definitions in the lookup chain
pub struct LibcCalls {
    open: Option<OpenFn>,
    open64: Option<OpenFn>,
    close: Option<CloseFn>,
    ioctl: Option<IoctlFn>,
    mmap: Option<MmapFn>,
    mmap64: Option<Mmap64Fn>,
    munmap: Option<MunmapFn>,
}

static REAL_CALLS: OnceLock<LibcCalls> = OnceLock::new();

/// Process-wide table, resolved on first use
pub fn libc_calls() -> &'static LibcCalls {
    REAL_CALLS.get_or_init(|| unsafe { LibcCalls::resolve() })
}

/// Whether the table has been resolved yet
pub fn is_resolved() -> bool {
    REAL_CALLS.get().is_some()
}

unsafe fn next_symbol(name: &'static [u8]) -> *mut c_void {
    libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char)
}

macro_rules! resolve {
    ($name:literal) => {{
        let sym = next_symbol(concat!($name, "\0").as_bytes());
        if sym.is_null() {
            error!("Real {} not found via RTLD_NEXT", $name);
            None
        } else {
            Some(std::mem::transmute::<*mut c_void, _>(sym))
        }
    }};
}

impl LibcCalls {
    unsafe fn resolve() -> Self {
        let calls = Self {
            open: resolve!("open"),
            open64: resolve!("open64"),
            close: resolve!("close"),
            ioctl: resolve!("ioctl"),
            mmap: resolve!("mmap"),
            mmap64: resolve!("mmap64"),
            munmap: resolve!("munmap"),
        };
        info!("Real libc entry points resolved");
        calls
    }
}

fn unavailable(name: &str) {
    error!("Real {} function not available!", name);
    unsafe {
        *libc::__errno_location() = libc::ENOSYS;
    }
}

impl RealIo for LibcCalls {
    unsafe fn open(&self, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
        match self.open {
            Some(f) => f(path, flags, mode as libc::c_uint),
            None => {
                unavailable("open");
                -1
            }
        }
    }

    unsafe fn open64(&self, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
        match self.open64.or(self.open) {
            Some(f) => f(path, flags, mode as libc::c_uint),
            None => {
                unavailable("open64");
                -1
            }
        }
    }

    unsafe fn close(&self, fd: c_int) -> c_int {
        match self.close {
            Some(f) => f(fd),
            None => {
                unavailable("close");
                -1
            }
        }
    }

    unsafe fn ioctl(&self, fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
        match self.ioctl {
            Some(f) => f(fd, request, arg),
            None => {
                unavailable("ioctl");
                -1
            }
        }
    }

    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off_t,
    ) -> *mut c_void {
        match self.mmap {
            Some(f) => f(addr, len, prot, flags, fd, offset),
            None => {
                unavailable("mmap");
                libc::MAP_FAILED
            }
        }
    }

    unsafe fn mmap64(
        &self,
        addr: *mut c_void,
        len: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off64_t,
    ) -> *mut c_void {
        match self.mmap64 {
            Some(f) => f(addr, len, prot, flags, fd, offset),
            None => {
                unavailable("mmap64");
                libc::MAP_FAILED
            }
        }
    }

    unsafe fn munmap(&self, addr: *mut c_void, len: libc::size_t) -> c_int {
        match self.munmap {
            Some(f) => f(addr, len),
            None => {
                unavailable("munmap");
                -1
            }
        }
    }
}

/// Raw syscalls for mapping calls that arrive before the table exists.
///
/// `dlsym` may allocate, and an allocation may map memory; those nested
/// calls cannot wait for the table they are helping to build.
pub mod raw {
    use std::os::raw::{c_int, c_void};

    pub unsafe fn mmap(
        addr: *mut c_void,
        len: libc::size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: libc::off64_t,
    ) -> *mut c_void {
        #[cfg(target_pointer_width = "64")]
        let ret = libc::syscall(libc::SYS_mmap, addr, len, prot, flags, fd, offset);
        // mmap2 takes the offset in 4096-byte units
        #[cfg(target_pointer_width = "32")]
        let ret = libc::syscall(
            libc::SYS_mmap2,
            addr,
            len,
            prot,
            flags,
            fd,
            (offset / 4096) as libc::c_long,
        );
        ret as *mut c_void
    }

    pub unsafe fn munmap(addr: *mut c_void, len: libc::size_t) -> c_int {
        libc::syscall(libc::SYS_munmap, addr, len) as c_int
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_resolves_libc() {
        let calls = libc_calls();
        assert!(calls.open.is_some());
        assert!(calls.close.is_some());
        assert!(calls.ioctl.is_some());
        assert!(calls.mmap.is_some());
        assert!(calls.munmap.is_some());
        assert!(is_resolved());
        // Memoized
        assert!(std::ptr::eq(calls, libc_calls()));
    }

    #[test]
    fn test_forwarded_open_close() {
        let calls = libc_calls();
        let fd = unsafe { calls.open(b"/dev/null\0".as_ptr() as *const c_char, libc::O_RDONLY, 0) };
        assert!(fd >= 0);
        assert_eq!(unsafe { calls.close(fd) }, 0);
    }

    fn unresolved() -> LibcCalls {
        LibcCalls {
            open: None,
            open64: None,
            close: None,
            ioctl: None,
            mmap: None,
            mmap64: None,
            munmap: None,
        }
    }

    fn take_errno() -> Option<c_int> {
        let errno = std::io::Error::last_os_error().raw_os_error();
        unsafe { *libc::__errno_location() = 0 };
        errno
    }

    #[test]
    fn test_missing_symbols_fail_with_enosys() {
        let calls = unresolved();
        let null = c"/dev/null".as_ptr();
        take_errno();
        unsafe {
            assert_eq!(calls.open(null, libc::O_RDONLY, 0), -1);
            assert_eq!(take_errno(), Some(libc::ENOSYS));
            assert_eq!(calls.open64(null, libc::O_RDONLY, 0), -1);
            assert_eq!(take_errno(), Some(libc::ENOSYS));
            assert_eq!(calls.close(3), -1);
            assert_eq!(take_errno(), Some(libc::ENOSYS));
            assert_eq!(calls.ioctl(3, 0x4600, std::ptr::null_mut()), -1);
            assert_eq!(take_errno(), Some(libc::ENOSYS));
            let addr = calls.mmap(std::ptr::null_mut(), 4096, libc::PROT_READ, libc::MAP_PRIVATE, 3, 0);
            assert_eq!(addr, libc::MAP_FAILED);
            assert_eq!(take_errno(), Some(libc::ENOSYS));
            let addr = calls.mmap64(std::ptr::null_mut(), 4096, libc::PROT_READ, libc::MAP_PRIVATE, 3, 0);
            assert_eq!(addr, libc::MAP_FAILED);
            assert_eq!(take_errno(), Some(libc::ENOSYS));
            assert_eq!(calls.munmap(0x1000 as *mut c_void, 4096), -1);
            assert_eq!(take_errno(), Some(libc::ENOSYS));
        }
    }

    #[test]
    fn test_open64_falls_back_to_open() {
        let calls = LibcCalls {
            open: libc_calls().open,
            close: libc_calls().close,
            ..unresolved()
        };
        let fd = unsafe { calls.open64(c"/dev/null".as_ptr(), libc::O_RDONLY, 0) };
        assert!(fd >= 0);
        assert_eq!(unsafe { calls.close(fd) }, 0);
    }

    #[test]
    fn test_forwarded_mmap_munmap() {
        let calls = libc_calls();
        let len = 4096;
        let addr = unsafe {
            calls.mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        assert_eq!(unsafe { calls.munmap(addr, len) }, 0);
    }
}
