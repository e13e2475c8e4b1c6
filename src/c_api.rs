//! Interposed libc entry points
//!
//! When the library is loaded via `LD_PRELOAD`, these definitions shadow
//! libc's `open`, `close`, `ioctl`, `mmap` and `munmap` (plus the large-file
//! `open64`/`mmap64`). Calls that do not concern the emulated framebuffer
//! go straight to the real implementations.

use crate::config::{Config, LOG_ENV};
use crate::fb::{FbFixScreeninfo, FbVarScreeninfo};
use crate::real::{self, LibcCalls, RealIo};
use crate::session::{Intercept, Interceptor, IoctlReply};
use crate::Error;
use std::cell::Cell;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_ulong, c_void};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::error;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,fbdev_shim=info";

/// Library constructor - runs when the library is loaded via LD_PRELOAD
#[cfg(not(test))]
#[used]
#[link_section = ".init_array"]
static LIBRARY_INIT: unsafe extern "C" fn() = library_init;

#[cfg(not(test))]
unsafe extern "C" fn library_init() {
    init_logging();
    tracing::info!("fbdev-shim loaded, intercepting framebuffer calls");
}

/// Install the stderr log subscriber unless the host already has one
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// Configuration, loaded by the first open that reaches the shim
static CONFIG: OnceLock<Config> = OnceLock::new();

// Single process-wide interceptor, created on first use
static SHIM: Mutex<Option<Interceptor>> = Mutex::new(None);

// Descriptor of the active session, -1 when none. Lets unrelated calls skip the lock.
static ACTIVE_FD: AtomicI32 = AtomicI32::new(-1);

// Thread-local recursion guard: set while this thread is inside the shim
std::thread_local! {
    static IN_SHIM: Cell<bool> = const { Cell::new(false) };
}

struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Option<Self> {
        IN_SHIM.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(ReentryGuard)
            }
        })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_SHIM.with(|flag| flag.set(false));
    }
}

fn in_shim() -> bool {
    IN_SHIM.with(|flag| flag.get())
}

fn real_calls() -> &'static LibcCalls {
    if real::is_resolved() {
        return real::libc_calls();
    }
    // Calls made by dlsym itself while resolving must not wait on the table
    let _guard = ReentryGuard::enter();
    real::libc_calls()
}

fn load_config() -> Config {
    Config::load().unwrap_or_else(|e| {
        error!("Failed to load shim configuration, using defaults: {}", e);
        Config::default()
    })
}

/// Cached configuration. `None` while this thread is still loading it.
fn shim_config() -> Option<&'static Config> {
    if let Some(config) = CONFIG.get() {
        return Some(config);
    }
    // Reading the config file goes through our own open
    let _guard = ReentryGuard::enter()?;
    Some(CONFIG.get_or_init(load_config))
}

/// Run `f` against the interceptor, unless this thread is already inside it
fn with_shim<T>(f: impl FnOnce(&mut Interceptor) -> Intercept<T>) -> Intercept<T> {
    let Some(_guard) = ReentryGuard::enter() else {
        return Intercept::Forward;
    };
    let mut shim = SHIM.lock().unwrap_or_else(PoisonError::into_inner);
    let interceptor =
        shim.get_or_insert_with(|| Interceptor::from_config(CONFIG.get_or_init(load_config).clone()));
    let outcome = f(interceptor);
    ACTIVE_FD.store(interceptor.device_fd().unwrap_or(-1), Ordering::Release);
    outcome
}

fn is_device_fd(fd: c_int) -> bool {
    fd >= 0 && ACTIVE_FD.load(Ordering::Acquire) == fd
}

fn session_active() -> bool {
    ACTIVE_FD.load(Ordering::Acquire) >= 0
}

fn set_errno(errno: c_int) {
    unsafe {
        *libc::__errno_location() = errno;
    }
}

fn fail(e: &Error) -> c_int {
    set_errno(e.errno());
    -1
}

/// The mode argument is only present when the flags create a file
fn needs_mode(flags: c_int) -> bool {
    flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE
}

unsafe fn intercept_open(path: *const c_char, flags: c_int) -> Intercept<c_int> {
    if path.is_null() {
        return Intercept::Forward;
    }
    let path = CStr::from_ptr(path);
    let Some(config) = shim_config() else {
        return Intercept::Forward;
    };
    // Unrelated paths never touch the interceptor lock
    if !config.is_framebuffer_path(&path.to_string_lossy()) {
        return Intercept::Forward;
    }
    match with_shim(|shim| shim.open(real_calls(), path, flags)) {
        Intercept::Handled(Ok(fd)) => Intercept::Handled(fd),
        Intercept::Handled(Err(e)) => Intercept::Handled(fail(&e)),
        Intercept::Forward => Intercept::Forward,
    }
}

/// Intercept open() for framebuffer device paths
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    let mode = if needs_mode(flags) { mode } else { 0 };
    match intercept_open(path, flags) {
        Intercept::Handled(ret) => ret,
        Intercept::Forward => real_calls().open(path, flags, mode),
    }
}

/// Large-file variant of open()
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    let mode = if needs_mode(flags) { mode } else { 0 };
    match intercept_open(path, flags) {
        Intercept::Handled(ret) => ret,
        Intercept::Forward => real_calls().open64(path, flags, mode),
    }
}

/// Copy an ioctl reply into the caller's argument
unsafe fn write_reply(reply: IoctlReply, arg: *mut c_void) -> c_int {
    match reply {
        IoctlReply::None => 0,
        _ if arg.is_null() => {
            set_errno(libc::EFAULT);
            -1
        }
        IoctlReply::Var(var) => {
            std::ptr::write(arg as *mut FbVarScreeninfo, var);
            0
        }
        IoctlReply::Fix(fix) => {
            std::ptr::write(arg as *mut FbFixScreeninfo, fix);
            0
        }
    }
}

/// Intercept ioctl() on the emulated framebuffer descriptor
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if is_device_fd(fd) {
        match with_shim(|shim| shim.ioctl(fd, request)) {
            Intercept::Handled(Ok(reply)) => return write_reply(reply, arg),
            Intercept::Handled(Err(e)) => return fail(&e),
            Intercept::Forward => {}
        }
    }
    real_calls().ioctl(fd, request, arg)
}

unsafe fn intercept_mmap(fd: c_int, len: libc::size_t) -> Intercept<*mut c_void> {
    if !is_device_fd(fd) {
        return Intercept::Forward;
    }
    match with_shim(|shim| shim.mmap(fd, len)) {
        Intercept::Handled(Ok(addr)) => Intercept::Handled(addr.as_ptr()),
        Intercept::Handled(Err(e)) => {
            set_errno(e.errno());
            Intercept::Handled(libc::MAP_FAILED)
        }
        Intercept::Forward => Intercept::Forward,
    }
}

/// Intercept mmap() of the emulated framebuffer
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    len: libc::size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    if let Intercept::Handled(ret) = intercept_mmap(fd, len) {
        return ret;
    }
    if in_shim() && !real::is_resolved() {
        return real::raw::mmap(addr, len, prot, flags, fd, offset as libc::off64_t);
    }
    real_calls().mmap(addr, len, prot, flags, fd, offset)
}

/// Large-file variant of mmap()
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    len: libc::size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off64_t,
) -> *mut c_void {
    if let Intercept::Handled(ret) = intercept_mmap(fd, len) {
        return ret;
    }
    if in_shim() && !real::is_resolved() {
        return real::raw::mmap(addr, len, prot, flags, fd, offset);
    }
    real_calls().mmap64(addr, len, prot, flags, fd, offset)
}

/// Intercept munmap() of the framebuffer mapping
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn munmap(addr: *mut c_void, len: libc::size_t) -> c_int {
    if session_active() {
        if let Intercept::Handled(()) = with_shim(|shim| shim.munmap(addr)) {
            return 0;
        }
    }
    if in_shim() && !real::is_resolved() {
        return real::raw::munmap(addr, len);
    }
    real_calls().munmap(addr, len)
}

/// Intercept close() of the emulated framebuffer descriptor
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if is_device_fd(fd) {
        match with_shim(|shim| shim.close(real_calls(), fd)) {
            Intercept::Handled(Ok(())) => return 0,
            Intercept::Handled(Err(e)) => return fail(&e),
            Intercept::Forward => {}
        }
    }
    real_calls().close(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fb::{FBIOGET_FSCREENINFO, FBIOGET_VSCREENINFO};

    // Tests below share the process-wide interceptor
    static SERIAL: Mutex<()> = Mutex::new(());

    fn errno() -> c_int {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    #[test]
    fn test_needs_mode() {
        assert!(needs_mode(libc::O_CREAT | libc::O_WRONLY));
        assert!(needs_mode(libc::O_TMPFILE | libc::O_RDWR));
        assert!(!needs_mode(libc::O_RDONLY));
        assert!(!needs_mode(libc::O_DIRECTORY));
    }

    #[test]
    fn test_reentry_guard() {
        assert!(!in_shim());
        {
            let outer = ReentryGuard::enter();
            assert!(outer.is_some());
            assert!(in_shim());
            assert!(ReentryGuard::enter().is_none());
            assert!(with_shim(|_| Intercept::Handled(())).is_forward());
        }
        assert!(!in_shim());
    }

    #[test]
    fn test_write_reply_null_arg() {
        let var = FbVarScreeninfo::default();
        assert_eq!(unsafe { write_reply(IoctlReply::Var(var), std::ptr::null_mut()) }, -1);
        assert_eq!(errno(), libc::EFAULT);
        assert_eq!(unsafe { write_reply(IoctlReply::None, std::ptr::null_mut()) }, 0);
    }

    #[test]
    fn test_close_of_unknown_fd_reports_real_error() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            assert_eq!(close(-1), -1);
            assert_eq!(errno(), libc::EBADF);
            assert_eq!(ioctl(-1, FBIOGET_VSCREENINFO, std::ptr::null_mut()), -1);
            assert_eq!(errno(), libc::EBADF);
        }
    }

    #[test]
    fn test_passthrough_regular_file() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            let fd = open(c"/dev/zero".as_ptr(), libc::O_RDONLY, 0);
            assert!(fd >= 0);
            assert!(!is_device_fd(fd));
            let addr = mmap(std::ptr::null_mut(), 4096, libc::PROT_READ, libc::MAP_PRIVATE, fd, 0);
            assert_ne!(addr, libc::MAP_FAILED);
            assert_eq!(*(addr as *const u8), 0);
            assert_eq!(munmap(addr, 4096), 0);
            assert_eq!(close(fd), 0);
        }
    }

    #[test]
    fn test_unrelated_open_skips_interceptor_lock() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        // Make sure the config is cached before the lock is held
        assert!(shim_config().is_some());
        let _held = SHIM.lock().unwrap_or_else(PoisonError::into_inner);

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let fd = unsafe { open(c"/dev/zero".as_ptr(), libc::O_RDONLY, 0) };
            let _ = tx.send(fd);
        });
        let fd = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("open of /dev/zero waited on the interceptor");
        assert!(fd >= 0);
        assert_eq!(unsafe { close(fd) }, 0);
    }

    #[test]
    fn test_framebuffer_lifecycle_through_c_api() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut shim = SHIM.lock().unwrap_or_else(PoisonError::into_inner);
            let config = Config {
                backend: crate::config::BackendKind::Memory,
                width: 640,
                height: 480,
                ..Config::default()
            };
            *shim = Some(Interceptor::from_config(config));
        }

        // Second round takes the large-file entry points
        for large_file in [false, true] {
            unsafe {
                let fd = if large_file {
                    open64(c"/dev/fb0".as_ptr(), libc::O_RDWR, 0)
                } else {
                    open(c"/dev/fb0".as_ptr(), libc::O_RDWR, 0)
                };
                assert!(fd >= 0);
                assert!(is_device_fd(fd));

                let mut var = FbVarScreeninfo::default();
                let mut fix = FbFixScreeninfo::default();
                assert_eq!(ioctl(fd, FBIOGET_VSCREENINFO, &mut var as *mut _ as *mut c_void), 0);
                assert_eq!(ioctl(fd, FBIOGET_FSCREENINFO, &mut fix as *mut _ as *mut c_void), 0);
                assert_eq!((var.xres, var.yres_virtual, var.bits_per_pixel), (640, 480, 32));
                assert_eq!(fix.smem_len, 640 * 480 * 4);
                assert_eq!(fix.line_length, 640 * 4);

                let len = fix.smem_len as usize;
                let prot = libc::PROT_READ | libc::PROT_WRITE;
                let addr = if large_file {
                    mmap64(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0)
                } else {
                    mmap(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0)
                };
                assert!(!addr.is_null());
                assert_ne!(addr, libc::MAP_FAILED);
                std::ptr::write_bytes(addr as *mut u8, 0xff, len);

                assert_eq!(munmap(addr, len), 0);
                assert_eq!(close(fd), 0);
                assert!(!is_device_fd(fd));
            }
        }
    }
}
