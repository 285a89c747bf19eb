//! Fatal-signal backtrace handler, opt-in through `CT_BACKTRACE`.
//!
//! Installs for SEGV/ABRT/BUS/ILL with `SA_RESETHAND` so a second fault
//! falls through to the default action. The handler only uses the raw
//! writer and exits with the conventional `128 + signo`.

use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void};

use crate::env;
use crate::logger::{self, Color, Level};

// glibc's execinfo surface; not exposed through the libc crate.
extern "C" {
    fn backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
    fn backtrace_symbols_fd(buffer: *const *mut c_void, size: c_int, fd: c_int);
}

static INSTALLED: AtomicI32 = AtomicI32::new(0);

extern "C" fn signal_handler(signo: c_int) {
    logger::disable_logging();
    logger::write_prefix(Level::Error);
    logger::write_str(logger::color(Color::Red));
    logger::write_str("ct: fatal signal ");
    logger::write_dec(signo as usize);
    logger::write_str(logger::color(Color::Reset));
    logger::write_str("\n");

    let mut frames = [std::ptr::null_mut::<c_void>(); 64];
    let count = unsafe { backtrace(frames.as_mut_ptr(), frames.len() as c_int) };
    if count > 0 {
        unsafe { backtrace_symbols_fd(frames.as_ptr(), count, 2) };
    }

    unsafe { libc::_exit(128 + signo) };
}

/// Install the handler once, and only when `CT_BACKTRACE` is set.
pub fn maybe_install() {
    if !env::env_set("CT_BACKTRACE") {
        return;
    }
    if INSTALLED
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = signal_handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_RESETHAND;

        libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGABRT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGBUS, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGILL, &sa, std::ptr::null_mut());
    }

    logger::write_prefix(Level::Info);
    logger::write_str(logger::color(Color::Green));
    logger::write_str("ct: backtrace handler installed");
    logger::write_str(logger::color(Color::Reset));
    logger::write_str("\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_gated_on_env() {
        std::env::remove_var("CT_BACKTRACE");
        maybe_install();
        assert_eq!(INSTALLED.load(Ordering::Relaxed), 0);
    }
}
