//! Function entry/exit tracing.
//!
//! `__ct_trace_enter` records the current function as the thread's site (so
//! allocation records without a debug location still name a place) and logs
//! the entry. Full logging only switches on when tracing reaches `main`;
//! before that the bounded early-trace quota applies. Exit handlers log the
//! return value formatted per type.

use std::ffi::CStr;

use libc::{c_char, c_void};

use crate::backtrace;
use crate::demangle;
use crate::env;
use crate::logger::{self, ct_log, Color, Level};
use crate::state::{self, Feature};

fn func_name(func: *const c_char) -> Option<&'static str> {
    if func.is_null() {
        return None;
    }
    unsafe {
        CStr::from_ptr(func)
            .to_str()
            .ok()
            .map(|name| std::mem::transmute::<&str, &'static str>(name))
    }
}

#[no_mangle]
pub extern "C" fn __ct_trace_enter(func: *const c_char) {
    let Some(name) = func_name(func) else {
        return;
    };

    state::set_current_site(func);
    env::init_env_once();
    if !state::enabled(Feature::Trace) {
        return;
    }

    if state::early_trace_should_log() {
        logger::write_prefix(Level::Info);
        logger::write_str(logger::color(Color::Dim));
        logger::write_str("ct: enter ");
        logger::write_str(logger::color(Color::Reset));
        logger::write_str(name);
        logger::write_str("\n");
    }

    if !logger::log_is_enabled() {
        if name != "main" {
            return;
        }
        logger::enable_logging();
        backtrace::maybe_install();
    }

    if let Some(demangled) = demangle::demangle(name) {
        ct_log!(
            Level::Info,
            "[ENTRY-FUNCTION]: -> {}{}, {}{}\n",
            logger::color(Color::Bold),
            name,
            demangled,
            logger::color(Color::Reset)
        );
    } else {
        ct_log!(
            Level::Info,
            "[ENTRY-FUNCTION]: -> {}{}{}\n",
            logger::color(Color::Bold),
            name,
            logger::color(Color::Reset)
        );
    }
}

fn log_exit_value(func: *const c_char, ret_value: &str) {
    let Some(name) = func_name(func) else {
        return;
    };

    state::set_current_site(func);
    env::init_env_once();
    if !state::enabled(Feature::Trace) || !logger::log_is_enabled() {
        return;
    }

    if let Some(demangled) = demangle::demangle(name) {
        ct_log!(
            Level::Info,
            "[EXIT-FUNCTION]: <- {}{}, {}{} ret={}\n",
            logger::color(Color::Bold),
            name,
            demangled,
            logger::color(Color::Reset),
            ret_value
        );
    } else {
        ct_log!(
            Level::Info,
            "[EXIT-FUNCTION]: <- {}{}{} ret={}\n",
            logger::color(Color::Bold),
            name,
            logger::color(Color::Reset),
            ret_value
        );
    }
}

#[no_mangle]
pub extern "C" fn __ct_trace_exit_void(func: *const c_char) {
    log_exit_value(func, "void");
}

#[no_mangle]
pub extern "C" fn __ct_trace_exit_i64(func: *const c_char, value: i64) {
    log_exit_value(func, &value.to_string());
}

#[no_mangle]
pub extern "C" fn __ct_trace_exit_ptr(func: *const c_char, value: *const c_void) {
    if value.is_null() {
        log_exit_value(func, "nullptr");
        return;
    }
    log_exit_value(func, &format!("{:#x}", value as usize));
}

#[no_mangle]
pub extern "C" fn __ct_trace_exit_f64(func: *const c_char, value: f64) {
    log_exit_value(func, &value.to_string());
}

#[no_mangle]
pub extern "C" fn __ct_trace_exit_unknown(func: *const c_char) {
    log_exit_value(func, "<non-scalar>");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_records_current_site() {
        let name = c"some_function";
        __ct_trace_enter(name.as_ptr());
        assert_eq!(state::current_site(), name.as_ptr());
    }

    #[test]
    fn null_function_name_is_ignored() {
        __ct_trace_enter(std::ptr::null());
        __ct_trace_exit_void(std::ptr::null());
        __ct_trace_exit_i64(std::ptr::null(), 7);
    }
}
