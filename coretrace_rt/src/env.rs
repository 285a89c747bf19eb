//! Runtime initialization.
//!
//! A constructor hook runs before `main` and folds two configuration
//! sources into the feature mask: the `__ct_config_*` globals the config
//! pass emitted into the instrumented modules (probed by symbol so a build
//! without them still works), then the `CT_*` environment variables, which
//! always win. Interceptors that can run before constructors call
//! [`init_env_once`] to get the same folding on first use.
//!
//! The matching destructor hook emits the leak report.

use std::ffi::CStr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::state::{self, Feature};
use crate::{alloc, backtrace, gc};

static ENV_INITIALIZED: AtomicI32 = AtomicI32::new(0);

pub fn env_set(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

pub fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Probe a config global emitted by the instrumentation. The globals have
/// weak-ODR linkage in every instrumented module; a build without any
/// instrumented module simply misses the symbol.
fn config_global(name: &CStr) -> i32 {
    unsafe {
        let sym = libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr());
        if sym.is_null() {
            0
        } else {
            *(sym as *const i32)
        }
    }
}

fn apply_compiled_config() {
    let shadow = config_global(c"__ct_config_shadow");
    let shadow_aggressive = config_global(c"__ct_config_shadow_aggressive");

    if shadow != 0 || shadow_aggressive != 0 {
        state::set_feature(Feature::Shadow, true);
    }
    if shadow_aggressive != 0 {
        state::set_feature(Feature::ShadowAggressive, true);
    }
    if config_global(c"__ct_config_bounds_no_abort") != 0 {
        state::set_bounds_abort(false);
    }
    if config_global(c"__ct_config_disable_alloc") != 0 {
        state::set_feature(Feature::Alloc, false);
        state::mark_alloc_disabled_by_config();
    }
    if config_global(c"__ct_config_disable_autofree") != 0 {
        state::set_feature(Feature::Autofree, false);
    }
    if config_global(c"__ct_config_disable_alloc_trace") != 0 {
        state::set_feature(Feature::AllocTrace, false);
    }
    if config_global(c"__ct_config_vtable_diag") != 0 {
        state::set_feature(Feature::VtableDiag, true);
    }
}

fn apply_env_overrides() {
    if env_set("CT_DISABLE_TRACE") {
        state::set_feature(Feature::Trace, false);
    }
    if env_set("CT_DISABLE_ALLOC") {
        state::set_feature(Feature::Alloc, false);
        state::mark_alloc_disabled_by_env();
    }
    if env_set("CT_EARLY_TRACE") {
        state::set_feature(Feature::EarlyTrace, true);
    }
    if env_set("CT_DISABLE_BOUNDS") {
        state::set_feature(Feature::Bounds, false);
    }
    if env_set("CT_BOUNDS_NO_ABORT") {
        state::set_bounds_abort(false);
    }
    if env_set("CT_SHADOW") {
        state::set_feature(Feature::Shadow, true);
    }
    if env_set("CT_SHADOW_AGGRESSIVE") {
        state::set_feature(Feature::Shadow, true);
        state::set_feature(Feature::ShadowAggressive, true);
    }
    if env_set("CT_DISABLE_AUTOFREE") {
        state::set_feature(Feature::Autofree, false);
    }
    if env_set("CT_DISABLE_ALLOC_TRACE") {
        state::set_feature(Feature::AllocTrace, false);
    }
}

fn init_once_body() {
    apply_compiled_config();
    apply_env_overrides();
}

/// Idempotent lazy initialization for interceptors that run before the
/// constructor (allocations from other constructors, for instance).
pub fn init_env_once() {
    if ENV_INITIALIZED
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    init_once_body();
}

extern "C" fn ct_runtime_init() {
    backtrace::maybe_install();
    init_env_once();
    gc::maybe_start();
}

extern "C" fn ct_runtime_fini() {
    alloc::report_leaks();
}

#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CT_RUNTIME_INIT: extern "C" fn() = ct_runtime_init;

#[used]
#[cfg_attr(target_os = "linux", link_section = ".fini_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_term_func")]
static CT_RUNTIME_FINI: extern "C" fn() = ct_runtime_fini;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_global_reads_zero() {
        assert_eq!(config_global(c"__ct_config_does_not_exist"), 0);
    }

    #[test]
    fn env_usize_parses_plain_numbers() {
        std::env::set_var("CT_TEST_USIZE", "1500");
        assert_eq!(env_usize("CT_TEST_USIZE"), Some(1500));
        std::env::set_var("CT_TEST_USIZE", "nope");
        assert_eq!(env_usize("CT_TEST_USIZE"), None);
        std::env::remove_var("CT_TEST_USIZE");
    }

    #[test]
    fn init_once_is_idempotent() {
        init_env_once();
        init_env_once();
        assert_eq!(ENV_INITIALIZED.load(Ordering::Relaxed), 1);
    }
}
