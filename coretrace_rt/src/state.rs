//! Process-wide feature state.
//!
//! A single atomic bitmask drives every runtime feature. The compile-time
//! config globals and the environment both fold into it exactly once, after
//! which lookups are relaxed loads on the hot paths.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

/// Runtime feature bits. The C-visible helpers below take the raw mask so the
/// instrumented program (and tests) can query them over the C ABI.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Feature {
    Trace = 1 << 0,
    Alloc = 1 << 1,
    Bounds = 1 << 2,
    Shadow = 1 << 3,
    ShadowAggressive = 1 << 4,
    Autofree = 1 << 5,
    AllocTrace = 1 << 6,
    VtableDiag = 1 << 7,
    EarlyTrace = 1 << 8,
}

const DEFAULT_FEATURES: u64 = Feature::Trace as u64
    | Feature::Alloc as u64
    | Feature::Bounds as u64
    | Feature::Autofree as u64
    | Feature::AllocTrace as u64;

const EARLY_TRACE_LIMIT: usize = 200;

static FEATURES: AtomicU64 = AtomicU64::new(DEFAULT_FEATURES);
static BOUNDS_ABORT: AtomicI32 = AtomicI32::new(1);
static EARLY_TRACE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Why alloc tracking is off, if it is; feeds the one-shot vtable-diag note.
static ALLOC_DISABLED_BY_CONFIG: AtomicI32 = AtomicI32::new(0);
static ALLOC_DISABLED_BY_ENV: AtomicI32 = AtomicI32::new(0);

thread_local! {
    static CURRENT_SITE: Cell<*const libc::c_char> = const { Cell::new(std::ptr::null()) };
}

pub fn enabled(feature: Feature) -> bool {
    FEATURES.load(Ordering::Relaxed) & feature as u64 != 0
}

pub fn set_feature(feature: Feature, enabled: bool) {
    if enabled {
        FEATURES.fetch_or(feature as u64, Ordering::Relaxed);
    } else {
        FEATURES.fetch_and(!(feature as u64), Ordering::Relaxed);
    }
}

pub fn bounds_abort_enabled() -> bool {
    BOUNDS_ABORT.load(Ordering::Relaxed) != 0
}

pub fn set_bounds_abort(enabled: bool) {
    BOUNDS_ABORT.store(enabled as i32, Ordering::Relaxed);
}

pub fn mark_alloc_disabled_by_config() {
    ALLOC_DISABLED_BY_CONFIG.store(1, Ordering::Relaxed);
}

pub fn mark_alloc_disabled_by_env() {
    ALLOC_DISABLED_BY_ENV.store(1, Ordering::Relaxed);
}

pub fn alloc_disabled_by_config() -> bool {
    ALLOC_DISABLED_BY_CONFIG.load(Ordering::Relaxed) != 0
}

pub fn alloc_disabled_by_env() -> bool {
    ALLOC_DISABLED_BY_ENV.load(Ordering::Relaxed) != 0
}

/// Claim one early-trace slot. Pre-`main` tracing is bounded so a deep
/// constructor chain cannot flood stderr.
pub fn early_trace_should_log() -> bool {
    if !enabled(Feature::EarlyTrace) {
        return false;
    }

    let mut current = EARLY_TRACE_COUNT.load(Ordering::Relaxed);
    while current < EARLY_TRACE_LIMIT {
        match EARLY_TRACE_COUNT.compare_exchange_weak(
            current,
            current + 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(seen) => current = seen,
        }
    }
    false
}

pub fn current_site() -> *const libc::c_char {
    CURRENT_SITE.with(|site| site.get())
}

pub fn set_current_site(site: *const libc::c_char) {
    CURRENT_SITE.with(|slot| slot.set(site));
}

/// C ABI: non-zero when every bit of `feature` is set.
#[no_mangle]
pub extern "C" fn ct_is_enabled(feature: u64) -> i32 {
    (FEATURES.load(Ordering::Relaxed) & feature != 0) as i32
}

/// C ABI: set or clear the given feature bits.
#[no_mangle]
pub extern "C" fn ct_set_enabled(feature: u64, enabled: i32) {
    if enabled != 0 {
        FEATURES.fetch_or(feature, Ordering::Relaxed);
    } else {
        FEATURES.fetch_and(!feature, Ordering::Relaxed);
    }
}

/// C ABI: the whole feature mask.
#[no_mangle]
pub extern "C" fn ct_get_features() -> u64 {
    FEATURES.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mask_has_core_features() {
        assert!(DEFAULT_FEATURES & Feature::Trace as u64 != 0);
        assert!(DEFAULT_FEATURES & Feature::Alloc as u64 != 0);
        assert!(DEFAULT_FEATURES & Feature::Bounds as u64 != 0);
        assert!(DEFAULT_FEATURES & Feature::Shadow as u64 == 0);
        assert!(DEFAULT_FEATURES & Feature::VtableDiag as u64 == 0);
    }

    #[test]
    fn feature_toggle_round_trip() {
        set_feature(Feature::VtableDiag, true);
        assert!(enabled(Feature::VtableDiag));
        set_feature(Feature::VtableDiag, false);
        assert!(!enabled(Feature::VtableDiag));
    }

    #[test]
    fn early_trace_quota_is_bounded() {
        set_feature(Feature::EarlyTrace, true);
        let mut granted = 0;
        for _ in 0..EARLY_TRACE_LIMIT * 2 {
            if early_trace_should_log() {
                granted += 1;
            }
        }
        assert!(granted <= EARLY_TRACE_LIMIT);
        set_feature(Feature::EarlyTrace, false);
    }
}
