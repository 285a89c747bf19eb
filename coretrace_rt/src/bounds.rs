//! `__ct_check_bounds` and the bounds-error report.
//!
//! The instrumentation passes emit one call per memory access with the
//! resolved base pointer, the accessed pointer, the access size and a site
//! string. The check consults the allocation table (and the shadow map when
//! enabled) and reports heap-buffer-overflow / heap-use-after-free with the
//! allocation's own metadata. Reports abort unless `bounds_no_abort` is in
//! effect.

use libc::{c_char, c_int, c_void, size_t};

use crate::env;
use crate::logger::{self, ct_log, Level};
use crate::shadow;
use crate::state::{self, Feature};
use crate::table::{table, EntryState};

/// Emit the structured bounds report and honor the abort policy.
#[allow(clippy::too_many_arguments)]
pub fn report_bounds_error(
    base: usize,
    ptr: usize,
    access_size: usize,
    site: *const c_char,
    is_write: bool,
    req_size: usize,
    alloc_size: usize,
    alloc_site: *const c_char,
    state: EntryState,
) {
    let signed_offset = if ptr >= base {
        (ptr - base) as i64
    } else {
        -((base - ptr) as i64)
    };

    let kind = if state.is_freed() {
        "heap-use-after-free"
    } else {
        "heap-buffer-overflow"
    };
    let report_size = if req_size != 0 { req_size } else { alloc_size };

    ct_log!(
        Level::Error,
        "ct: {} {} of size {}\n  access={} ptr={:#x} offset={}\n  alloc_size={} alloc_site={} base={:#x}\n",
        kind,
        if is_write { "WRITE" } else { "READ" },
        access_size,
        logger::site_name(site),
        ptr,
        signed_offset,
        report_size,
        logger::site_name(alloc_site),
        base
    );
    if alloc_size != report_size {
        ct_log!(Level::Error, "  usable_size={}\n", alloc_size);
    }

    if crate::state::bounds_abort_enabled() {
        unsafe { libc::abort() };
    }
}

#[no_mangle]
pub extern "C" fn __ct_check_bounds(
    base: *const c_void,
    ptr: *const c_void,
    access_size: size_t,
    site: *const c_char,
    is_write: c_int,
) {
    if !state::enabled(Feature::Bounds) {
        return;
    }
    env::init_env_once();
    if ptr.is_null() || access_size == 0 || base.is_null() {
        return;
    }

    let base_addr = base as usize;
    let ptr_addr = ptr as usize;
    let shadow_on = state::enabled(Feature::Shadow);

    let mut found = table().lookup(base_addr);
    let mut alloc_base = base_addr;
    if found.is_none() && shadow_on && state::enabled(Feature::ShadowAggressive) {
        // Interior pointers lose their base through pointer arithmetic the
        // pass could not see; fall back to a containment scan.
        if let Some(info) = table().lookup_containing(ptr_addr) {
            alloc_base = info.base;
            found = Some(info);
        }
    }

    let Some(info) = found else {
        return;
    };

    if info.state.is_freed() && !shadow_on {
        report_bounds_error(
            alloc_base,
            ptr_addr,
            access_size,
            site,
            is_write != 0,
            info.req_size,
            info.real_size,
            info.site,
            info.state,
        );
        return;
    }

    if shadow_on {
        shadow::check_access(
            ptr_addr,
            access_size,
            alloc_base,
            info.req_size,
            info.real_size,
            info.site,
            site,
            is_write != 0,
            info.state,
        );
        return;
    }

    let bound_size = if info.req_size != 0 {
        info.req_size
    } else {
        info.real_size
    };

    let oob = if ptr_addr < alloc_base {
        true
    } else {
        let offset = ptr_addr - alloc_base;
        offset > bound_size || access_size > bound_size - offset
    };

    if oob {
        report_bounds_error(
            alloc_base,
            ptr_addr,
            access_size,
            site,
            is_write != 0,
            info.req_size,
            info.real_size,
            info.site,
            info.state,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::AllocKind;

    // The reporter aborts by default, so the tests only exercise the
    // in-bounds early returns; the out-of-bounds decision logic itself is
    // covered through the pure offset computation below.

    #[test]
    fn in_bounds_access_is_silent() {
        let buf = vec![0u8; 64];
        let base = buf.as_ptr() as usize;
        table().insert(base, 64, 64, std::ptr::null(), AllocKind::Malloc);

        __ct_check_bounds(
            base as *const c_void,
            base as *const c_void,
            64,
            std::ptr::null(),
            0,
        );
        __ct_check_bounds(
            base as *const c_void,
            (base + 63) as *const c_void,
            1,
            std::ptr::null(),
            1,
        );

        table().remove(base);
        drop(buf);
    }

    #[test]
    fn null_and_zero_size_are_ignored() {
        __ct_check_bounds(
            std::ptr::null(),
            std::ptr::null(),
            8,
            std::ptr::null(),
            0,
        );
        let x = 0u64;
        let p = &x as *const u64 as *const c_void;
        __ct_check_bounds(p, p, 0, std::ptr::null(), 0);
    }

    #[test]
    fn untracked_base_is_ignored() {
        let x = [0u8; 16];
        let p = x.as_ptr() as *const c_void;
        __ct_check_bounds(p, p, 16, std::ptr::null(), 1);
    }

    #[test]
    fn offset_decision_bounds_the_last_byte() {
        // offset > size, or access crossing the end, is out of bounds.
        let decide = |offset: usize, access: usize, size: usize| -> bool {
            offset > size || access > size - offset
        };
        assert!(!decide(0, 4, 4));
        assert!(decide(4, 1, 4));
        assert!(decide(0, 5, 4));
        assert!(!decide(3, 1, 4));
        assert!(decide(3, 2, 4));
    }
}
