//! The `__ct_*` allocation entry points.
//!
//! The instrumentation passes replace calls to malloc/new/mmap/sbrk and
//! their releasing counterparts with these symbols. Each wrapper forwards to
//! the real allocator, records the allocation in the table, keeps the shadow
//! map in sync and emits the optional trace records. The `_unreachable`
//! variants record that the compiler proved the result unused; the
//! compiler-emitted `__ct_autofree*` call that follows reclaims it.
//!
//! When alloc tracking is disabled everything degrades to a plain
//! passthrough so instrumented binaries keep working.

use libc::{c_char, c_int, c_void, size_t};

use crate::env;
use crate::gc;
use crate::logger::{self, ct_log, Color, Level};
use crate::shadow;
use crate::state::{self, Feature};
use crate::table::{table, AllocKind, EntryInfo, Removed};

impl AllocKind {
    fn label(self) -> &'static str {
        match self {
            AllocKind::Malloc => "malloc",
            AllocKind::New => "new",
            AllocKind::NewArray => "new[]",
            AllocKind::Mmap => "mmap",
            AllocKind::Sbrk => "sbrk",
        }
    }
}

fn usable_size(ptr: *mut c_void, fallback: usize) -> usize {
    if ptr.is_null() {
        return 0;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        let size = libc::malloc_usable_size(ptr);
        if size != 0 {
            size
        } else {
            fallback
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        fallback
    }
}

fn trace_alloc_record(
    label: &str,
    status: &str,
    req_size: usize,
    real_size: usize,
    ptr: *mut c_void,
    site: *const c_char,
) {
    if !state::enabled(Feature::AllocTrace) {
        return;
    }

    ct_log!(
        Level::Warn,
        "{}tracing-{}{} :: tid={} site={}\n",
        logger::color(Color::Yellow),
        label,
        logger::color(Color::Reset),
        logger::thread_id(),
        logger::site_name(site)
    );
    ct_log!(Level::Warn, "┌-----------------------------------┐\n");
    ct_log!(Level::Warn, "| {:<16} : {:<14} |\n", "status", status);
    ct_log!(Level::Warn, "| {:<16} : {:<14} |\n", "req_size", req_size);
    ct_log!(
        Level::Warn,
        "| {:<16} : {:<14} |\n",
        "total_alloc_size",
        real_size
    );
    ct_log!(
        Level::Warn,
        "| {:<16} : {:<14} |\n",
        "ptr",
        format!("{:#x}", ptr as usize)
    );
    ct_log!(Level::Warn, "└-----------------------------------┘\n");
}

/// Record a fresh allocation and run the unreachable auto-free when asked.
fn track(
    ptr: *mut c_void,
    req_size: usize,
    real_size: usize,
    site: *const c_char,
    kind: AllocKind,
    unreachable: bool,
) {
    if !ptr.is_null() {
        table().insert(ptr as usize, req_size, real_size, site, kind);
        if state::enabled(Feature::Shadow) {
            shadow::on_alloc(ptr as usize, req_size, real_size);
        }
    }

    // The compiler emits the matching `__ct_autofree*` call right after an
    // unreachable allocation; here we only record what it proved.
    let label = kind.label();
    if unreachable {
        trace_alloc_record(
            &format!("{label}-unreachable"),
            "unreachable",
            req_size,
            real_size,
            ptr,
            site,
        );
    } else {
        trace_alloc_record(label, "reachable", req_size, real_size, ptr, site);
    }
}

fn malloc_impl(size: size_t, site: *const c_char, kind: AllocKind, unreachable: bool) -> *mut c_void {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        return unsafe { libc::malloc(size) };
    }

    let ptr = unsafe { libc::malloc(size) };
    track(ptr, size, usable_size(ptr, size), site, kind, unreachable);
    ptr
}

fn release_for_kind(ptr: *mut c_void, kind: AllocKind, real_size: usize) {
    match kind {
        AllocKind::Malloc | AllocKind::New | AllocKind::NewArray => unsafe {
            libc::free(ptr);
        },
        AllocKind::Mmap => unsafe {
            libc::munmap(ptr, real_size);
        },
        AllocKind::Sbrk => unsafe {
            // Only the topmost segment can be returned to the kernel.
            let brk = libc::sbrk(0) as usize;
            if ptr as usize + real_size == brk {
                libc::sbrk(-(real_size as isize));
            }
        },
    }
}

/// Free a swept entry according to its recorded kind; the GC calls this
/// after dropping the table lock and resuming the world.
pub(crate) fn release_entry(info: &EntryInfo) {
    release_for_kind(info.base as *mut c_void, info.kind, info.real_size);
}

/// Release a provably non-escaping allocation. Shared by the compiler-emitted
/// `__ct_autofree*` calls and the unreachable-allocation path.
fn autofree_impl(ptr: *mut c_void, expected_kind: AllocKind) {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) || !state::enabled(Feature::Autofree) {
        return;
    }
    if ptr.is_null() {
        ct_log!(
            Level::Warn,
            "{}ct: auto-free ptr=null{}\n",
            logger::color(Color::BgBrightYellow),
            logger::color(Color::Reset)
        );
        return;
    }

    // A live reference anywhere in the process vetoes the free.
    if gc::pointer_scan_enabled() && gc::pointer_is_referenced(ptr as usize) {
        ct_log!(
            Level::Warn,
            "{}ct: auto-free skipped ptr={:#x} (still referenced){}\n",
            logger::color(Color::BgBrightYellow),
            ptr as usize,
            logger::color(Color::Reset)
        );
        return;
    }

    let info = match table().remove_autofree(ptr as usize) {
        Removed::Ok(info) => info,
        Removed::AlreadyFreed(_) => {
            ct_log!(
                Level::Warn,
                "{}ct: auto-free skipped ptr={:#x} (already freed){}\n",
                logger::color(Color::BgBrightYellow),
                ptr as usize,
                logger::color(Color::Reset)
            );
            return;
        }
        Removed::Unknown => {
            ct_log!(
                Level::Warn,
                "{}ct: auto-free skipped ptr={:#x} (unknown){}\n",
                logger::color(Color::BgBrightYellow),
                ptr as usize,
                logger::color(Color::Reset)
            );
            return;
        }
    };

    if state::enabled(Feature::Shadow) {
        shadow::poison_range(ptr as usize, info.real_size);
    }

    ct_log!(
        Level::Warn,
        "{}auto-free ptr={:#x} size={} site={}{}\n",
        logger::color(Color::BgBrightYellow),
        ptr as usize,
        info.real_size,
        logger::site_name(info.site),
        logger::color(Color::Reset)
    );

    // The table saw the allocation happen; its kind wins over the variant
    // the compiler picked.
    if info.kind != expected_kind {
        ct_log!(
            Level::Warn,
            "ct: auto-free kind mismatch ptr={:#x} (recorded {}, caller {})\n",
            ptr as usize,
            info.kind.label(),
            expected_kind.label()
        );
    }
    release_for_kind(ptr, info.kind, info.real_size);
}

fn free_impl(ptr: *mut c_void, label: &str, release: unsafe fn(*mut c_void, &EntryInfo)) {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        unsafe { libc::free(ptr) };
        return;
    }

    if ptr.is_null() {
        ct_log!(
            Level::Warn,
            "{}tracing-{} ptr=null{}\n",
            logger::color(Color::Yellow),
            label,
            logger::color(Color::Reset)
        );
        return;
    }

    match table().remove(ptr as usize) {
        Removed::Ok(info) => {
            if state::enabled(Feature::Shadow) {
                shadow::poison_range(ptr as usize, info.real_size);
            }
            if state::enabled(Feature::AllocTrace) {
                ct_log!(
                    Level::Info,
                    "{}tracing-{} ptr={:#x} size={}{}\n",
                    logger::color(Color::Cyan),
                    label,
                    ptr as usize,
                    info.real_size,
                    logger::color(Color::Reset)
                );
            }
            unsafe { release(ptr, &info) };
        }
        Removed::AlreadyFreed(_) => {
            ct_log!(
                Level::Warn,
                "{}tracing-{} ptr={:#x} (double free){}\n",
                logger::color(Color::Red),
                label,
                ptr as usize,
                logger::color(Color::Reset)
            );
        }
        Removed::Unknown => {
            ct_log!(
                Level::Warn,
                "{}tracing-{} ptr={:#x} (unknown){}\n",
                logger::color(Color::Red),
                label,
                ptr as usize,
                logger::color(Color::Reset)
            );
            unsafe { libc::free(ptr) };
        }
    }
}

unsafe fn release_heap(ptr: *mut c_void, _info: &EntryInfo) {
    libc::free(ptr);
}

// ---------------------------------------------------------------------------
// malloc family
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn __ct_malloc(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::Malloc, false)
}

#[no_mangle]
pub extern "C" fn __ct_malloc_unreachable(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::Malloc, true)
}

fn calloc_impl(n: size_t, size: size_t, site: *const c_char, unreachable: bool) -> *mut c_void {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        return unsafe { libc::calloc(n, size) };
    }

    let ptr = unsafe { libc::calloc(n, size) };
    let req = n.saturating_mul(size);
    track(
        ptr,
        req,
        usable_size(ptr, req),
        site,
        AllocKind::Malloc,
        unreachable,
    );
    ptr
}

#[no_mangle]
pub extern "C" fn __ct_calloc(n: size_t, size: size_t, site: *const c_char) -> *mut c_void {
    calloc_impl(n, size, site, false)
}

#[no_mangle]
pub extern "C" fn __ct_calloc_unreachable(
    n: size_t,
    size: size_t,
    site: *const c_char,
) -> *mut c_void {
    calloc_impl(n, size, site, true)
}

#[no_mangle]
pub extern "C" fn __ct_realloc(
    ptr: *mut c_void,
    size: size_t,
    site: *const c_char,
) -> *mut c_void {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        return unsafe { libc::realloc(ptr, size) };
    }

    let old = if ptr.is_null() {
        None
    } else {
        match table().remove(ptr as usize) {
            Removed::Ok(info) => Some(info),
            _ => None,
        }
    };
    if let Some(info) = &old {
        if state::enabled(Feature::Shadow) {
            shadow::poison_range(ptr as usize, info.real_size);
        }
    }

    let new_ptr = unsafe { libc::realloc(ptr, size) };
    let status = if size == 0 {
        "freed"
    } else if new_ptr == ptr {
        "in-place"
    } else {
        "moved"
    };

    if !new_ptr.is_null() && size != 0 {
        let real = usable_size(new_ptr, size);
        table().insert(new_ptr as usize, size, real, site, AllocKind::Malloc);
        if state::enabled(Feature::Shadow) {
            shadow::on_alloc(new_ptr as usize, size, real);
        }
        trace_alloc_record("realloc", status, size, real, new_ptr, site);
    } else {
        trace_alloc_record("realloc", status, size, 0, new_ptr, site);
    }

    new_ptr
}

#[no_mangle]
pub extern "C" fn __ct_posix_memalign(
    out: *mut *mut c_void,
    align: size_t,
    size: size_t,
    site: *const c_char,
) -> c_int {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        return unsafe { libc::posix_memalign(out, align, size) };
    }

    let rc = unsafe { libc::posix_memalign(out, align, size) };
    if rc == 0 && !out.is_null() {
        let ptr = unsafe { *out };
        track(
            ptr,
            size,
            usable_size(ptr, size),
            site,
            AllocKind::Malloc,
            false,
        );
    }
    rc
}

#[no_mangle]
pub extern "C" fn __ct_aligned_alloc(
    align: size_t,
    size: size_t,
    site: *const c_char,
) -> *mut c_void {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        return unsafe { libc::aligned_alloc(align, size) };
    }

    let ptr = unsafe { libc::aligned_alloc(align, size) };
    track(
        ptr,
        size,
        usable_size(ptr, size),
        site,
        AllocKind::Malloc,
        false,
    );
    ptr
}

#[no_mangle]
pub extern "C" fn __ct_free(ptr: *mut c_void) {
    free_impl(ptr, "free", release_heap);
}

// ---------------------------------------------------------------------------
// operator new / delete family
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn __ct_new(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::New, false)
}

#[no_mangle]
pub extern "C" fn __ct_new_unreachable(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::New, true)
}

#[no_mangle]
pub extern "C" fn __ct_new_array(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::NewArray, false)
}

#[no_mangle]
pub extern "C" fn __ct_new_array_unreachable(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::NewArray, true)
}

#[no_mangle]
pub extern "C" fn __ct_new_nothrow(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::New, false)
}

#[no_mangle]
pub extern "C" fn __ct_new_nothrow_unreachable(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::New, true)
}

#[no_mangle]
pub extern "C" fn __ct_new_array_nothrow(size: size_t, site: *const c_char) -> *mut c_void {
    malloc_impl(size, site, AllocKind::NewArray, false)
}

#[no_mangle]
pub extern "C" fn __ct_new_array_nothrow_unreachable(
    size: size_t,
    site: *const c_char,
) -> *mut c_void {
    malloc_impl(size, site, AllocKind::NewArray, true)
}

#[no_mangle]
pub extern "C" fn __ct_delete(ptr: *mut c_void) {
    free_impl(ptr, "delete", release_heap);
}

#[no_mangle]
pub extern "C" fn __ct_delete_array(ptr: *mut c_void) {
    free_impl(ptr, "delete[]", release_heap);
}

#[no_mangle]
pub extern "C" fn __ct_delete_nothrow(ptr: *mut c_void) {
    free_impl(ptr, "delete", release_heap);
}

#[no_mangle]
pub extern "C" fn __ct_delete_array_nothrow(ptr: *mut c_void) {
    free_impl(ptr, "delete[]", release_heap);
}

#[no_mangle]
pub extern "C" fn __ct_delete_destroying(ptr: *mut c_void) {
    free_impl(ptr, "delete", release_heap);
}

#[no_mangle]
pub extern "C" fn __ct_delete_array_destroying(ptr: *mut c_void) {
    free_impl(ptr, "delete[]", release_heap);
}

// ---------------------------------------------------------------------------
// mmap / sbrk family
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn __ct_mmap(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
    site: *const c_char,
) -> *mut c_void {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        return unsafe { libc::mmap(addr, len, prot, flags, fd, offset) };
    }

    let ptr = unsafe { libc::mmap(addr, len, prot, flags, fd, offset) };
    if ptr != libc::MAP_FAILED {
        track(ptr, len, len, site, AllocKind::Mmap, false);
    }
    ptr
}

#[no_mangle]
pub extern "C" fn __ct_munmap(addr: *mut c_void, len: size_t, _site: *const c_char) -> c_int {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        return unsafe { libc::munmap(addr, len) };
    }

    if !addr.is_null() {
        match table().remove(addr as usize) {
            Removed::Ok(info) => {
                if state::enabled(Feature::Shadow) {
                    shadow::poison_range(addr as usize, info.real_size);
                }
                if state::enabled(Feature::AllocTrace) {
                    ct_log!(
                        Level::Info,
                        "{}tracing-munmap ptr={:#x} size={}{}\n",
                        logger::color(Color::Cyan),
                        addr as usize,
                        info.real_size,
                        logger::color(Color::Reset)
                    );
                }
            }
            Removed::AlreadyFreed(_) => {
                ct_log!(
                    Level::Warn,
                    "{}tracing-munmap ptr={:#x} (double unmap){}\n",
                    logger::color(Color::Red),
                    addr as usize,
                    logger::color(Color::Reset)
                );
            }
            Removed::Unknown => {}
        }
    }
    unsafe { libc::munmap(addr, len) }
}

#[no_mangle]
pub extern "C" fn __ct_sbrk(incr: libc::intptr_t, site: *const c_char) -> *mut c_void {
    env::init_env_once();
    if !state::enabled(Feature::Alloc) {
        return unsafe { libc::sbrk(incr) };
    }

    let ptr = unsafe { libc::sbrk(incr) };
    if ptr != usize::MAX as *mut c_void && incr > 0 {
        track(ptr, incr as usize, incr as usize, site, AllocKind::Sbrk, false);
    }
    ptr
}

#[no_mangle]
pub extern "C" fn __ct_brk(addr: *mut c_void, _site: *const c_char) -> c_int {
    env::init_env_once();
    // The break moves wholesale; there is no per-allocation record to keep.
    #[cfg(target_os = "linux")]
    unsafe {
        libc::brk(addr)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = addr;
        -1
    }
}

// ---------------------------------------------------------------------------
// autofree family
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn __ct_autofree(ptr: *mut c_void) {
    autofree_impl(ptr, AllocKind::Malloc);
}

#[no_mangle]
pub extern "C" fn __ct_autofree_delete(ptr: *mut c_void) {
    autofree_impl(ptr, AllocKind::New);
}

#[no_mangle]
pub extern "C" fn __ct_autofree_delete_array(ptr: *mut c_void) {
    autofree_impl(ptr, AllocKind::NewArray);
}

#[no_mangle]
pub extern "C" fn __ct_autofree_munmap(ptr: *mut c_void) {
    autofree_impl(ptr, AllocKind::Mmap);
}

#[no_mangle]
pub extern "C" fn __ct_autofree_sbrk(ptr: *mut c_void) {
    autofree_impl(ptr, AllocKind::Sbrk);
}

// ---------------------------------------------------------------------------
// leak report
// ---------------------------------------------------------------------------

const LEAK_REPORT_LIMIT: usize = 32;

/// Destructor-time leak report. Logging is forcibly disabled first so the
/// raw writer is the only thing that can still emit output.
pub(crate) fn report_leaks() {
    let live = table().live_count();
    if live == 0 {
        return;
    }

    logger::disable_logging();

    logger::write_prefix(Level::Error);
    logger::write_str(logger::color(Color::Red));
    logger::write_str("ct: leaks detected count=");
    logger::write_dec(live);
    logger::write_str(logger::color(Color::Reset));
    logger::write_str("\n");

    let mut reported = 0usize;
    table().locked(|inner| {
        inner.for_each_used(|entry| {
            logger::write_prefix(Level::Warn);
            logger::write_str(logger::color(Color::Yellow));
            logger::write_str("ct: leak ptr=");
            logger::write_hex(entry.ptr);
            logger::write_str(" size=");
            logger::write_dec(entry.real_size);
            logger::write_str(logger::color(Color::Reset));
            logger::write_str("\n");

            reported += 1;
            if reported >= LEAK_REPORT_LIMIT {
                logger::write_prefix(Level::Warn);
                logger::write_str(logger::color(Color::Yellow));
                logger::write_str("ct: leak list truncated");
                logger::write_str(logger::color(Color::Reset));
                logger::write_str("\n");
                return false;
            }
            true
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_round_trip() {
        let ptr = __ct_malloc(64, std::ptr::null());
        assert!(!ptr.is_null());
        assert!(table().lookup(ptr as usize).is_some());
        __ct_free(ptr);
        let info = table().lookup(ptr as usize).unwrap();
        assert!(info.state.is_freed());
    }

    #[test]
    fn calloc_records_total_size() {
        let ptr = __ct_calloc(4, 8, std::ptr::null());
        assert!(!ptr.is_null());
        let info = table().lookup(ptr as usize).unwrap();
        assert_eq!(info.req_size, 32);
        assert!(info.real_size >= 32);
        __ct_free(ptr);
    }

    #[test]
    fn realloc_moves_tracking() {
        let ptr = __ct_malloc(16, std::ptr::null());
        let grown = __ct_realloc(ptr, 4096, std::ptr::null());
        assert!(!grown.is_null());
        let info = table().lookup(grown as usize).unwrap();
        assert_eq!(info.req_size, 4096);
        assert!(!info.state.is_freed());
        __ct_free(grown);
    }

    #[test]
    fn posix_memalign_tracks_output_slot() {
        let mut out: *mut c_void = std::ptr::null_mut();
        let rc = __ct_posix_memalign(&mut out, 64, 256, std::ptr::null());
        assert_eq!(rc, 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 64, 0);
        let info = table().lookup(out as usize).unwrap();
        assert_eq!(info.req_size, 256);
        __ct_free(out);
    }

    #[test]
    fn new_kinds_are_recorded() {
        let ptr = __ct_new_array(128, std::ptr::null());
        let info = table().lookup(ptr as usize).unwrap();
        assert_eq!(info.kind, AllocKind::NewArray);
        __ct_delete_array(ptr);
    }

    #[test]
    fn autofree_reclaims_known_pointer() {
        let ptr = __ct_malloc(32, std::ptr::null());
        __ct_autofree(ptr);
        let info = table().lookup(ptr as usize).unwrap();
        assert_eq!(info.state, crate::table::EntryState::Autofreed);
    }

    #[test]
    fn autofree_skips_unknown_pointer() {
        let local = 0u64;
        // Must not free or crash on a pointer the table never saw.
        __ct_autofree(&local as *const u64 as *mut c_void);
    }
}
