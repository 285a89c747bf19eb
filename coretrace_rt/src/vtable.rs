//! Virtual-call tracing and vtable diagnostics.
//!
//! `__ct_vcall_trace` and `__ct_vtable_dump` read the object's vptr,
//! recover the dynamic type through the Itanium RTTI layout (typeinfo
//! pointer one slot below the vtable, offset-to-top one below that),
//! resolve which module owns the vtable and the call target, and print a
//! boxed report. With `--ct-vtable-diag` the report also flags the
//! suspicious cases: null `this`, missing vptr or typeinfo, a vptr inside a
//! freed allocation, static/dynamic type disagreement, vtable and target in
//! different modules, or a target outside executable memory.

use std::ffi::CStr;

use libc::{c_char, c_int, c_void};

use crate::backtrace;
use crate::demangle;
use crate::env;
use crate::logger::{self, ct_log, Level};
use crate::state::{self, Feature};
use crate::table::table;

const BOX_MAX_VALUE_WIDTH: usize = 40;

struct VtableInfo {
    vtable: usize,
    typeinfo: usize,
    offset_to_top: isize,
}

/// Itanium layout: the vtable pointer sits at offset 0 of the object; the
/// typeinfo pointer and offset-to-top sit in the two slots preceding the
/// address the vptr points at.
fn read_vtable_info(this_ptr: usize) -> Option<VtableInfo> {
    if this_ptr == 0 || this_ptr % std::mem::size_of::<usize>() != 0 {
        return None;
    }
    unsafe {
        let vtable = std::ptr::read_volatile(this_ptr as *const usize);
        if vtable == 0 || vtable % std::mem::size_of::<usize>() != 0 {
            return None;
        }
        let slots = vtable as *const usize;
        let typeinfo = std::ptr::read_volatile(slots.sub(1));
        let offset_to_top = std::ptr::read_volatile(slots.sub(2)) as isize;
        Some(VtableInfo {
            vtable,
            typeinfo,
            offset_to_top,
        })
    }
}

/// The `__name` field of a `std::type_info`, one pointer past its vptr.
fn typeinfo_name(typeinfo: usize) -> Option<String> {
    if typeinfo == 0 || typeinfo % std::mem::size_of::<usize>() != 0 {
        return None;
    }
    unsafe {
        let name_ptr =
            std::ptr::read_volatile((typeinfo + std::mem::size_of::<usize>()) as *const *const c_char);
        if name_ptr.is_null() {
            return None;
        }
        let raw = CStr::from_ptr(name_ptr).to_str().ok()?;
        Some(demangle::demangle_any(raw).unwrap_or_else(|| raw.to_owned()))
    }
}

#[derive(Default, Clone)]
struct ModuleInfo {
    resolved: bool,
    is_main: bool,
    exec_known: bool,
    is_exec: bool,
    path: String,
    basename: String,
}

#[derive(Default, Clone)]
struct AddrInfo {
    has_module: bool,
    exec_known: bool,
    is_exec: bool,
    on_stack: bool,
    module: ModuleInfo,
}

fn basename(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_owned()
}

fn executable_path() -> String {
    std::fs::read_link("/proc/self/exe")
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn resolve_module_phdr(addr: usize) -> Option<ModuleInfo> {
    struct Ctx {
        addr: usize,
        out: Option<ModuleInfo>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let ctx = &mut *(data as *mut Ctx);
        let info = &*info;

        for i in 0..info.dlpi_phnum {
            let phdr = &*info.dlpi_phdr.add(i as usize);
            if phdr.p_type != libc::PT_LOAD {
                continue;
            }
            let start = info.dlpi_addr as usize + phdr.p_vaddr as usize;
            let end = start + phdr.p_memsz as usize;
            if ctx.addr < start || ctx.addr >= end {
                continue;
            }

            let is_main = info.dlpi_name.is_null() || *info.dlpi_name == 0;
            let path = if is_main {
                executable_path()
            } else {
                CStr::from_ptr(info.dlpi_name)
                    .to_string_lossy()
                    .into_owned()
            };
            ctx.out = Some(ModuleInfo {
                resolved: true,
                is_main,
                exec_known: true,
                is_exec: phdr.p_flags & libc::PF_X != 0,
                basename: basename(&path),
                path,
            });
            return 1;
        }
        0
    }

    let mut ctx = Ctx { addr, out: None };
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }
    ctx.out
}

fn resolve_module_dladdr(addr: usize) -> Option<ModuleInfo> {
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(addr as *const c_void, &mut info) == 0 || info.dli_fname.is_null() {
            return None;
        }
        let path = CStr::from_ptr(info.dli_fname).to_string_lossy().into_owned();
        let exe = executable_path();
        Some(ModuleInfo {
            resolved: true,
            is_main: !exe.is_empty() && path == exe,
            exec_known: false,
            is_exec: false,
            basename: basename(&path),
            path,
        })
    }
}

fn address_on_stack(addr: usize) -> bool {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return false;
        }
        let mut stack_base: *mut c_void = std::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&mut attr, &mut stack_base, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || stack_base.is_null() || stack_size == 0 {
            return false;
        }
        let start = stack_base as usize;
        addr >= start && addr < start + stack_size
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = addr;
        false
    }
}

fn resolve_address(addr: usize) -> AddrInfo {
    let mut info = AddrInfo::default();
    if addr == 0 {
        return info;
    }

    if let Some(module) = resolve_module_phdr(addr).or_else(|| resolve_module_dladdr(addr)) {
        info.has_module = true;
        info.exec_known = module.exec_known;
        info.is_exec = module.is_exec;
        info.module = module;
        return info;
    }

    if address_on_stack(addr) {
        info.exec_known = true;
        info.is_exec = false;
        info.on_stack = true;
    }
    info
}

fn module_display_name(module: &ModuleInfo) -> String {
    if !module.resolved {
        return "<unresolved>".to_owned();
    }
    if module.is_main {
        return "main".to_owned();
    }
    if !module.basename.is_empty() {
        return module.basename.clone();
    }
    if !module.path.is_empty() {
        return module.path.clone();
    }
    "<unknown>".to_owned()
}

fn modules_match(lhs: &ModuleInfo, rhs: &ModuleInfo) -> bool {
    if !lhs.resolved || !rhs.resolved {
        return false;
    }
    if lhs.is_main && rhs.is_main {
        return true;
    }
    let eq = |a: &str, b: &str| !a.is_empty() && !b.is_empty() && a == b;
    eq(&lhs.path, &rhs.path) || eq(&lhs.basename, &rhs.basename)
}

struct BoxLine {
    label: &'static str,
    value: String,
}

fn log_box(level: Level, tag: &str, title: &str, lines: &[BoxLine]) {
    if lines.is_empty() {
        return;
    }

    let label_width = lines.iter().map(|l| l.label.len()).max().unwrap_or(0);
    let value_width = lines
        .iter()
        .map(|l| l.value.len())
        .max()
        .unwrap_or(1)
        .clamp(1, BOX_MAX_VALUE_WIDTH);

    let inner_width = label_width + value_width + 5;
    let dash_count = inner_width.saturating_sub(title.len() + 3).max(1);

    ct_log!(level, "[{}]\n", tag);
    ct_log!(level, "┌─ {} {}┐\n", title, "─".repeat(dash_count));

    for line in lines {
        let value: &str = if line.value.is_empty() {
            "<empty>"
        } else {
            &line.value
        };
        let mut offset = 0;
        let mut first = true;
        let bytes = value.as_bytes();
        while offset < bytes.len() {
            let chunk = (bytes.len() - offset).min(value_width);
            // Chunk on a char boundary so multibyte values stay intact.
            let mut end = offset + chunk;
            while end < bytes.len() && !value.is_char_boundary(end) {
                end -= 1;
            }
            let part = &value[offset..end];

            let label = if first { line.label } else { "" };
            ct_log!(
                level,
                "│ {:<lw$} : {:<vw$} │\n",
                label,
                part,
                lw = label_width,
                vw = value_width
            );
            offset = end;
            first = false;
        }
    }

    ct_log!(level, "└{}┘\n", "─".repeat(inner_width));
}

/// One-shot note on whether the freed-object check can work at all.
fn log_diag_state() {
    use std::sync::atomic::{AtomicI32, Ordering};
    static LOGGED: AtomicI32 = AtomicI32::new(0);

    if !state::enabled(Feature::VtableDiag) {
        return;
    }
    if LOGGED
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    if state::enabled(Feature::Alloc) {
        ct_log!(Level::Info, "[VTABLE-DIAG]: alloc-tracking=enabled\n");
        return;
    }

    let reason = if state::alloc_disabled_by_env() {
        "env CT_DISABLE_ALLOC"
    } else if state::alloc_disabled_by_config() {
        "compile-time --ct-no-alloc/--ct-modules"
    } else {
        "unknown"
    };
    ct_log!(
        Level::Info,
        "[VTABLE-DIAG]: alloc-tracking=disabled (reason={})\n",
        reason
    );
}

fn is_unknown_type(type_name: *const c_char) -> bool {
    if type_name.is_null() {
        return true;
    }
    unsafe {
        let bytes = CStr::from_ptr(type_name).to_bytes();
        bytes.is_empty() || bytes == b"<unknown>"
    }
}

fn static_type_str(static_type: *const c_char) -> &'static str {
    if static_type.is_null() {
        return "<unknown>";
    }
    unsafe {
        CStr::from_ptr(static_type)
            .to_str()
            .map(|s| std::mem::transmute::<&str, &'static str>(s))
            .unwrap_or("<unknown>")
    }
}

fn common_prologue() {
    env::init_env_once();
    if !logger::log_is_enabled() {
        logger::enable_logging();
        backtrace::maybe_install();
    }
    log_diag_state();
}

fn freed_object_warning(this_ptr: usize, warnings: &mut Vec<String>) {
    if !state::enabled(Feature::Alloc) {
        return;
    }
    if let Some(info) = table().lookup_containing(this_ptr) {
        if info.state.is_freed() {
            warnings.push("vptr on freed object".to_owned());
        }
    }
}

#[no_mangle]
pub extern "C" fn __ct_vtable_dump(
    this_ptr: *mut c_void,
    site: *const c_char,
    static_type: *const c_char,
) {
    common_prologue();

    let this_addr = this_ptr as usize;
    let info = read_vtable_info(this_addr);
    let type_name = info
        .as_ref()
        .and_then(|i| typeinfo_name(i.typeinfo))
        .unwrap_or_else(|| "<unknown>".to_owned());
    let diag = state::enabled(Feature::VtableDiag);

    let mut lines = vec![
        BoxLine {
            label: "site",
            value: logger::site_name(site).to_owned(),
        },
        BoxLine {
            label: "this",
            value: if this_addr != 0 {
                format!("{this_addr:#x}")
            } else {
                "<null>".to_owned()
            },
        },
    ];
    if let Some(info) = &info {
        lines.push(BoxLine {
            label: "vtable",
            value: format!("{:#x}", info.vtable),
        });
        lines.push(BoxLine {
            label: "off_top",
            value: info.offset_to_top.to_string(),
        });
    }
    lines.push(BoxLine {
        label: "type",
        value: type_name.clone(),
    });
    if diag && !is_unknown_type(static_type) {
        lines.push(BoxLine {
            label: "static",
            value: static_type_str(static_type).to_owned(),
        });
    }

    let mut warnings = Vec::new();
    if diag {
        if this_addr == 0 {
            warnings.push("null this pointer".to_owned());
        }
        if info.is_none() {
            warnings.push("no vptr".to_owned());
        }
        if let Some(vt) = &info {
            if vt.typeinfo == 0 {
                warnings.push("missing typeinfo".to_owned());
            }
            let vtable_addr = resolve_address(vt.vtable);
            if vtable_addr.has_module {
                lines.push(BoxLine {
                    label: "vmod",
                    value: module_display_name(&vtable_addr.module),
                });
            } else {
                warnings.push("vtable resolve failed".to_owned());
            }
        }

        freed_object_warning(this_addr, &mut warnings);

        if !is_unknown_type(static_type)
            && type_name != "<unknown>"
            && type_name != static_type_str(static_type)
        {
            warnings.push("static!=dynamic type".to_owned());
        }
    }

    let level = if warnings.is_empty() {
        Level::Info
    } else {
        Level::Warn
    };
    for warning in warnings {
        lines.push(BoxLine {
            label: "warn",
            value: warning,
        });
    }
    log_box(level, "VTABLE", "vtable", &lines);
}

#[no_mangle]
pub extern "C" fn __ct_vcall_trace(
    this_ptr: *mut c_void,
    target: *mut c_void,
    site: *const c_char,
    static_type: *const c_char,
) {
    common_prologue();

    let this_addr = this_ptr as usize;
    let target_addr = target as usize;
    let info = read_vtable_info(this_addr);
    let type_name = info
        .as_ref()
        .and_then(|i| typeinfo_name(i.typeinfo))
        .unwrap_or_else(|| "<unknown>".to_owned());
    let diag = state::enabled(Feature::VtableDiag);

    let (symbol, demangled) = unsafe {
        let mut dl: libc::Dl_info = std::mem::zeroed();
        if target_addr != 0 && libc::dladdr(target, &mut dl) != 0 && !dl.dli_sname.is_null() {
            let raw = CStr::from_ptr(dl.dli_sname).to_string_lossy().into_owned();
            let pretty = demangle::demangle(&raw);
            (Some(raw), pretty)
        } else {
            (None, None)
        }
    };

    let mut lines = vec![
        BoxLine {
            label: "site",
            value: logger::site_name(site).to_owned(),
        },
        BoxLine {
            label: "this",
            value: if this_addr != 0 {
                format!("{this_addr:#x}")
            } else {
                "<null>".to_owned()
            },
        },
        BoxLine {
            label: "vtable",
            value: info
                .as_ref()
                .map(|i| format!("{:#x}", i.vtable))
                .unwrap_or_else(|| "<unknown>".to_owned()),
        },
        BoxLine {
            label: "type",
            value: type_name.clone(),
        },
        BoxLine {
            label: "target",
            value: if target_addr != 0 {
                format!("{target_addr:#x}")
            } else {
                "<null>".to_owned()
            },
        },
        BoxLine {
            label: "symbol",
            value: symbol.unwrap_or_else(|| "<unknown>".to_owned()),
        },
        BoxLine {
            label: "demangled",
            value: demangled.unwrap_or_else(|| "<unknown>".to_owned()),
        },
    ];
    if diag && !is_unknown_type(static_type) {
        lines.push(BoxLine {
            label: "static",
            value: static_type_str(static_type).to_owned(),
        });
    }

    let mut warnings = Vec::new();
    let mut vtable_addr = AddrInfo::default();
    let mut target_info = AddrInfo::default();
    if diag {
        if this_addr == 0 {
            warnings.push("null this pointer".to_owned());
        }
        if info.is_none() {
            warnings.push("no vptr".to_owned());
        }
        if let Some(vt) = &info {
            if vt.typeinfo == 0 {
                warnings.push("missing typeinfo".to_owned());
            }
            vtable_addr = resolve_address(vt.vtable);
            if vtable_addr.has_module {
                lines.push(BoxLine {
                    label: "vmod",
                    value: module_display_name(&vtable_addr.module),
                });
            } else {
                warnings.push("vtable resolve failed".to_owned());
            }
        }

        if target_addr != 0 {
            target_info = resolve_address(target_addr);
            if target_info.has_module {
                lines.push(BoxLine {
                    label: "tmod",
                    value: module_display_name(&target_info.module),
                });
            }
        }

        freed_object_warning(this_addr, &mut warnings);

        if !is_unknown_type(static_type)
            && type_name != "<unknown>"
            && type_name != static_type_str(static_type)
        {
            warnings.push("static!=dynamic type".to_owned());
        }

        if vtable_addr.has_module && target_info.has_module {
            if !modules_match(&vtable_addr.module, &target_info.module) {
                warnings.push(format!(
                    "module mismatch: vtable={} target={}",
                    module_display_name(&vtable_addr.module),
                    module_display_name(&target_info.module)
                ));
            }
        } else if target_addr != 0 && !target_info.has_module {
            if target_info.exec_known && !target_info.is_exec {
                warnings.push("target in non-exec memory".to_owned());
            } else {
                lines.push(BoxLine {
                    label: "note",
                    value: "target module unresolved".to_owned(),
                });
            }
        } else if !vtable_addr.has_module && target_info.has_module {
            lines.push(BoxLine {
                label: "note",
                value: "vtable module unresolved".to_owned(),
            });
        }
    }

    let level = if warnings.is_empty() {
        Level::Info
    } else {
        Level::Warn
    };
    for warning in warnings {
        lines.push(BoxLine {
            label: "warn",
            value: warning,
        });
    }
    log_box(level, "VCALL", "vcall", &lines);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/usr/lib/libfoo.so.6"), "libfoo.so.6");
        assert_eq!(basename("bar"), "bar");
        assert_eq!(basename("/usr/lib/"), "lib");
    }

    #[test]
    fn misaligned_this_has_no_vtable() {
        assert!(read_vtable_info(0).is_none());
        assert!(read_vtable_info(0x1001).is_none());
    }

    #[test]
    fn own_code_address_resolves_to_a_module() {
        let addr = basename as usize;
        let info = resolve_address(addr);
        assert!(info.has_module);
        assert!(info.module.resolved);
    }

    #[test]
    fn stack_address_is_detected() {
        let local = 0u32;
        assert!(address_on_stack(&local as *const u32 as usize));
    }

    #[test]
    fn unknown_type_detection() {
        assert!(is_unknown_type(std::ptr::null()));
        assert!(is_unknown_type(c"".as_ptr()));
        assert!(is_unknown_type(c"<unknown>".as_ptr()));
        assert!(!is_unknown_type(c"Base".as_ptr()));
    }
}
