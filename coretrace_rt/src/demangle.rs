//! Itanium-name demangling for trace and vtable output.
//!
//! The runtime is linked into C programs as often as C++ ones, so
//! `__cxa_demangle` cannot be a hard dependency. It is probed once through
//! `dlsym`; when the C++ runtime is not present, mangled names pass through
//! undecoded.

use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_int, size_t};

type CxaDemangleFn = unsafe extern "C" fn(
    mangled: *const c_char,
    output: *mut c_char,
    length: *mut size_t,
    status: *mut c_int,
) -> *mut c_char;

const UNRESOLVED: usize = 0;
const MISSING: usize = 1;

static CXA_DEMANGLE: AtomicUsize = AtomicUsize::new(UNRESOLVED);

fn resolve() -> Option<CxaDemangleFn> {
    let cached = CXA_DEMANGLE.load(Ordering::Acquire);
    if cached == MISSING {
        return None;
    }
    if cached != UNRESOLVED {
        return Some(unsafe { std::mem::transmute::<usize, CxaDemangleFn>(cached) });
    }

    let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"__cxa_demangle".as_ptr()) };
    if sym.is_null() {
        CXA_DEMANGLE.store(MISSING, Ordering::Release);
        return None;
    }
    CXA_DEMANGLE.store(sym as usize, Ordering::Release);
    Some(unsafe { std::mem::transmute::<*mut libc::c_void, CxaDemangleFn>(sym) })
}

/// Demangle an Itanium `_Z*` name. Returns `None` for plain C names, on
/// demangler failure, or when no C++ runtime is linked in.
pub fn demangle(name: &str) -> Option<String> {
    if !name.starts_with("_Z") {
        return None;
    }
    demangle_any(name)
}

/// Demangle without the `_Z` gate; typeinfo names drop the prefix.
pub fn demangle_any(name: &str) -> Option<String> {
    let demangle_fn = resolve()?;
    let mangled = CString::new(name).ok()?;

    let mut status: c_int = 0;
    let result = unsafe {
        demangle_fn(
            mangled.as_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut status,
        )
    };
    if result.is_null() {
        return None;
    }

    let out = if status == 0 {
        unsafe { CStr::from_ptr(result).to_str().ok().map(str::to_owned) }
    } else {
        None
    };
    unsafe { libc::free(result as *mut libc::c_void) };
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_c_names_pass_through() {
        assert_eq!(demangle("main"), None);
        assert_eq!(demangle("my_function"), None);
    }

    #[test]
    fn mangled_names_do_not_crash_without_cxx_runtime() {
        // With a C++ runtime present this yields "foo()"; without one it
        // must quietly return None.
        let result = demangle("_Z3foov");
        if let Some(name) = result {
            assert_eq!(name, "foo()");
        }
    }
}
