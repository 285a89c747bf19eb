//! The embeddable C ABI.

use std::ffi::CStr;

use libc::{c_char, c_int};

use crate::driver::{compile, OutputMode};

/// Compile `argv[0..argc]` with the same argument handling as the CLI.
/// Merged diagnostics are copied into `output_buffer` (NUL-terminated,
/// truncated to `buffer_size`). Returns 1 on success, 0 otherwise.
///
/// # Safety
///
/// `argv` must point to `argc` valid NUL-terminated strings and
/// `output_buffer` must be writable for `buffer_size` bytes.
#[no_mangle]
pub unsafe extern "C" fn compile_c(
    argc: c_int,
    argv: *const *const c_char,
    output_buffer: *mut c_char,
    buffer_size: c_int,
) -> c_int {
    let mut args = Vec::with_capacity(argc.max(0) as usize);
    for i in 0..argc.max(0) as usize {
        let arg = *argv.add(i);
        if arg.is_null() {
            continue;
        }
        args.push(CStr::from_ptr(arg).to_string_lossy().into_owned());
    }

    let mut mode = OutputMode::ToFile;
    let mut instrument = false;
    let mut compiler_args = Vec::with_capacity(args.len());
    let mut passthrough = false;
    for arg in args {
        if passthrough {
            compiler_args.push(arg);
            continue;
        }
        match arg.as_str() {
            "--in-mem" | "--in-memory" => mode = OutputMode::ToMemory,
            "--instrument" => instrument = true,
            "--" => {
                compiler_args.push(arg);
                passthrough = true;
            }
            _ => compiler_args.push(arg),
        }
    }

    let result = compile(&compiler_args, mode, instrument);

    if !output_buffer.is_null() && buffer_size > 0 {
        let limit = (buffer_size - 1) as usize;
        let bytes = result.diagnostics.as_bytes();
        let count = bytes.len().min(limit);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), output_buffer as *mut u8, count);
        *output_buffer.add(count) = 0;
    }

    result.success as c_int
}
