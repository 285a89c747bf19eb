//! Toolchain resolution: which clang to run, which resource directory and
//! sysroot to add, and whether the invocation needs the C++ driver.
//!
//! C++ detection looks at explicit `-x`/`-stdlib` flags and source
//! extensions first; an object-only link additionally inspects the inputs
//! for C++ symbols (Itanium manglings, `__cxa_*`, the GCC personality), so
//! `coretrace foo.o` links with the right standard library.

use std::path::{Path, PathBuf};
use std::process::Command;

use goblin::Object;
use memmap2::Mmap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolchainError {
    #[error("unable to find clang executable in PATH")]
    ClangNotFound,

    #[error("failed to inspect object: {path}: {message}")]
    ObjectInspection { path: String, message: String },
}

/// Everything the driver needs to know before building the clang command.
#[derive(Debug, Default)]
pub struct DriverConfig {
    pub clang_path: PathBuf,
    pub resource_dir: Option<String>,
    pub sysroot: Option<String>,
    pub force_cxx_driver: bool,
}

fn is_cxx_lang(lang: &str) -> bool {
    let lang = lang.strip_prefix('=').unwrap_or(lang);
    matches!(
        lang,
        "c++" | "c++-header" | "c++-cpp-output" | "objective-c++" | "objective-c++-header"
    )
}

fn extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_cxx_source_ext(ext: &str) -> bool {
    if ext == "C" {
        return true;
    }
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "cc" | "cpp" | "cxx" | "c++" | "cp" | "mm"
    )
}

fn is_source_ext(ext: &str) -> bool {
    ext == "C"
        || matches!(
            ext.to_ascii_lowercase().as_str(),
            "c" | "cc" | "cpp" | "cxx" | "c++" | "cp" | "m" | "mm"
        )
}

fn is_object_ext(ext: &str) -> bool {
    matches!(ext.to_ascii_lowercase().as_str(), "o" | "obj")
}

fn is_archive_ext(ext: &str) -> bool {
    matches!(ext.to_ascii_lowercase().as_str(), "a" | "lib")
}

/// Flags that consume the following argument.
fn takes_value(arg: &str) -> bool {
    matches!(
        arg,
        "-o" | "-x"
            | "-target"
            | "--target"
            | "-gcc-toolchain"
            | "-isysroot"
            | "-I"
            | "-isystem"
            | "-iquote"
            | "-idirafter"
            | "-iprefix"
            | "-iwithprefix"
            | "-iwithprefixbefore"
            | "-include"
            | "-imacros"
            | "-D"
            | "-U"
            | "-L"
            | "-F"
            | "-MF"
            | "-MT"
            | "-MQ"
            | "-Xclang"
            | "-Xlinker"
            | "-Xassembler"
            | "-Xpreprocessor"
    )
}

#[derive(Default)]
struct ArgScan {
    has_driver_mode: bool,
    has_resource_dir: bool,
    has_sysroot: bool,
    needs_cxx_driver: bool,
    has_source_inputs: bool,
    has_object_inputs: bool,
    inputs: Vec<String>,
}

fn scan_args(args: &[String]) -> ArgScan {
    let mut scan = ArgScan::default();
    let mut end_of_opts = false;
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        if !end_of_opts && arg == "--" {
            end_of_opts = true;
            continue;
        }

        if !end_of_opts && arg.starts_with('-') {
            if arg == "--driver-mode" || arg.starts_with("--driver-mode=") {
                scan.has_driver_mode = true;
                if arg == "--driver-mode" {
                    iter.next();
                }
                continue;
            }
            if arg == "-resource-dir" || arg.starts_with("-resource-dir=") {
                scan.has_resource_dir = true;
                if arg == "-resource-dir" {
                    iter.next();
                }
                continue;
            }
            if arg == "-isysroot" {
                scan.has_sysroot = true;
                iter.next();
                continue;
            }
            if arg.starts_with("-isysroot=") || arg.starts_with("--sysroot=") {
                scan.has_sysroot = true;
                continue;
            }
            if arg == "-x" {
                if let Some(lang) = iter.peek() {
                    if is_cxx_lang(lang) {
                        scan.needs_cxx_driver = true;
                    }
                }
                iter.next();
                continue;
            }
            if let Some(lang) = arg.strip_prefix("-x=").or_else(|| arg.strip_prefix("-x")) {
                if is_cxx_lang(lang) {
                    scan.needs_cxx_driver = true;
                }
                continue;
            }
            if arg.starts_with("-o=") {
                continue;
            }
            if arg.starts_with("-stdlib=") {
                scan.needs_cxx_driver = true;
                continue;
            }
            if arg == "-lstdc++" || arg == "-lc++" {
                scan.needs_cxx_driver = true;
                continue;
            }
            if takes_value(arg) {
                iter.next();
            }
            continue;
        }

        scan.inputs.push(arg.clone());
        let ext = extension(arg);
        if is_cxx_source_ext(&ext) {
            scan.needs_cxx_driver = true;
        }
        if is_source_ext(&ext) {
            scan.has_source_inputs = true;
        }
        if is_object_ext(&ext) || is_archive_ext(&ext) {
            scan.has_object_inputs = true;
        }
    }

    scan
}

fn looks_like_cxx_symbol(name: &str) -> bool {
    name.starts_with("_Z")
        || name.starts_with("__Z")
        || name.starts_with("__cxa")
        || name.starts_with("___cxa")
        || name.starts_with("__gxx_personality_v0")
        || name.starts_with("___gxx_personality_v0")
}

fn elf_has_cxx_symbols(elf: &goblin::elf::Elf) -> bool {
    for sym in elf.syms.iter() {
        if let Some(name) = elf.strtab.get_at(sym.st_name) {
            if looks_like_cxx_symbol(name) {
                return true;
            }
        }
    }
    for sym in elf.dynsyms.iter() {
        if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
            if looks_like_cxx_symbol(name) {
                return true;
            }
        }
    }
    false
}

fn bytes_have_cxx_symbols(path: &str, bytes: &[u8]) -> Result<bool, ToolchainError> {
    let object = Object::parse(bytes).map_err(|err| ToolchainError::ObjectInspection {
        path: path.to_owned(),
        message: err.to_string(),
    })?;

    match object {
        Object::Elf(elf) => Ok(elf_has_cxx_symbols(&elf)),
        Object::Archive(archive) => {
            for member_name in archive.members() {
                if let Ok(member) = archive.extract(member_name, bytes) {
                    if let Ok(true) = bytes_have_cxx_symbols(path, member) {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        Object::Mach(goblin::mach::Mach::Binary(macho)) => {
            if let Ok(symbols) = macho.symbols().collect::<Result<Vec<_>, _>>() {
                return Ok(symbols
                    .iter()
                    .any(|(name, _)| looks_like_cxx_symbol(name)));
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

fn path_looks_like_cxx_object(path: &str) -> Result<bool, ToolchainError> {
    let file = std::fs::File::open(path).map_err(|err| ToolchainError::ObjectInspection {
        path: path.to_owned(),
        message: err.to_string(),
    })?;
    let mapped = unsafe { Mmap::map(&file) }.map_err(|err| ToolchainError::ObjectInspection {
        path: path.to_owned(),
        message: err.to_string(),
    })?;
    bytes_have_cxx_symbols(path, &mapped)
}

fn find_program(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn find_clang() -> Option<PathBuf> {
    if let Ok(env) = std::env::var("CT_CLANG") {
        let candidate = PathBuf::from(&env);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    for name in [
        "clang",
        "clang-20",
        "clang-19",
        "clang-18",
        "clang-17",
        "clang-16",
        "clang-15",
        "clang++",
    ] {
        if let Some(found) = find_program(name) {
            return Some(found);
        }
    }
    None
}

fn detect_resource_dir(clang: &Path) -> Option<String> {
    let output = Command::new(clang)
        .arg("-print-resource-dir")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let dir = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if !dir.is_empty() && Path::new(&dir).exists() {
        Some(dir)
    } else {
        None
    }
}

#[cfg(target_os = "macos")]
fn detect_sysroot() -> Option<String> {
    let xcrun = find_program("xcrun")?;
    let output = Command::new(xcrun).arg("--show-sdk-path").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let sdk = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if !sdk.is_empty() && Path::new(&sdk).exists() {
        Some(sdk)
    } else {
        None
    }
}

#[cfg(not(target_os = "macos"))]
fn detect_sysroot() -> Option<String> {
    None
}

/// Resolve the toolchain for one driver invocation.
pub fn resolve_driver_config(args: &[String]) -> Result<DriverConfig, ToolchainError> {
    let scan = scan_args(args);
    let mut config = DriverConfig {
        force_cxx_driver: scan.needs_cxx_driver,
        ..DriverConfig::default()
    };

    // An object-only link with no language hints: look inside the inputs.
    if !scan.has_source_inputs && scan.has_object_inputs && !config.force_cxx_driver {
        for input in &scan.inputs {
            let ext = extension(input);
            if !is_object_ext(&ext) && !is_archive_ext(&ext) {
                continue;
            }
            if path_looks_like_cxx_object(input)? {
                config.force_cxx_driver = true;
                break;
            }
        }
    }

    // An explicit driver mode overrides the inference.
    if scan.has_driver_mode {
        config.force_cxx_driver = false;
    }

    config.clang_path = find_clang().ok_or(ToolchainError::ClangNotFound)?;

    if !scan.has_resource_dir {
        config.resource_dir = detect_resource_dir(&config.clang_path);
    }
    if !scan.has_sysroot {
        config.sysroot = detect_sysroot();
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cxx_detection_from_extensions() {
        let scan = scan_args(&args(&["-O2", "main.cpp", "-o", "app"]));
        assert!(scan.needs_cxx_driver);
        assert!(scan.has_source_inputs);

        let scan = scan_args(&args(&["main.c"]));
        assert!(!scan.needs_cxx_driver);
        assert!(scan.has_source_inputs);

        let scan = scan_args(&args(&["main.C"]));
        assert!(scan.needs_cxx_driver);
    }

    #[test]
    fn cxx_detection_from_flags() {
        assert!(scan_args(&args(&["-x", "c++", "in.ii"])).needs_cxx_driver);
        assert!(scan_args(&args(&["-xc++", "input"])).needs_cxx_driver);
        assert!(scan_args(&args(&["-stdlib=libc++", "a.o"])).needs_cxx_driver);
        assert!(scan_args(&args(&["-lstdc++", "a.o"])).needs_cxx_driver);
        assert!(!scan_args(&args(&["-x", "c", "in.i"])).needs_cxx_driver);
    }

    #[test]
    fn value_flags_do_not_swallow_inputs() {
        let scan = scan_args(&args(&["-I", "include", "-D", "X=1", "main.c"]));
        assert_eq!(scan.inputs, args(&["main.c"]));
    }

    #[test]
    fn object_inputs_are_classified() {
        let scan = scan_args(&args(&["foo.o", "libbar.a"]));
        assert!(scan.has_object_inputs);
        assert!(!scan.has_source_inputs);
    }

    #[test]
    fn explicit_settings_suppress_detection() {
        let scan = scan_args(&args(&["-resource-dir", "/x", "-isysroot", "/sdk", "a.c"]));
        assert!(scan.has_resource_dir);
        assert!(scan.has_sysroot);

        let scan = scan_args(&args(&["--driver-mode=g++", "a.cpp"]));
        assert!(scan.has_driver_mode);
    }

    #[test]
    fn passthrough_section_is_all_inputs() {
        let scan = scan_args(&args(&["--", "-weird.c"]));
        assert_eq!(scan.inputs, args(&["-weird.c"]));
    }

    #[test]
    fn cxx_symbol_names() {
        assert!(looks_like_cxx_symbol("_Z3foov"));
        assert!(looks_like_cxx_symbol("__cxa_throw"));
        assert!(looks_like_cxx_symbol("__gxx_personality_v0"));
        assert!(!looks_like_cxx_symbol("main"));
        assert!(!looks_like_cxx_symbol("printf"));
    }

    #[test]
    fn missing_object_reports_inspection_error() {
        let err = path_looks_like_cxx_object("/nonexistent/x.o").unwrap_err();
        assert!(matches!(err, ToolchainError::ObjectInspection { .. }));
    }
}
