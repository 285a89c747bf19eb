//! The driver orchestrator.
//!
//! [`compile`] is the public contract: split the argument list into
//! `--ct-*` configuration and clang arguments, resolve the toolchain, plan
//! jobs through the clang driver, run every cc1 job up to LLVM IR, pipe
//! the parsed module through the instrumentation passes, re-emit objects
//! and finally execute the remaining (link) jobs. Diagnostics from the
//! driver, the cc1 jobs and the linker are merged in that order; the first
//! failing job aborts the batch.

mod jobs;

pub use jobs::{cc1_args_for_ir_input, plan_jobs, Job, JobPlan};

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::emit;
use crate::ir::{self, IrError};
use crate::logger::Logger;
use crate::passes::{
    extract_runtime_config, AllocPass, BoundsPass, ConfigPass, OptNonePass, Pass, RuntimeConfig,
    TracePass, VtablePass,
};
use crate::toolchain::{self, ToolchainError};

/// Where the compilation result goes: object files on disk, or the
/// instrumented IR of a single translation unit as a string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    ToFile,
    ToMemory,
}

/// The outcome surfaced to the CLI and the C ABI.
#[derive(Debug, Default)]
pub struct CompileResult {
    pub success: bool,
    pub diagnostics: String,
    pub llvm_ir: String,
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{0}")]
    Toolchain(#[from] ToolchainError),

    #[error("{0}")]
    JobPlan(String),

    #[error("frontend failure: {0}")]
    Frontend(String),

    #[error("codegen failure: {0}")]
    Codegen(String),

    #[error("link failure: {0}")]
    Link(String),

    #[error("{0}")]
    Ir(#[from] IrError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalize `-o=PATH` and `-x=LANG` into their space-separated forms.
fn normalize_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        if let Some(path) = arg.strip_prefix("-o=") {
            out.push("-o".to_owned());
            out.push(path.to_owned());
        } else if let Some(lang) = arg.strip_prefix("-x=") {
            out.push("-x".to_owned());
            out.push(lang.to_owned());
        } else {
            out.push(arg.clone());
        }
    }
    out
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn has_debug_flag(args: &[String]) -> bool {
    args.iter().any(|arg| arg.starts_with("-g") && arg != "-gcc-toolchain")
}

/// A link happens when none of the stop-early actions is requested.
fn link_requested(args: &[String]) -> bool {
    !(has_flag(args, "-c")
        || has_flag(args, "-S")
        || has_flag(args, "-E")
        || has_flag(args, "-emit-llvm"))
}

fn preprocess_or_assemble_only(args: &[String]) -> bool {
    has_flag(args, "-E") || has_flag(args, "-S") || has_flag(args, "-emit-llvm")
}

/// Locate the runtime staticlib to hand to the linker.
fn find_runtime_library() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CT_RUNTIME_LIB") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let exe = std::env::current_exe().ok()?;
    let exe_dir = exe.parent()?;
    for candidate in [
        exe_dir.join("libcoretrace_rt.a"),
        exe_dir.join("../lib/libcoretrace_rt.a"),
        exe_dir.join("../../coretrace_rt/libcoretrace_rt.a"),
    ] {
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn temp_path(stem: &str, ext: &str) -> PathBuf {
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "ct-{}-{}-{}.{}",
        std::process::id(),
        counter,
        stem,
        ext
    ))
}

fn append_diag(diagnostics: &mut String, chunk: &str) {
    if chunk.is_empty() {
        return;
    }
    if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
        diagnostics.push('\n');
    }
    diagnostics.push_str(chunk);
}

/// Run the configured pass pipeline over one module. The config globals go
/// in last so every inserted call observes the final configuration.
fn run_passes(
    module: &mut ir::Module,
    config: &RuntimeConfig,
    logger: &Logger,
) -> Result<(), DriverError> {
    fn run_one<P: Pass>(
        mut pass: P,
        module: &mut ir::Module,
        logger: &Logger,
    ) -> Result<(), DriverError> {
        pass.run(module, logger)
            .map_err(|err| DriverError::Frontend(format!("{}: {err}", pass.name())))
    }

    if config.optnone {
        run_one(OptNonePass::new(), module, logger)?;
    }
    if config.trace {
        run_one(TracePass::new(), module, logger)?;
    }
    if config.alloc {
        run_one(AllocPass::new(), module, logger)?;
    }
    if config.bounds {
        run_one(BoundsPass::new(), module, logger)?;
    }
    if config.vtable || config.vcall_trace || config.vtable_diag {
        run_one(
            VtablePass::new(
                config.vcall_trace || config.vtable,
                config.vtable_diag || config.vtable,
            ),
            module,
            logger,
        )?;
    }
    run_one(ConfigPass::new(*config), module, logger)?;
    Ok(())
}

/// Run the full pass pipeline over textual IR without touching the
/// toolchain: the instrumentation half of the `--in-mem` path.
pub fn instrument_ir(source: &str, config: &RuntimeConfig) -> Result<String, DriverError> {
    let mut module = ir::parse_module(source)?;
    let logger = Logger::quiet();
    run_passes(&mut module, config, &logger)?;
    Ok(module.print())
}

struct Prepared {
    clang_args: Vec<String>,
    config: RuntimeConfig,
    clang_path: PathBuf,
}

fn prepare(args: &[String], instrument: bool) -> Result<Prepared, DriverError> {
    let (user_args, config) = extract_runtime_config(args);
    let user_args = normalize_args(&user_args);

    let toolchain = toolchain::resolve_driver_config(&user_args)?;

    let mut clang_args: Vec<String> = Vec::new();
    if toolchain.force_cxx_driver {
        clang_args.push("--driver-mode=g++".to_owned());
    }
    if let Some(resource_dir) = &toolchain.resource_dir {
        clang_args.push("-resource-dir".to_owned());
        clang_args.push(resource_dir.clone());
    }
    if let Some(sysroot) = &toolchain.sysroot {
        clang_args.push("-isysroot".to_owned());
        clang_args.push(sysroot.clone());
    }

    let linking = link_requested(&user_args);

    if instrument && !preprocess_or_assemble_only(&user_args) {
        if !has_debug_flag(&user_args) {
            clang_args.push("-gline-tables-only".to_owned());
        }
        clang_args.push("-fno-builtin".to_owned());
        clang_args.push("-fno-builtin-malloc".to_owned());
        clang_args.push("-fno-builtin-free".to_owned());
        #[cfg(target_os = "linux")]
        clang_args.push("-fPIE".to_owned());
    }

    clang_args.extend(user_args.iter().cloned());

    if instrument && linking {
        if let Some(runtime) = find_runtime_library() {
            clang_args.push(runtime.to_string_lossy().into_owned());
        }
        if toolchain.force_cxx_driver {
            #[cfg(target_os = "macos")]
            clang_args.push("-lc++".to_owned());
            #[cfg(not(target_os = "macos"))]
            clang_args.push("-lstdc++".to_owned());
        }
        clang_args.push("-ldl".to_owned());
        clang_args.push("-lpthread".to_owned());
        #[cfg(target_os = "linux")]
        clang_args.push("-pie".to_owned());
    }

    Ok(Prepared {
        clang_args,
        config,
        clang_path: toolchain.clang_path,
    })
}

fn run_captured(executable: &str, args: &[String]) -> std::io::Result<(bool, String)> {
    let output = Command::new(executable).args(args).output()?;
    let mut captured = String::from_utf8_lossy(&output.stderr).into_owned();
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        append_diag(&mut captured, stdout.trim_end());
    }
    Ok((output.status.success(), captured))
}

/// Runs the batch, appending every job's output to `diagnostics` as it
/// goes, so a failing job still surfaces everything that came before it.
/// Returns the in-memory IR, if that was the mode.
fn compile_inner(
    args: &[String],
    mode: OutputMode,
    instrument: bool,
    logger: &mut Logger,
    diagnostics: &mut String,
) -> Result<String, DriverError> {
    let prepared = prepare(args, instrument)?;

    logger.set_title("Planning jobs");
    let plan = plan_jobs(&prepared.clang_path, &prepared.clang_args)?;
    append_diag(diagnostics, &plan.diagnostics);

    if mode == OutputMode::ToMemory
        && (plan.cc1_jobs.len() != 1 || !plan.other_jobs.is_empty())
    {
        return Err(DriverError::JobPlan(
            "in-memory output requires exactly one compile job".to_owned(),
        ));
    }

    // Plain passthrough: let the driver run the whole compilation itself.
    if mode == OutputMode::ToFile && !instrument {
        logger.set_title("Running clang");
        let clang = prepared.clang_path.to_string_lossy().into_owned();
        let (success, captured) = run_captured(&clang, &prepared.clang_args)?;
        append_diag(diagnostics, &captured);
        if !success {
            return Err(DriverError::Frontend(String::new()));
        }
        return Ok(String::new());
    }

    if instrument && plan.cc1_jobs.is_empty() {
        return Err(DriverError::JobPlan(
            "no compile jobs to instrument".to_owned(),
        ));
    }

    for (index, job) in plan.cc1_jobs.iter().enumerate() {
        logger.set_title(format!(
            "Compiling TU {}/{}",
            index + 1,
            plan.cc1_jobs.len()
        ));

        // Stop the frontend at textual IR.
        let ir_path = temp_path("tu", "ll");
        let ir_args = jobs::cc1_args_for_ir(&job.args, &ir_path.to_string_lossy());
        let (success, captured) = run_captured(&job.executable, &ir_args)?;
        append_diag(diagnostics, &captured);
        if !success {
            let _ = std::fs::remove_file(&ir_path);
            return Err(DriverError::Frontend(String::new()));
        }

        let source = std::fs::read_to_string(&ir_path)?;
        let mut module = ir::parse_module(&source)?;

        if instrument {
            run_passes(&mut module, &prepared.config, logger)?;
        }

        if mode == OutputMode::ToMemory {
            let _ = std::fs::remove_file(&ir_path);
            return Ok(module.print());
        }

        // Re-emit the object through the original cc1 job.
        let instrumented_path = temp_path("instr", "ll");
        emit::write_ir(&module, &instrumented_path)?;
        let emit_result = emit::object_from_cc1(
            &job.executable,
            &job.args,
            &instrumented_path.to_string_lossy(),
        );
        let _ = std::fs::remove_file(&ir_path);
        let _ = std::fs::remove_file(&instrumented_path);

        let captured = emit_result?;
        append_diag(diagnostics, &captured);
    }

    for job in &plan.other_jobs {
        logger.set_title(format!("Linking ({})", job.executable));
        let (success, captured) = run_captured(&job.executable, &job.args)?;
        append_diag(diagnostics, &captured);
        if !success {
            return Err(DriverError::Link(format!("{} failed", job.executable)));
        }
    }

    Ok(String::new())
}

/// Compile (and optionally instrument) one command line.
pub fn compile(args: &[String], mode: OutputMode, instrument: bool) -> CompileResult {
    let mut logger = if mode == OutputMode::ToMemory {
        Logger::quiet()
    } else {
        Logger::spinner()
    };

    let mut diagnostics = String::new();
    match compile_inner(args, mode, instrument, &mut logger, &mut diagnostics) {
        Ok(llvm_ir) => CompileResult {
            success: true,
            diagnostics,
            llvm_ir,
        },
        Err(err) => {
            match &err {
                DriverError::Frontend(message)
                | DriverError::Link(message)
                | DriverError::JobPlan(message) => append_diag(&mut diagnostics, message),
                other => append_diag(&mut diagnostics, &other.to_string()),
            }
            if diagnostics.is_empty() {
                diagnostics = "compilation failed".to_owned();
            }
            CompileResult {
                success: false,
                diagnostics,
                llvm_ir: String::new(),
            }
        }
    }
}
