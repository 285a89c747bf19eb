//! The `coretrace` CLI: a thin splitter between our own flags and the
//! clang command line, plus the help text. Everything interesting happens
//! in the library.

use std::process::exit;

use coretrace::{compile, OutputMode};

enum ParseOutcome {
    Ok,
    Help,
}

struct ParsedArgs {
    outcome: ParseOutcome,
    mode: OutputMode,
    instrument: bool,
    compiler_args: Vec<String>,
}

fn parse_args(args: &[String]) -> ParsedArgs {
    let mut parsed = ParsedArgs {
        outcome: ParseOutcome::Ok,
        mode: OutputMode::ToFile,
        instrument: false,
        compiler_args: Vec::with_capacity(args.len()),
    };

    if args.is_empty() {
        parsed.outcome = ParseOutcome::Help;
        return parsed;
    }

    let mut passthrough = false;
    for arg in args {
        if passthrough {
            parsed.compiler_args.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "-h" | "--help" => {
                parsed.outcome = ParseOutcome::Help;
                return parsed;
            }
            "--" => {
                parsed.compiler_args.push(arg.clone());
                passthrough = true;
            }
            "--in-mem" | "--in-memory" => parsed.mode = OutputMode::ToMemory,
            "--instrument" => parsed.instrument = true,
            _ => parsed.compiler_args.push(arg.clone()),
        }
    }

    parsed
}

fn print_help(argv0: &str) {
    let name = std::path::Path::new(argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "coretrace".to_owned());

    println!(
        "CoreTrace Compiler (based on the Clang/LLVM toolchain)

Usage:
  {name} [options] <sources/objects>...

Core options:
  -h, --help               Show this help and exit.
  --instrument             Enable CoreTrace instrumentation (required for --ct-*).
  --in-mem, --in-memory     Print LLVM IR to stdout (use with -emit-llvm).

Instrumentation toggles:
  --ct-modules=<list>       Comma-separated list: trace,alloc,bounds,vtable,all.
  --ct-shadow               Enable shadow memory.
  --ct-shadow-aggressive    Enable aggressive shadow mode.
  --ct-shadow=aggressive    Same as --ct-shadow-aggressive.
  --ct-bounds-no-abort      Do not abort on bounds errors.
  --ct-no-trace / --ct-trace
  --ct-no-alloc / --ct-alloc
  --ct-no-bounds / --ct-bounds
  --ct-no-autofree / --ct-autofree
  --ct-no-alloc-trace / --ct-alloc-trace
  --ct-no-vcall-trace / --ct-vcall-trace
  --ct-no-vtable-diag / --ct-vtable-diag
  --ct-no-optnone / --ct-optnone

Defaults:
  instrumentation: off
  modules: trace,alloc,bounds (vtable disabled)
  shadow: off, bounds abort: on, autofree: off, alloc trace: on

Notes:
  - All other arguments are forwarded to clang.
  - Output defaults to a.out when linking (override with -o or -o=<path>).

Examples:
  {name} --instrument -o app main.c

Exit codes:
  0 on success, 1 on compiler errors."
    );
}

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let parsed = parse_args(&argv[1..]);

    if matches!(parsed.outcome, ParseOutcome::Help) {
        print_help(&argv[0]);
        exit(0);
    }

    let result = compile(&parsed.compiler_args, parsed.mode, parsed.instrument);

    if !result.diagnostics.is_empty() {
        eprint!("{}", result.diagnostics);
        if !result.diagnostics.ends_with('\n') {
            eprintln!();
        }
    }
    if !result.success {
        exit(1);
    }

    if parsed.mode == OutputMode::ToMemory && !result.llvm_ir.is_empty() {
        println!("{}", result.llvm_ir);
    }

    exit(0);
}
