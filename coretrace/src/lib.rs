//! `coretrace` is a Clang driver wrapper that rewrites the LLVM IR of user
//! translation units with tracing, allocation-tracking, bounds-checking and
//! virtual-call instrumentation, then links the result against the
//! `coretrace_rt` runtime.
//!
//! The flow mirrors clang's own: the [`driver`] plans jobs through the
//! clang driver, runs every cc1 job up to textual LLVM IR, hands the parsed
//! module to the [`passes`], and re-emits object files before running the
//! link jobs. Everything in [`ir`] exists so the passes can reason about
//! the module without linking LLVM itself.

mod capi;
mod logger;

pub mod driver;
pub mod emit;
pub mod ir;
pub mod passes;
pub mod toolchain;

pub use capi::compile_c;
pub use driver::{compile, instrument_ir, CompileResult, DriverError, OutputMode};
pub use logger::Logger;
