//! File emission: textual IR directly, objects and bitcode through the
//! toolchain.

use std::path::Path;
use std::process::Command;

use crate::driver::DriverError;
use crate::ir::Module;

/// Write the module as textual LLVM IR.
pub fn write_ir(module: &Module, path: &Path) -> std::io::Result<()> {
    std::fs::write(path, module.print())
}

/// Produce the original cc1 job's object file from an instrumented IR
/// file: same arguments, same output, but the input language switched to
/// `ir` and the input path swapped. Returns the captured diagnostics.
pub fn object_from_cc1(
    executable: &str,
    cc1_args: &[String],
    ir_input: &str,
) -> Result<String, DriverError> {
    let rewritten = crate::driver::cc1_args_for_ir_input(cc1_args, ir_input);
    let output = Command::new(executable)
        .args(&rewritten)
        .output()
        .map_err(|err| DriverError::Codegen(format!("failed to run {executable}: {err}")))?;

    let captured = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(DriverError::Codegen(if captured.is_empty() {
            "object emission failed".to_owned()
        } else {
            captured
        }));
    }
    Ok(captured)
}

/// Emit a bitcode file from the module through clang.
pub fn bitcode_from_module(
    module: &Module,
    clang: &Path,
    output: &Path,
) -> Result<(), DriverError> {
    let temp = std::env::temp_dir().join(format!("ct-bc-{}.ll", std::process::id()));
    write_ir(module, &temp)?;

    let status = Command::new(clang)
        .args(["-x", "ir", "-c", "-emit-llvm"])
        .arg(&temp)
        .arg("-o")
        .arg(output)
        .output();
    let _ = std::fs::remove_file(&temp);

    let output_result =
        status.map_err(|err| DriverError::Codegen(format!("failed to run clang: {err}")))?;
    if !output_result.status.success() {
        return Err(DriverError::Codegen(
            String::from_utf8_lossy(&output_result.stderr).into_owned(),
        ));
    }
    Ok(())
}
