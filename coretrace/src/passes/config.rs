//! `--ct-*` flag parsing and the runtime-config globals.
//!
//! The driver strips the recognized flags from the forwarded argument list
//! and keeps the resulting [`RuntimeConfig`] for the pass pipeline. The
//! [`ConfigPass`] runs last and emits weak-ODR `i32` globals with fixed
//! names into every module; the runtime's constructor folds them with
//! environment overrides.

use std::convert::Infallible;

use crate::ir::Module;
use crate::logger::Logger;
use crate::passes::Pass;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub shadow: bool,
    pub shadow_aggressive: bool,
    pub bounds_no_abort: bool,
    pub trace: bool,
    pub alloc: bool,
    pub bounds: bool,
    pub vtable: bool,
    pub autofree: bool,
    pub alloc_trace: bool,
    pub vcall_trace: bool,
    pub vtable_diag: bool,
    pub optnone: bool,
    /// Derived: bounds checking without allocation tracking.
    pub bounds_without_alloc: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shadow: false,
            shadow_aggressive: false,
            bounds_no_abort: false,
            trace: true,
            alloc: true,
            bounds: true,
            vtable: false,
            autofree: false,
            alloc_trace: true,
            vcall_trace: false,
            vtable_diag: false,
            optnone: false,
            bounds_without_alloc: false,
        }
    }
}

/// Reset the module toggles, then enable those named in the list.
fn apply_module_list(config: &mut RuntimeConfig, value: &str) {
    config.trace = false;
    config.alloc = false;
    config.bounds = false;
    config.vtable = false;

    for token in value.split(',') {
        match token.trim() {
            "all" => {
                config.trace = true;
                config.alloc = true;
                config.bounds = true;
                config.vtable = true;
            }
            "trace" => config.trace = true,
            "alloc" => config.alloc = true,
            "bounds" => config.bounds = true,
            "vtable" => config.vtable = true,
            _ => {}
        }
    }
}

/// Split the `--ct-*` flags out of `input`, returning the filtered list
/// (what gets forwarded to clang) and the parsed configuration.
pub fn extract_runtime_config(input: &[String]) -> (Vec<String>, RuntimeConfig) {
    let mut filtered = Vec::with_capacity(input.len());
    let mut config = RuntimeConfig::default();

    for arg in input {
        match arg.as_str() {
            "--ct-shadow" => config.shadow = true,
            "--ct-shadow-aggressive" => {
                config.shadow = true;
                config.shadow_aggressive = true;
            }
            "--ct-bounds-no-abort" => config.bounds_no_abort = true,
            "--ct-optnone" => config.optnone = true,
            "--ct-no-optnone" => config.optnone = false,
            "--ct-trace" => config.trace = true,
            "--ct-no-trace" => config.trace = false,
            "--ct-alloc" => config.alloc = true,
            "--ct-no-alloc" => config.alloc = false,
            "--ct-bounds" => config.bounds = true,
            "--ct-no-bounds" => config.bounds = false,
            "--ct-autofree" => config.autofree = true,
            "--ct-no-autofree" => config.autofree = false,
            "--ct-alloc-trace" => config.alloc_trace = true,
            "--ct-no-alloc-trace" => config.alloc_trace = false,
            "--ct-vcall-trace" => config.vcall_trace = true,
            "--ct-no-vcall-trace" => config.vcall_trace = false,
            "--ct-vtable-diag" => config.vtable_diag = true,
            "--ct-no-vtable-diag" => config.vtable_diag = false,
            _ => {
                if let Some(value) = arg.strip_prefix("--ct-shadow=") {
                    if value == "aggressive" {
                        config.shadow = true;
                        config.shadow_aggressive = true;
                    }
                } else if let Some(value) = arg.strip_prefix("--ct-modules=") {
                    apply_module_list(&mut config, value);
                } else {
                    filtered.push(arg.clone());
                }
            }
        }
    }

    config.bounds_without_alloc = config.bounds && !config.alloc;
    (filtered, config)
}

/// Emits the `__ct_config_*` globals. Must run after every other pass so
/// the module carries the configuration its instrumentation was built for.
pub struct ConfigPass {
    config: RuntimeConfig,
}

impl ConfigPass {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

impl Pass for ConfigPass {
    type Error = Infallible;

    fn name(&self) -> String {
        "ConfigPass".to_string()
    }

    fn run(&mut self, module: &mut Module, _logger: &Logger) -> Result<(), Self::Error> {
        let config = &self.config;
        module.set_config_global("__ct_config_shadow", config.shadow as i32);
        module.set_config_global(
            "__ct_config_shadow_aggressive",
            config.shadow_aggressive as i32,
        );
        module.set_config_global(
            "__ct_config_bounds_no_abort",
            config.bounds_no_abort as i32,
        );
        module.set_config_global("__ct_config_disable_alloc", !config.alloc as i32);
        module.set_config_global("__ct_config_disable_autofree", !config.autofree as i32);
        module.set_config_global(
            "__ct_config_disable_alloc_trace",
            !config.alloc_trace as i32,
        );
        module.set_config_global("__ct_config_vtable_diag", config.vtable_diag as i32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_match_help_text() {
        let (_, config) = extract_runtime_config(&[]);
        assert!(config.trace && config.alloc && config.bounds);
        assert!(!config.vtable && !config.shadow && !config.autofree);
        assert!(config.alloc_trace);
        assert!(!config.bounds_no_abort);
        assert!(!config.bounds_without_alloc);
    }

    #[test]
    fn ct_flags_are_stripped_and_rest_forwarded() {
        let (filtered, config) = extract_runtime_config(&args(&[
            "-O2",
            "--ct-shadow",
            "main.c",
            "--ct-no-alloc",
            "-o",
            "app",
        ]));
        assert_eq!(filtered, args(&["-O2", "main.c", "-o", "app"]));
        assert!(config.shadow);
        assert!(!config.alloc);
        assert!(config.bounds_without_alloc);
    }

    #[test]
    fn shadow_value_form_enables_aggressive() {
        let (_, config) = extract_runtime_config(&args(&["--ct-shadow=aggressive"]));
        assert!(config.shadow && config.shadow_aggressive);

        let (_, config) = extract_runtime_config(&args(&["--ct-shadow=bogus"]));
        assert!(!config.shadow);
    }

    #[test]
    fn module_list_resets_before_applying() {
        let (_, config) = extract_runtime_config(&args(&["--ct-modules=bounds,vtable"]));
        assert!(!config.trace && !config.alloc);
        assert!(config.bounds && config.vtable);

        let (_, config) = extract_runtime_config(&args(&["--ct-modules=all"]));
        assert!(config.trace && config.alloc && config.bounds && config.vtable);

        let (_, config) = extract_runtime_config(&args(&["--ct-modules= trace , alloc "]));
        assert!(config.trace && config.alloc && !config.bounds);
    }

    #[test]
    fn later_flags_win() {
        let (_, config) =
            extract_runtime_config(&args(&["--ct-autofree", "--ct-no-autofree"]));
        assert!(!config.autofree);
        let (_, config) =
            extract_runtime_config(&args(&["--ct-no-trace", "--ct-trace"]));
        assert!(config.trace);
    }

    #[test]
    fn config_globals_are_emitted() {
        let mut module = parse_module("define void @f() {\n  ret void\n}\n").unwrap();
        let (_, mut config) = extract_runtime_config(&args(&["--ct-shadow", "--ct-autofree"]));
        config.vtable_diag = true;

        let logger = crate::logger::Logger::quiet();
        let mut pass = ConfigPass::new(config);
        pass.run(&mut module, &logger).unwrap();

        let printed = module.print();
        assert!(printed.contains("@__ct_config_shadow = weak_odr global i32 1"));
        assert!(printed.contains("@__ct_config_shadow_aggressive = weak_odr global i32 0"));
        assert!(printed.contains("@__ct_config_disable_alloc = weak_odr global i32 0"));
        assert!(printed.contains("@__ct_config_disable_autofree = weak_odr global i32 0"));
        assert!(printed.contains("@__ct_config_vtable_diag = weak_odr global i32 1"));
    }
}
