//! End-to-end pipeline tests over textual IR fixtures: the instrumentation
//! half of the compile flow, with clang itself stubbed out by hand-written
//! modules shaped like its -O0 output.

use coretrace::instrument_ir;
use coretrace::passes::extract_runtime_config;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// `void foo() { int *p = malloc(16); *p = 42; }` at -O0.
const NON_ESCAPING_LOCAL: &str = r#"; ModuleID = 'foo.c'
source_filename = "foo.c"
target datalayout = "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128"
target triple = "x86_64-unknown-linux-gnu"

define dso_local void @foo() #0 !dbg !10 {
  %1 = alloca ptr, align 8
  %2 = call noalias ptr @malloc(i64 noundef 16) #2, !dbg !13
  store ptr %2, ptr %1, align 8, !dbg !14
  %3 = load ptr, ptr %1, align 8, !dbg !15
  store i32 42, ptr %3, align 4, !dbg !16
  ret void, !dbg !17
}

declare noalias ptr @malloc(i64 noundef) #1

attributes #0 = { noinline nounwind optnone uwtable }
attributes #1 = { nounwind allocsize(0) }

!1 = !DIFile(filename: "foo.c", directory: "/tmp")
!10 = distinct !DISubprogram(name: "foo", scope: !1, file: !1, line: 2, unit: !0)
!13 = !DILocation(line: 2, column: 25, scope: !10)
!14 = !DILocation(line: 2, column: 21, scope: !10)
!15 = !DILocation(line: 2, column: 35, scope: !10)
!16 = !DILocation(line: 2, column: 38, scope: !10)
!17 = !DILocation(line: 2, column: 43, scope: !10)
"#;

#[test]
fn non_escaping_local_gets_autofree_before_ret() {
    let (_, config) = extract_runtime_config(&args(&["--ct-autofree"]));
    let out = instrument_ir(NON_ESCAPING_LOCAL, &config).unwrap();

    // The allocation is replaced and carries its site string.
    assert!(out.contains("call ptr @__ct_malloc(i64 16, ptr @.ct.site."));
    assert!(out.contains("c\"foo.c:2:25\\00\""));

    // The sole return is preceded by the autofree of the local pointer.
    let autofree = out.find("call void @__ct_autofree(ptr %2)").unwrap();
    let ret = out.find("ret void, !dbg !17").unwrap();
    assert!(autofree < ret);

    // Entry/exit tracing wraps the function body.
    let enter = out.find("call void @__ct_trace_enter").unwrap();
    assert!(enter < autofree);
    assert!(out.contains("call void @__ct_trace_exit_void"));

    // Bounds checks guard the stores and the reload.
    assert!(out.contains("@__ct_check_bounds(ptr %2, ptr %3, i64 4"));

    // Config globals arrive with the final configuration.
    assert!(out.contains("@__ct_config_disable_autofree = weak_odr global i32 0"));
    assert!(out.contains("@__ct_config_disable_alloc = weak_odr global i32 0"));
}

/// Scenario: the well-known basic allocation sequence, last malloc unused.
const BASIC_ALLOC: &str = r#"target triple = "x86_64-unknown-linux-gnu"

define dso_local i32 @main() {
  %1 = alloca ptr, align 8
  %2 = alloca ptr, align 8
  %3 = call noalias ptr @malloc(i64 noundef 8)
  store ptr %3, ptr %1, align 8
  %4 = load ptr, ptr %1, align 8
  call void @free(ptr noundef %4)
  %5 = call noalias ptr @calloc(i64 noundef 4, i64 noundef 4)
  store ptr %5, ptr %2, align 8
  %6 = load ptr, ptr %2, align 8
  %7 = call ptr @realloc(ptr noundef %6, i64 noundef 64)
  store ptr %7, ptr %2, align 8
  %8 = load ptr, ptr %2, align 8
  call void @free(ptr noundef %8)
  %9 = call noalias ptr @malloc(i64 noundef 16)
  ret i32 0
}

declare noalias ptr @malloc(i64 noundef)
declare void @free(ptr noundef)
declare noalias ptr @calloc(i64 noundef, i64 noundef)
declare ptr @realloc(ptr noundef, i64 noundef)
"#;

#[test]
fn basic_alloc_sequence_is_fully_rewritten() {
    let (_, config) = extract_runtime_config(&[]);
    let out = instrument_ir(BASIC_ALLOC, &config).unwrap();

    assert!(out.contains("%3 = call ptr @__ct_malloc(i64 8"));
    assert!(out.contains("%5 = call ptr @__ct_calloc(i64 4, i64 4"));
    assert!(out.contains("%7 = call ptr @__ct_realloc(ptr %6, i64 64"));
    assert_eq!(out.matches("call void @__ct_free(ptr %").count(), 2);

    // The dangling 16-byte malloc is unreachable and freed immediately.
    assert!(out.contains("%9 = call ptr @__ct_malloc_unreachable(i64 16"));
    let unreachable = out.find("__ct_malloc_unreachable").unwrap();
    let autofree = out.find("call void @__ct_autofree(ptr %9)").unwrap();
    assert!(unreachable < autofree);

    // No stray references to the libc symbols remain in the body.
    assert!(!out.contains("call noalias ptr @malloc"));
    assert!(!out.contains("call void @free("));
}

/// Returned allocations must never be auto-freed.
const ESCAPING_RETURN: &str = r#"define dso_local ptr @make() {
  %1 = call noalias ptr @malloc(i64 noundef 32)
  ret ptr %1
}

declare noalias ptr @malloc(i64 noundef)
"#;

#[test]
fn escaping_allocation_is_replaced_but_not_autofreed() {
    let (_, config) = extract_runtime_config(&args(&["--ct-autofree"]));
    let out = instrument_ir(ESCAPING_RETURN, &config).unwrap();
    assert!(out.contains("@__ct_malloc(i64 32"));
    assert!(!out.contains("__ct_autofree"));
}

/// Module selection drives which passes run at all.
#[test]
fn module_list_limits_instrumentation() {
    let (_, config) = extract_runtime_config(&args(&["--ct-modules=bounds"]));
    let out = instrument_ir(NON_ESCAPING_LOCAL, &config).unwrap();

    assert!(out.contains("__ct_check_bounds"));
    assert!(!out.contains("__ct_trace_enter"));
    assert!(!out.contains("__ct_malloc"));
    // Disabled alloc tracking is reflected in the config globals.
    assert!(out.contains("@__ct_config_disable_alloc = weak_odr global i32 1"));
}

/// The vtable pass finds the vptr dispatch pattern in C++-shaped IR.
const VIRTUAL_DISPATCH: &str = r#"define dso_local void @call_it(ptr noundef %0) {
  %2 = alloca ptr, align 8
  store ptr %0, ptr %2, align 8
  %3 = load ptr, ptr %2, align 8
  %4 = load ptr, ptr %3, align 8
  %5 = getelementptr inbounds ptr, ptr %4, i64 1
  %6 = load ptr, ptr %5, align 8
  call void %6(ptr noundef %3)
  ret void
}
"#;

#[test]
fn vcall_tracing_instruments_dispatch_pattern() {
    let (_, config) = extract_runtime_config(&args(&["--ct-vcall-trace", "--ct-vtable-diag"]));
    let out = instrument_ir(VIRTUAL_DISPATCH, &config).unwrap();

    assert!(out.contains("call void @__ct_vtable_dump(ptr %3"));
    assert!(out.contains("call void @__ct_vcall_trace(ptr %3, ptr %6"));
    assert!(out.contains("@__ct_config_vtable_diag = weak_odr global i32 1"));
}

/// Sites fall back to `<unknown>` without debug info, and every
/// instrumentation call still carries a non-null site argument.
#[test]
fn missing_debug_info_yields_unknown_sites() {
    let (_, config) = extract_runtime_config(&[]);
    let out = instrument_ir(
        "define void @f() {\n  %p = call ptr @malloc(i64 8)\n  store i8 1, ptr %p, align 1\n  call void @free(ptr %p)\n  ret void\n}\ndeclare ptr @malloc(i64)\ndeclare void @free(ptr)\n",
        &config,
    )
    .unwrap();
    assert!(out.contains("c\"<unknown>\\00\""));
    assert!(!out.contains("ptr null)"));
}

/// A C++ new/delete pair rewrites to the operator-new interceptors.
#[test]
fn new_delete_pair_is_rewritten() {
    let (_, config) = extract_runtime_config(&[]);
    let out = instrument_ir(
        "define void @f() {\n  %1 = call noalias noundef nonnull ptr @_Znwm(i64 noundef 4)\n  store i32 0, ptr %1, align 4\n  call void @_ZdlPvm(ptr noundef %1, i64 noundef 4)\n  ret void\n}\ndeclare noundef nonnull ptr @_Znwm(i64 noundef)\ndeclare void @_ZdlPvm(ptr noundef, i64 noundef)\n",
        &config,
    )
    .unwrap();
    assert!(out.contains("%1 = call ptr @__ct_new(i64 4"));
    assert!(out.contains("call void @__ct_delete(ptr %1)"));
}

/// The optnone pass annotates function headers when enabled.
#[test]
fn optnone_flag_annotates_functions() {
    let (_, config) = extract_runtime_config(&args(&["--ct-optnone", "--ct-modules=trace"]));
    let out = instrument_ir("define void @f() {\n  ret void\n}\n", &config).unwrap();
    assert!(out.contains("define void @f() optnone noinline {"));
}
