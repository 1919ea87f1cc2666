//! Engine lifecycle against a real worker thread.
//!
//! The runtime header these tests point at is deliberately broken, so
//! the PCH build always resolves to failure whether or not a C compiler
//! is installed: the probe succeeds, the build does not. That exercises
//! the bootstrap, shutdown and disable paths without needing the host
//! VM's real header.

use method_jit::{
    finish, free_iseq, gc_finish_hook, gc_start_hook, init, submit, IseqBuilder, JitFuncState,
    JitOptions, Opcode,
};
use std::sync::Mutex;

// The engine is a process-wide singleton; lifecycle tests take turns.
static LIFECYCLE: Mutex<()> = Mutex::new(());

fn broken_header_options(temp: &tempfile::TempDir) -> JitOptions {
    let header_dir = temp.path().join("include");
    std::fs::create_dir_all(&header_dir).unwrap();
    std::fs::write(
        header_dir.join("vm_jit_runtime.h"),
        "#error this header never compiles\n",
    )
    .unwrap();

    let mut opts = JitOptions::enabled();
    opts.temp_dir = temp.path().to_path_buf();
    opts.header_dirs = vec![header_dir];
    opts
}

fn leave_iseq() -> std::sync::Arc<method_jit::Iseq> {
    IseqBuilder::new()
        .encoded(vec![Opcode::PutNil as u64, Opcode::Leave as u64])
        .stack_max(1)
        .build()
}

#[test]
fn missing_header_disables_engine_cleanly() {
    let _turn = LIFECYCLE.lock().unwrap_or_else(|p| p.into_inner());

    let temp = tempfile::tempdir().unwrap();
    let mut opts = JitOptions::enabled();
    opts.temp_dir = temp.path().to_path_buf();
    opts.header_dirs = vec![temp.path().join("no-such-dir")];

    let err = init(opts).unwrap_err();
    assert!(err.to_string().contains("vm_jit_runtime.h"));

    // The engine never came up: everything is a silent no-op.
    let iseq = leave_iseq();
    submit(&iseq);
    assert!(iseq.unit().is_none());
    gc_start_hook();
    gc_finish_hook();
    free_iseq(&iseq);
    finish();
}

#[test]
fn failed_pch_build_disables_engine() {
    let _turn = LIFECYCLE.lock().unwrap_or_else(|p| p.into_inner());

    let temp = tempfile::tempdir().unwrap();
    init(broken_header_options(&temp)).unwrap();

    let iseq = leave_iseq();
    iseq.record_call();
    submit(&iseq);

    // finish waits for the PCH build to resolve and joins the worker.
    finish();

    // The worker never compiled anything.
    assert_eq!(iseq.jit_func(), JitFuncState::NotAdded);

    // Disabled engine: later submits are no-ops.
    let late = leave_iseq();
    submit(&late);
    assert!(late.unit().is_none());
}

#[test]
fn double_init_is_rejected() {
    let _turn = LIFECYCLE.lock().unwrap_or_else(|p| p.into_inner());

    let temp = tempfile::tempdir().unwrap();
    init(broken_header_options(&temp)).unwrap();
    let again = init(broken_header_options(&temp));
    assert!(again.is_err());
    finish();
}

#[test]
fn disabled_options_make_init_a_no_op() {
    let _turn = LIFECYCLE.lock().unwrap_or_else(|p| p.into_inner());

    init(JitOptions::default()).unwrap();
    let iseq = leave_iseq();
    submit(&iseq);
    assert!(iseq.unit().is_none());
    finish();
}
