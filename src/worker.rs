//! The background compilation worker.
//!
//! One OS thread, started by `init`: it builds the precompiled header,
//! then drains the unit queue (translate, compile, load, publish) until
//! `finish` asks it to stop. It is never cancelled mid-unit; an
//! external compiler may still be producing temp files.

use crate::cc;
use crate::engine::{Engine, PchStatus, ACTIVE};
use crate::iseq::{JitFunc, LAST_JIT_FUNC, NOT_ADDED_JIT_FUNC, NOT_COMPILABLE_JIT_FUNC};
use crate::translate;
use crate::unit::Unit;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

pub(crate) fn run(engine: Arc<Engine>) {
    make_pch(&engine);

    let pch_failed = engine.lock().pch_status == PchStatus::Failed;
    if pch_failed {
        // No PCH, no compilation. Disable the engine and let a blocked
        // `finish` or GC hook proceed.
        ACTIVE.store(false, Ordering::Release);
        let mut state = engine.lock();
        state.worker_finished = true;
        engine.client_wakeup.notify_one();
        return;
    }

    loop {
        let unit = {
            let mut state = engine.lock();
            if state.finish_worker {
                break;
            }
            while state.queue.is_empty() && !state.finish_worker {
                state = match engine.worker_wakeup.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            state.queue.dequeue_best()
        };

        if let Some(unit) = unit {
            let func = convert_unit(&engine, &unit);
            let _state = engine.lock();
            publish(&unit, func);
        }
    }

    engine.lock().worker_finished = true;
}

/// Install the outcome into the iseq. A unit tombstoned between dequeue
/// and this point is dropped silently: its iseq is gone and nothing may
/// be written. Caller holds the engine mutex; the store itself is
/// atomic because the interpreter reads `jit_func` without it.
fn publish(unit: &Unit, func: usize) {
    if let Some(iseq) = unit.iseq() {
        iseq.publish_func(func);
    }
}

/// Build the precompiled header once and record the outcome.
fn make_pch(engine: &Engine) {
    let opts = &engine.opts;
    tracing::debug!(header = %engine.header_file.display(), "creating precompiled header");

    let args = cc::pch_argv(opts, &engine.header_file, &engine.pch_file);
    let status = match cc::run(opts.toolchain.program(), &args, opts.verbose) {
        Ok(status) if status.success() => PchStatus::Success,
        Ok(status) => {
            if opts.warnings || opts.verbose > 0 {
                tracing::warn!(?status, "precompiled header build failed");
            }
            PchStatus::Failed
        }
        Err(err) => {
            if opts.warnings || opts.verbose > 0 {
                tracing::warn!(%err, "could not start compiler for precompiled header");
            }
            PchStatus::Failed
        }
    };

    let mut state = engine.lock();
    state.pch_status = status;
    engine.pch_ready.notify_all();
}

/// Translate, compile and load one unit. Returns the function address
/// to publish: a real pointer on success, otherwise a sentinel.
fn convert_unit(engine: &Engine, unit: &Unit) -> usize {
    let opts = &engine.opts;
    let c_file = cc::c_file(&opts.temp_dir, unit.id());
    let so_file = cc::so_file(&opts.temp_dir, unit.id());
    let funcname = cc::funcname(unit.id());

    let Some(iseq) = unit.iseq() else {
        // Collected between dequeue and translation; nothing to do.
        return NOT_ADDED_JIT_FUNC;
    };

    // The translator reads iseq internals; keep it out of any
    // collection window.
    engine.enter_jit_section();
    tracing::debug!(
        unit = unit.id(),
        method = %iseq.location.label,
        path = %iseq.location.path,
        line = iseq.location.first_lineno,
        file = %c_file.display(),
        "start compile"
    );
    let translated = translate::translate(&iseq, &funcname);
    engine.exit_jit_section();

    let body = match translated {
        Ok(body) => body,
        Err(err) => {
            if opts.warnings || opts.verbose > 0 {
                tracing::warn!(unit = unit.id(), %err, "translation rejected");
            }
            return NOT_COMPILABLE_JIT_FUNC;
        }
    };

    let mut source = String::new();
    if opts.toolchain == crate::config::Toolchain::Gcc {
        // Clang picks the PCH up via -include-pch; GCC wants the plain
        // header name and finds the .gch next to it.
        let header = engine.pch_file.display().to_string();
        let header = header.strip_suffix(".gch").unwrap_or(&header);
        source.push_str(&format!("#include \"{}\"\n", header));
    }
    source.push_str(&body);

    if let Err(err) = std::fs::write(&c_file, &source) {
        if opts.warnings || opts.verbose > 0 {
            tracing::warn!(file = %c_file.display(), %err, "could not write generated source");
        }
        return NOT_COMPILABLE_JIT_FUNC;
    }

    let start = Instant::now();
    let args = cc::object_argv(opts, &c_file, &so_file, &engine.pch_file);
    let compiled = match cc::run(opts.toolchain.program(), &args, opts.verbose) {
        Ok(status) => status.success(),
        Err(err) => {
            if opts.warnings || opts.verbose > 0 {
                tracing::warn!(%err, "could not start compiler");
            }
            false
        }
    };
    let elapsed = start.elapsed();

    if !opts.save_temps {
        let _ = std::fs::remove_file(&c_file);
    }
    if !compiled {
        tracing::debug!(file = %so_file.display(), "failed to compile unit");
        return NOT_COMPILABLE_JIT_FUNC;
    }

    let func = load_func_from_so(engine, unit, &so_file, &funcname);
    if !opts.save_temps {
        let _ = std::fs::remove_file(&so_file);
    }

    if func > LAST_JIT_FUNC {
        tracing::info!(
            unit = unit.id(),
            method = %iseq.location.label,
            path = %iseq.location.path,
            line = iseq.location.first_lineno,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "JIT success"
        );
    }
    func
}

/// Load the compiled object and resolve the generated function. The
/// unit keeps the handle: generated code stays mapped for as long as
/// the unit is retained.
fn load_func_from_so(engine: &Engine, unit: &Unit, so_file: &std::path::Path, funcname: &str) -> usize {
    let opts = &engine.opts;
    let lib = match unsafe { libloading::Library::new(so_file) } {
        Ok(lib) => lib,
        Err(err) => {
            if opts.warnings || opts.verbose > 0 {
                tracing::warn!(file = %so_file.display(), %err, "failure in loading generated code");
            }
            return NOT_ADDED_JIT_FUNC;
        }
    };
    unit.set_handle(lib);
    let Some(lib) = unit.library() else {
        return NOT_ADDED_JIT_FUNC;
    };
    match unsafe { lib.get::<JitFunc>(funcname.as_bytes()) } {
        Ok(symbol) => *symbol as usize,
        Err(err) => {
            if opts.warnings || opts.verbose > 0 {
                tracing::warn!(%funcname, %err, "generated function not found in object");
            }
            NOT_ADDED_JIT_FUNC
        }
    }
}
