//! Engine globals, lifecycle, and the GC/JIT gate.
//!
//! All shared state lives in one `Engine` value behind a process-wide
//! slot: the options snapshot, the header/PCH paths, the mutex-guarded
//! mutable state and the four condition variables coordinating the
//! interpreter, the worker and the garbage collector.

use crate::cc;
use crate::config::JitOptions;
use crate::error::JitError;
use crate::iseq::Iseq;
use crate::queue::UnitQueue;
use crate::unit::Unit;
use crate::worker;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once};
use std::thread::JoinHandle;

/// Status of the precompiled header build. Transitions exactly once out
/// of `NotReady`, under the engine mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PchStatus {
    NotReady,
    Success,
    Failed,
}

/// Mutable engine state, guarded by `Engine::state`.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub queue: UnitQueue,
    /// Retained units: they own the dlopen handles.
    pub units: Vec<Arc<Unit>>,
    pub pch_status: PchStatus,
    /// True while a collection runs; the translator must not read iseqs.
    pub in_gc: bool,
    /// True while the translator reads iseqs; GC must wait.
    pub in_jit: bool,
    pub finish_worker: bool,
    pub worker_finished: bool,
    next_unit_id: u64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            queue: UnitQueue::new(),
            units: Vec::new(),
            pch_status: PchStatus::NotReady,
            in_gc: false,
            in_jit: false,
            finish_worker: false,
            worker_finished: false,
            next_unit_id: 0,
        }
    }
}

/// The engine singleton's payload.
#[derive(Debug)]
pub(crate) struct Engine {
    pub opts: JitOptions,
    pub header_file: PathBuf,
    pub pch_file: PathBuf,
    pub state: Mutex<EngineState>,
    /// Signaled when the PCH build resolves; `finish` waits here.
    pub pch_ready: Condvar,
    /// Signaled when the worker leaves the in_jit region (and on worker
    /// bootstrap failure); `gc_start_hook` waits here.
    pub client_wakeup: Condvar,
    /// Signaled when the queue fills or shutdown starts; the worker
    /// waits here.
    pub worker_wakeup: Condvar,
    /// Signaled when a collection finishes; the worker waits here
    /// before entering the in_jit region.
    pub gc_wakeup: Condvar,
}

impl Engine {
    fn new(opts: JitOptions, header_file: PathBuf) -> Self {
        let pch_file = cc::pch_file(&opts.temp_dir);
        Self {
            opts,
            header_file,
            pch_file,
            state: Mutex::new(EngineState::new()),
            pch_ready: Condvar::new(),
            client_wakeup: Condvar::new(),
            worker_wakeup: Condvar::new(),
            gc_wakeup: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Translator-side half of the GC gate: wait out any running
    /// collection, then mark iseq reads in progress.
    pub(crate) fn enter_jit_section(&self) {
        let mut state = self.lock();
        while state.in_gc {
            tracing::trace!("worker waiting for GC to finish");
            state = match self.gc_wakeup.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        state.in_jit = true;
    }

    /// Leave the iseq-reading region and release any blocked collector.
    pub(crate) fn exit_jit_section(&self) {
        let mut state = self.lock();
        state.in_jit = false;
        self.client_wakeup.notify_one();
    }
}

struct EngineHandle {
    engine: Arc<Engine>,
    worker: Option<JoinHandle<()>>,
}

static ENGINE: Mutex<Option<EngineHandle>> = Mutex::new(None);

/// Fast-path flag the public API checks before touching the slot.
/// Cleared on PCH failure, in forked children, and by `finish`.
pub(crate) static ACTIVE: AtomicBool = AtomicBool::new(false);

static ATFORK: Once = Once::new();

fn slot() -> MutexGuard<'static, Option<EngineHandle>> {
    match ENGINE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn current_engine() -> Option<Arc<Engine>> {
    if !ACTIVE.load(Ordering::Acquire) {
        return None;
    }
    slot().as_ref().map(|handle| Arc::clone(&handle.engine))
}

extern "C" fn atfork_child() {
    // The worker thread does not exist in the child; only flip the flag
    // here and leave the heavier teardown to `after_fork_child`.
    ACTIVE.store(false, Ordering::Release);
}

/// Start the engine and launch the worker thread.
///
/// A disabled options snapshot makes this a no-op. Failure leaves the
/// engine disabled; the interpreter keeps interpreting.
pub fn init(opts: JitOptions) -> Result<(), JitError> {
    if !opts.enabled {
        return Ok(());
    }

    let mut slot = slot();
    if slot.is_some() {
        return Err(JitError::AlreadyInitialized);
    }

    let header_file = cc::find_header(&opts.header_dirs).ok_or_else(|| {
        tracing::warn!(dirs = ?opts.header_dirs, "JIT runtime header not found; engine disabled");
        JitError::HeaderNotFound {
            name: cc::HEADER_FILE_NAME.to_string(),
            searched: opts.header_dirs.clone(),
        }
    })?;

    let engine = Arc::new(Engine::new(opts, header_file));
    let worker_engine = Arc::clone(&engine);
    let handle = std::thread::Builder::new()
        .name("mjit-worker".to_string())
        .spawn(move || worker::run(worker_engine))
        .map_err(JitError::WorkerSpawn)?;

    ATFORK.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(atfork_child));
    });

    *slot = Some(EngineHandle {
        engine,
        worker: Some(handle),
    });
    ACTIVE.store(true, Ordering::Release);
    tracing::debug!("JIT engine initialized");
    Ok(())
}

/// Submit an iseq for compilation: create its unit, enqueue it and wake
/// the worker. Idempotent for an iseq that already has a unit.
pub fn submit(iseq: &Arc<Iseq>) {
    let Some(engine) = current_engine() else {
        return;
    };
    if iseq.unit().is_some() {
        return;
    }

    let mut state = engine.lock();
    let id = state.next_unit_id;
    let unit = Unit::new(id, iseq);
    if iseq.jit_unit.set(Arc::clone(&unit)).is_err() {
        // Lost a submit race; the winner's unit is already queued.
        return;
    }
    state.next_unit_id += 1;
    state.queue.enqueue(Arc::clone(&unit));
    state.units.push(unit);
    evict_surplus(&engine, &mut state);
    tracing::trace!(unit = id, queued = state.queue.len(), "unit enqueued, waking worker");
    engine.worker_wakeup.notify_all();
}

/// Unload surplus tombstoned units. Units whose iseq is live are never
/// unloaded: a native frame may still be executing in their code.
fn evict_surplus(engine: &Engine, state: &mut EngineState) {
    let max = engine.opts.max_cache_size;
    if state.units.len() <= max {
        return;
    }
    let mut excess = state.units.len() - max;
    let mut idx = 0;
    while excess > 0 && idx < state.units.len() {
        if state.units[idx].is_tombstoned() {
            let unit = state.units.remove(idx);
            state.queue.remove(&unit);
            tracing::debug!(unit = unit.id(), "unloading tombstoned unit");
            excess -= 1;
        } else {
            idx += 1;
        }
    }
}

/// Tombstone the unit of an iseq about to be collected. Must complete
/// before the iseq memory is reused.
pub fn free_iseq(iseq: &Iseq) {
    let Some(engine) = current_engine() else {
        return;
    };
    let _state = engine.lock();
    if let Some(unit) = iseq.unit() {
        unit.tombstone();
    }
}

/// Called by the host at the start of a collection. Returns only once
/// the translator is outside its iseq-reading region.
pub fn gc_start_hook() {
    let Some(engine) = current_engine() else {
        return;
    };
    let mut state = engine.lock();
    while state.in_jit {
        tracing::trace!("GC waiting for worker to leave the JIT section");
        state = match engine.client_wakeup.wait(state) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
    }
    state.in_gc = true;
}

/// Called by the host at the end of a collection; releases the worker.
pub fn gc_finish_hook() {
    let Some(engine) = current_engine() else {
        return;
    };
    let mut state = engine.lock();
    state.in_gc = false;
    engine.gc_wakeup.notify_all();
}

/// Stop the worker, tear the engine down, and remove the PCH file
/// unless `save_temps`. Returns once the worker thread has exited.
pub fn finish() {
    let (engine, worker) = {
        let mut slot = slot();
        match slot.as_mut() {
            Some(handle) => (Arc::clone(&handle.engine), handle.worker.take()),
            None => return,
        }
    };

    // An external compiler process may still be writing temp files it
    // would complain about; never cancel the worker, ask it to stop.
    {
        let mut state = engine.lock();
        while state.pch_status == PchStatus::NotReady {
            tracing::trace!("finish waiting for PCH build to resolve");
            state = match engine.pch_ready.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        state.finish_worker = true;
        engine.worker_wakeup.notify_all();
    }

    if let Some(handle) = worker {
        let _ = handle.join();
    }
    debug_assert!(engine.lock().worker_finished);

    if !engine.opts.save_temps {
        let _ = std::fs::remove_file(&engine.pch_file);
    }

    ACTIVE.store(false, Ordering::Release);
    *slot() = None;
    tracing::info!("JIT engine finished");
}

/// Disable the engine in a forked child. The worker thread is not
/// inherited, so the child must not wait on it; in-flight compilation
/// belongs to the parent.
pub fn after_fork_child() {
    ACTIVE.store(false, Ordering::Release);
    let mut slot = slot();
    if let Some(mut handle) = slot.take() {
        // Dropping the handle detaches a thread that does not exist in
        // this process.
        handle.worker.take();
        tracing::debug!("JIT engine disabled in forked child");
    }
}
