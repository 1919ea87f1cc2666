//! Compilation units.

use crate::iseq::Iseq;
use libloading::Library;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex, Weak};

/// One pending, in-flight, or completed compilation, tied to exactly one
/// iseq. A unit sits in the queue or is held by the worker, never both,
/// and once compiled it owns the loaded shared object for as long as the
/// engine retains it.
#[derive(Debug)]
pub struct Unit {
    id: u64,
    /// Weak back-reference to the iseq. Tombstoned (replaced with an
    /// empty weak) by `free_iseq`, only while the engine mutex is held.
    iseq: Mutex<Weak<Iseq>>,
    /// Handle of the loaded shared object. Set exactly once, by the
    /// worker, before the function pointer is published.
    handle: OnceCell<Library>,
}

impl Unit {
    pub(crate) fn new(id: u64, iseq: &Arc<Iseq>) -> Arc<Unit> {
        Arc::new(Unit {
            id,
            iseq: Mutex::new(Arc::downgrade(iseq)),
            handle: OnceCell::new(),
        })
    }

    /// Unique order number; forms the generated file and function names.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The owning iseq, unless it was collected or tombstoned.
    pub(crate) fn iseq(&self) -> Option<Arc<Iseq>> {
        match self.iseq.lock() {
            Ok(weak) => weak.upgrade(),
            Err(poisoned) => poisoned.into_inner().upgrade(),
        }
    }

    /// True once the iseq is gone; the queue drops such units at the
    /// next scan.
    pub(crate) fn is_tombstoned(&self) -> bool {
        self.iseq().is_none()
    }

    /// Drop the back-reference. Caller must hold the engine mutex.
    pub(crate) fn tombstone(&self) {
        match self.iseq.lock() {
            Ok(mut weak) => *weak = Weak::new(),
            Err(poisoned) => *poisoned.into_inner() = Weak::new(),
        }
    }

    /// Store the loaded object handle. Ignored if already set; the
    /// worker is the only writer so this sets at most once.
    pub(crate) fn set_handle(&self, lib: Library) {
        let _ = self.handle.set(lib);
    }

    /// The loaded shared object, if this unit compiled successfully.
    pub(crate) fn library(&self) -> Option<&Library> {
        self.handle.get()
    }
}
