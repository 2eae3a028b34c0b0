pub mod inspect;
pub mod job;
pub mod pipeline;
pub mod plan;
pub mod progress;
pub mod retention;
pub mod runner;

pub use crate::sys::zfs::Snapshot;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared flag a caller sets from any thread to stop a running job.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
