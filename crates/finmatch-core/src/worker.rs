//! Background driver for a [`MatchPipeline`].
//!
//! [`drive`] calls the pipeline once per candidate, checking the
//! [`RunControl`] flags before each call. Pausing sleeps in short
//! intervals and rechecks, so a cancel issued while paused is still seen
//! promptly. Cancellation takes effect between candidates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::pipeline::{CategoryFilter, MatchPipeline};
use crate::types::EngineError;

/// How long a paused worker sleeps before looking at the flags again.
pub const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Cancel and pause flags shared between the worker and its owner.
#[derive(Debug, Default)]
pub struct RunControl {
    cancel: AtomicBool,
    pause: AtomicBool,
}

impl RunControl {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cancel: AtomicBool::new(false),
            pause: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

/// Drive `pipeline` to completion, reporting progress after every
/// candidate.
///
/// # Errors
///
/// Returns [`EngineError::Cancelled`] when `control` is cancelled
/// (the pipeline is cancelled too), or the pipeline's own error.
pub fn drive<F>(
    pipeline: &MatchPipeline,
    filter: &CategoryFilter,
    control: &RunControl,
    mut on_progress: F,
) -> Result<(), EngineError>
where
    F: FnMut(f64),
{
    loop {
        while control.is_paused() && !control.is_cancelled() {
            thread::sleep(PAUSE_POLL);
        }
        if control.is_cancelled() {
            pipeline.cancel();
            return Err(EngineError::Cancelled);
        }
        let progress = pipeline.match_single_individual(filter)?;
        debug!(progress, "candidate processed");
        on_progress(progress);
        if progress >= 1.0 {
            info!("worker finished");
            return Ok(());
        }
    }
}
