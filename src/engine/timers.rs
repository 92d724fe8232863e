//! Scheduled phase transitions.

use crate::config::PhaseConfig;
use crate::status::Status;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Transitions of a phase, as offsets from phase entry, in firing order.
///
/// * `delay`: `Starting`, the progress baseline
/// * `delay + gracetime`: `Running`, the measurement baseline
/// * `delay + duration`: `Done`
///
/// A grace period at least as long as the duration never reaches
/// `Running`.
pub fn schedule(phase: &PhaseConfig) -> Vec<(Duration, Status)> {
    let delay = phase.delay();
    let mut transitions = vec![(delay, Status::Starting)];

    if phase.gracetime < phase.duration {
        transitions.push((delay + phase.gracetime(), Status::Running));
    }
    transitions.push((delay + phase.duration(), Status::Done));

    transitions
}

/// Timers pending for the current run. Clearing aborts them.
#[derive(Debug, Clone, Default)]
pub struct TimerSet {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn<F>(&self, timer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(timer);
        let mut handles = self.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of timers that have not fired all their transitions yet.
    pub fn pending(&self) -> usize {
        self.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Abort every pending timer. Returns how many were still pending.
    pub fn clear(&self) -> usize {
        let handles: Vec<_> = self.lock().drain(..).collect();
        let mut pending = 0;
        for handle in handles {
            if !handle.is_finished() {
                pending += 1;
            }
            handle.abort();
        }
        pending
    }
}
