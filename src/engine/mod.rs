//! The measurement engine.
//!
//! [`SpeedTest`] runs the four steps of a test in sequence; each
//! measurement step is driven by a [`PhaseRunner`](phase::PhaseRunner).
//! Both share one [`Shared`] record per engine: the injected transport,
//! the channel registry, the pending timers, the host messenger and the
//! test state.

pub mod orchestrator;
pub mod phase;
pub mod timers;

#[cfg(test)]
pub(crate) mod mock;

pub use orchestrator::SpeedTest;
pub use timers::TimerSet;

use crate::config::Config;
use crate::messaging::{Event, Messenger};
use crate::results::{BandwidthResult, LatencyResult, Results};
use crate::status::{Status, Step};
use crate::transport::{ChannelRegistry, Transport};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// State of the engine; reset by every `start`.
#[derive(Debug)]
pub(crate) struct TestState {
    pub status: Status,
    pub step: Option<Step>,
    pub running: bool,
    pub config: Arc<Config>,
    pub results: Results,
    pub alerts: BTreeMap<String, String>,
    pub error: Option<String>,
    /// Cancelled by abort; parent of every phase token of the run
    pub run_token: CancellationToken,
}

/// Result of one measurement step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PhaseResult {
    Latency(LatencyResult),
    Bandwidth(BandwidthResult),
}

pub(crate) struct Shared {
    pub transport: Arc<dyn Transport>,
    pub registry: ChannelRegistry,
    pub timers: TimerSet,
    pub messenger: Messenger,
    state: Mutex<TestState>,
}

impl Shared {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        messenger: Messenger,
    ) -> Self {
        let alerts = config.alerts();

        Self {
            transport,
            registry: ChannelRegistry::new(),
            timers: TimerSet::new(),
            messenger,
            state: Mutex::new(TestState {
                status: Status::Ready,
                step: None,
                running: false,
                config: Arc::new(config),
                results: Results::new(),
                alerts,
                error: None,
                run_token: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, TestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    pub fn event(&self) -> Event {
        let state = self.state();

        Event {
            status: state.status,
            step: state.step,
            config: state.config.clone(),
            results: state.results.clone(),
            alerts: state.alerts.clone(),
            error: state.error.clone(),
        }
    }

    /// Push the current state to the host.
    pub fn notify(&self) {
        self.messenger.post(self.event());
    }

    /// Store the latest result of `step` and push it, throttled.
    pub fn publish(&self, step: Step, result: PhaseResult) {
        {
            let mut state = self.state();
            match (step, result) {
                (Step::Latency, PhaseResult::Latency(result)) => {
                    state.results.latency = Some(result)
                }
                (Step::Download, PhaseResult::Bandwidth(result)) => {
                    state.results.download = Some(result)
                }
                (Step::Upload, PhaseResult::Bandwidth(result)) => {
                    state.results.upload = Some(result)
                }
                _ => return,
            }
        }

        self.messenger.progress(|| self.event());
    }
}
