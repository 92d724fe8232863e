//! One measurement phase: latency, download or upload.
//!
//! A phase runs `streams` concurrent stream tasks against a three-stage
//! timer. Stream `i` starts `i * streamDelay` after phase entry and loops
//! transfers over its channel until the phase is done or the test is
//! aborted. The phase resolves once every stream task has settled.

use crate::config::{Config, PhaseConfig};
use crate::engine::timers::schedule;
use crate::engine::{PhaseResult, Shared};
use crate::errors::SpeedTestError;
use crate::results::{BandwidthResult, LatencyResult};
use crate::retry::Backoff;
use crate::stats::{compute_bandwidth, round2, LatencySummary};
use crate::status::{Status, Step};
use crate::transport::{ChannelEvent, Transfer, TransferChannel, TransferError};
use bytes::Bytes;
use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// How long a stream waits for its channel to close before dropping it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct PhaseState {
    status: Status,
    /// End of `delay`; the progress baseline
    init: Option<Instant>,
    /// End of the grace period; the measurement baseline
    start: Option<Instant>,
    /// When the phase reached a terminal status
    end: Option<Instant>,
    /// Bytes moved while running
    bytes: u64,
    latencies: LatencySummary,
}

pub struct PhaseRunner {
    step: Step,
    config: Arc<Config>,
    settings: PhaseConfig,
    shared: Arc<Shared>,
    /// Child of the run token; cancelled at `Done` or on a fatal error
    token: CancellationToken,
    state: Mutex<PhaseState>,
    next_index: AtomicU64,
    /// Upload body shared by every stream
    payload: Bytes,
}

impl PhaseRunner {
    pub(crate) fn new(
        shared: Arc<Shared>,
        step: Step,
        config: Arc<Config>,
        run_token: &CancellationToken,
    ) -> Result<Arc<Self>, SpeedTestError> {
        let settings = config.phase(step).cloned().ok_or_else(|| {
            SpeedTestError::config(format!(
                "{} is not a measurement phase",
                step
            ))
        })?;

        let payload = if step == Step::Upload {
            random_payload(settings.size)
        } else {
            Bytes::new()
        };

        Ok(Arc::new(Self {
            step,
            config,
            settings,
            shared,
            token: run_token.child_token(),
            state: Mutex::new(PhaseState {
                status: Status::Waiting,
                init: None,
                start: None,
                end: None,
                bytes: 0,
                latencies: LatencySummary::new(),
            }),
            next_index: AtomicU64::new(0),
            payload,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Run the phase to completion.
    pub async fn run(self: Arc<Self>) -> Result<(), SpeedTestError> {
        info!(
            "Starting {} phase: {} stream(s) over {}, {}ms",
            self.step,
            self.settings.streams,
            self.settings.mode,
            self.settings.duration
        );
        self.process_result();

        let entered = Instant::now();
        let timer = self.clone();
        self.shared.timers.spawn(async move {
            for (offset, status) in schedule(&timer.settings) {
                tokio::select! {
                    _ = timer.token.cancelled() => return,
                    _ = sleep_until(entered + offset) => {
                        timer.transition(status)
                    }
                }
            }
        });

        let streams: Vec<_> = (0..self.settings.streams)
            .map(|index| tokio::spawn(self.clone().run_stream(index)))
            .collect();
        let outcomes = join_all(streams).await;
        self.token.cancel();

        let mut failure = None;
        for outcome in outcomes {
            let outcome = outcome.unwrap_or_else(|e| {
                Err(SpeedTestError::transport(format!(
                    "stream task failed: {}",
                    e
                )))
            });
            if let Err(e) = outcome {
                failure.get_or_insert(e);
            }
        }
        if self.aborted() {
            failure = Some(SpeedTestError::aborted());
        }

        match failure {
            Some(e) => {
                warn!(
                    "{} phase ended with {}: {}",
                    self.step,
                    e.status(),
                    e.message
                );
                self.fail(e.status());
                self.process_result();
                Err(e)
            }
            None => {
                self.finish();
                self.process_result();
                info!("{} phase done", self.step);
                Ok(())
            }
        }
    }

    fn aborted(&self) -> bool {
        self.shared.status() == Status::Aborted
    }

    /// Whether streams must stop issuing work.
    fn settled(&self) -> bool {
        self.aborted() || self.token.is_cancelled()
    }

    /// The outcome of a stream that must stop, if it must.
    fn check(&self) -> Option<Result<(), SpeedTestError>> {
        if self.aborted() {
            return Some(Err(SpeedTestError::aborted()));
        }
        if self.token.is_cancelled() {
            return Some(Ok(()));
        }
        None
    }

    fn transition(&self, status: Status) {
        if status == Status::Done {
            self.finish();
            return;
        }

        {
            let mut state = self.lock();
            if state.status.is_terminal() || state.status.is_at_least(status) {
                return;
            }
            let now = Instant::now();
            match status {
                Status::Starting => state.init = Some(now),
                Status::Running => state.start = Some(now),
                _ => {}
            }
            state.status = status;
        }

        debug!("{} phase is {}", self.step, status);
        self.process_result();
    }

    /// Mark the phase done and release every stream.
    fn finish(&self) {
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return;
            }
            let now = Instant::now();
            state.init.get_or_insert(now);
            state.end = Some(now);
            state.status = Status::Done;
        }

        self.token.cancel();
        self.process_result();
    }

    fn fail(&self, status: Status) {
        {
            let mut state = self.lock();
            if !state.status.is_terminal() {
                state.status = status;
                state.end.get_or_insert_with(Instant::now);
            }
        }

        self.token.cancel();
    }

    async fn run_stream(
        self: Arc<Self>,
        index: usize,
    ) -> Result<(), SpeedTestError> {
        // Nothing moves before `delay`; streams are staggered after it.
        let stagger =
            self.settings.delay() + self.settings.stream_delay() * index as u32;
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = sleep(stagger) => {}
        }

        let mut backoff = Backoff::new(self.config.retry.clone());
        loop {
            if let Some(outcome) = self.check() {
                return outcome;
            }

            let error = match self.run_channel(&mut backoff).await {
                Ok(()) => continue,
                Err(e) => e,
            };

            if let Some(outcome) = self.check() {
                return outcome;
            }
            if !self.settings.ignore_errors {
                error!("{} stream {} failed: {}", self.step, index, error);
                self.fail(Status::Failed);
                return Err(error.into());
            }

            let delay = backoff.next_delay();
            warn!(
                "{} stream {} failed: {}, restarting in {:?}",
                self.step, index, error, delay
            );
            tokio::select! {
                _ = self.token.cancelled() => {}
                _ = sleep(delay) => {}
            }
        }
    }

    /// Open one channel and loop transfers over it until the phase settles
    /// or the channel fails.
    async fn run_channel(
        &self,
        backoff: &mut Backoff,
    ) -> Result<(), TransferError> {
        let guard = self.shared.registry.register(self.step, &self.token);
        let mut channel =
            self.shared.transport.channel(self.step, &self.config)?;

        let result = tokio::select! {
            _ = guard.token().cancelled() => Ok(()),
            result = self.drive(channel.as_mut(), backoff) => result,
        };

        if timeout(CLOSE_TIMEOUT, channel.close()).await.is_err() {
            debug!("{} channel did not close in time", self.step);
        }
        drop(guard);

        result
    }

    async fn drive(
        &self,
        channel: &mut dyn TransferChannel,
        backoff: &mut Backoff,
    ) -> Result<(), TransferError> {
        channel.open().await?;

        loop {
            if self.settled() {
                return Ok(());
            }
            channel.send(self.next_transfer()).await?;

            loop {
                let event = channel.next_event().await?;
                if self.settled() {
                    return Ok(());
                }

                match event {
                    ChannelEvent::Progress { bytes } => self.on_bytes(bytes),
                    ChannelEvent::Pong { rtt, .. } => {
                        self.on_latency(rtt);
                        break;
                    }
                    ChannelEvent::Complete => break,
                }
            }

            backoff.reset();
        }
    }

    fn next_transfer(&self) -> Transfer {
        match self.step {
            Step::Latency => Transfer::Ping {
                index: self.next_index.fetch_add(1, Ordering::Relaxed),
            },
            Step::Upload => Transfer::Upload { payload: self.payload.clone() },
            _ => Transfer::Download { size: self.settings.size },
        }
    }

    fn on_bytes(&self, bytes: u64) {
        {
            let mut state = self.lock();
            if state.status == Status::Running {
                state.bytes += bytes;
            }
        }

        self.process_result();
    }

    fn on_latency(&self, rtt: Duration) {
        let reached_count = {
            let mut state = self.lock();
            if state.status == Status::Running {
                state.latencies.push(rtt.as_micros() as f64 / 1000.0);
                self.settings
                    .count
                    .is_some_and(|count| state.latencies.count() >= count)
            } else {
                false
            }
        };

        self.process_result();
        if reached_count {
            info!("{} phase reached its sample count", self.step);
            self.finish();
        }
    }

    /// Recompute the published result of this phase.
    fn process_result(&self) {
        let result = {
            let state = self.lock();
            let until = state.end.unwrap_or_else(Instant::now);
            let progress = match state.init {
                Some(init) => {
                    until.saturating_duration_since(init).as_secs_f64()
                        / self.settings.duration().as_secs_f64()
                }
                None => 0.0,
            };
            let measured = state.start.is_some();

            match self.step {
                Step::Latency => {
                    let mut result = LatencyResult::new(state.status);
                    result.progress = progress;
                    if measured {
                        result.min = state.latencies.min().map(round2);
                        result.max = state.latencies.max().map(round2);
                        result.avg = state.latencies.avg().map(round2);
                        result.jitter = round2(state.latencies.jitter());
                    }
                    PhaseResult::Latency(result)
                }
                _ => {
                    let mut result = BandwidthResult::new(state.status);
                    result.progress = progress;
                    result.speed = state.start.and_then(|start| {
                        let elapsed = until.saturating_duration_since(start);
                        compute_bandwidth(
                            state.bytes,
                            elapsed.as_secs_f64(),
                            self.settings.overhead_compensation,
                        )
                        .map(|bandwidth| round2(bandwidth.bit_rate))
                    });
                    PhaseResult::Bandwidth(result)
                }
            }
        };

        self.shared.publish(self.step, result);
    }
}

fn random_payload(size: u64) -> Bytes {
    let mut payload = vec![0u8; size as usize];
    rand::thread_rng().fill_bytes(&mut payload);
    Bytes::from(payload)
}
