//! Sequencing of a test run and the single-active-test invariant.

use crate::config::{resolver::ConfigResolver, Config};
use crate::engine::phase::PhaseRunner;
use crate::engine::Shared;
use crate::errors::SpeedTestError;
use crate::messaging::{Event, Messenger};
use crate::results::{IpResult, ResultRecord, Results};
use crate::status::{Status, Step};
use crate::transport::Transport;
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of a run: its results, or why it did not reach `done`.
pub type RunOutcome = Result<Results, SpeedTestError>;

/// Alert raised when the result could not be persisted.
pub const SAVE_ALERT: &str = "save";

/// A speed test engine.
///
/// Cloning is cheap; clones drive the same engine, so one task can run
/// [`start`](SpeedTest::start) while another calls
/// [`abort`](SpeedTest::abort).
#[derive(Clone)]
pub struct SpeedTest {
    shared: Arc<Shared>,
}

impl SpeedTest {
    /// Build an engine around a resolved configuration.
    ///
    /// Fails with a `Config` error if the configuration breaks an invariant
    /// the phases rely on. Otherwise the host is told the engine is
    /// `ready`, after which it waits for a `start`.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        messenger: Messenger,
    ) -> Result<Self, SpeedTestError> {
        config.validate()?;

        messenger.set_interval(Duration::from_millis(config.progress_interval));
        let shared = Shared::new(config, transport, messenger);
        let test = Self { shared: Arc::new(shared) };

        test.shared.notify();
        test.shared.state().status = Status::Waiting;
        Ok(test)
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn step(&self) -> Option<Step> {
        self.shared.state().step
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    pub fn config(&self) -> Arc<Config> {
        self.shared.state().config.clone()
    }

    pub fn results(&self) -> Results {
        self.shared.state().results.clone()
    }

    /// Snapshot of the engine, as pushed to the host.
    pub fn status_event(&self) -> Event {
        self.shared.event()
    }

    /// Number of channels currently open.
    pub fn open_channels(&self) -> usize {
        self.shared.registry.len()
    }

    /// Number of phase timers that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.pending()
    }

    /// Merge dotted-path overrides into the live configuration.
    ///
    /// Refused while a test is running.
    pub fn apply_overrides(
        &self,
        overrides: &Map<String, Value>,
    ) -> Result<Arc<Config>, SpeedTestError> {
        let mut state = self.shared.state();
        if state.running {
            return Err(SpeedTestError::already_running(state.status));
        }

        let config =
            ConfigResolver::apply_overrides(&state.config, overrides)?;
        let config = Arc::new(config);
        state.alerts = config.alerts();
        state.config = config.clone();
        drop(state);

        self.shared
            .messenger
            .set_interval(Duration::from_millis(config.progress_interval));
        debug!("Configuration updated with {} override(s)", overrides.len());
        Ok(config)
    }

    /// Run a complete test: IP, latency, download, then upload.
    ///
    /// Fails immediately, without touching the engine's state, when a
    /// test is already running.
    pub async fn start(&self) -> Result<Results, SpeedTestError> {
        let (config, run_token) = self.begin()?;
        self.execute(config, run_token).await
    }

    /// Start a test in the background.
    ///
    /// The engine is running as soon as this returns, so an `abort` issued
    /// right after is never lost.
    pub fn spawn(&self) -> Result<JoinHandle<RunOutcome>, SpeedTestError> {
        let (config, run_token) = self.begin()?;
        let test = self.clone();

        Ok(tokio::spawn(
            async move { test.execute(config, run_token).await },
        ))
    }

    fn begin(
        &self,
    ) -> Result<(Arc<Config>, CancellationToken), SpeedTestError> {
        let mut state = self.shared.state();
        if state.running {
            return Err(SpeedTestError::already_running(state.status));
        }

        state.running = true;
        state.status = Status::Running;
        state.step = None;
        state.results = Results::new();
        state.error = None;
        state.alerts = state.config.alerts();
        state.run_token = CancellationToken::new();

        Ok((state.config.clone(), state.run_token.clone()))
    }

    async fn execute(
        &self,
        config: Arc<Config>,
        run_token: CancellationToken,
    ) -> Result<Results, SpeedTestError> {
        info!("Starting speed test against {}", config.endpoint.http);
        self.shared.notify();

        let outcome = self.run_steps(&config, &run_token).await;

        let results = {
            let mut state = self.shared.state();
            match &outcome {
                Ok(()) if state.status != Status::Aborted => {
                    state.status = Status::Done
                }
                Ok(()) => {}
                Err(e) => {
                    if state.status != Status::Aborted {
                        state.status = e.status();
                    }
                    state.error = Some(e.message.clone());
                }
            }
            state.running = false;
            state.step = None;
            state.results.clone()
        };
        self.shared.registry.close_all();
        self.shared.timers.clear();
        self.shared.notify();

        let status = self.status();
        info!("Speed test finished: {}", status);
        match outcome {
            Ok(()) if status == Status::Done => Ok(results),
            Ok(()) => Err(SpeedTestError::aborted()),
            Err(e) => Err(e),
        }
    }

    /// Abort the running test, if any.
    ///
    /// Idempotent. In-flight streams observe the abort at their next event
    /// and the pending `start` resolves with an `Aborted` error.
    pub fn abort(&self) {
        let run_token = {
            let mut state = self.shared.state();
            if state.running {
                state.status = Status::Aborted;
            }
            state.run_token.clone()
        };

        let timers = self.shared.timers.clear();
        let channels = self.shared.registry.close_all();
        run_token.cancel();
        debug!(
            "Abort cleared {} timer(s) and closed {} channel(s)",
            timers, channels
        );
    }

    async fn run_steps(
        &self,
        config: &Arc<Config>,
        run_token: &CancellationToken,
    ) -> Result<(), SpeedTestError> {
        for step in Step::SEQUENCE {
            if self.status() == Status::Aborted {
                return Err(SpeedTestError::aborted());
            }
            self.shared.state().step = Some(step);
            self.shared.notify();

            match step {
                Step::Ip => self.run_ip(config, run_token).await?,
                _ => {
                    let phase = PhaseRunner::new(
                        self.shared.clone(),
                        step,
                        config.clone(),
                        run_token,
                    )?;
                    phase.run().await?
                }
            }
        }

        if config.result.enabled {
            self.store_result(config, run_token).await?;
        }

        Ok(())
    }

    async fn run_ip(
        &self,
        config: &Config,
        run_token: &CancellationToken,
    ) -> Result<(), SpeedTestError> {
        let lookup = self.shared.transport.lookup_ip(config);
        let info = cancellable(run_token, lookup)
            .await?
            .map_err(SpeedTestError::from)?;

        info!("Client address: {}", info.ip);
        self.shared.state().results.ip = Some(IpResult::from(&info));
        Ok(())
    }

    /// Persist the results. A failure is reported as an alert only.
    async fn store_result(
        &self,
        config: &Config,
        run_token: &CancellationToken,
    ) -> Result<(), SpeedTestError> {
        let record = ResultRecord::new(&self.results(), Utc::now());

        let store = self.shared.transport.store_result(config, &record);
        match cancellable(run_token, store).await? {
            Ok(id) => {
                info!("Result stored as {}", id);
                self.shared.state().results.id = Some(id);
            }
            Err(e) => {
                warn!("Could not store the result: {}", e);
                self.shared.state().alerts.insert(
                    SAVE_ALERT.to_string(),
                    format!("The result could not be saved: {}", e),
                );
            }
        }

        Ok(())
    }
}

/// Run `future` unless the run is aborted first.
async fn cancellable<F: Future>(
    run_token: &CancellationToken,
    future: F,
) -> Result<F::Output, SpeedTestError> {
    tokio::select! {
        _ = run_token.cancelled() => Err(SpeedTestError::aborted()),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBehavior, MockTransport};
    use crate::errors::ErrorKind;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::sleep;

    /// A short but complete configuration.
    fn quick_config() -> Config {
        let mut config = Config::default();
        config.latency.mode = crate::config::Mode::Http;
        config.latency.duration = 1000;
        config.latency.gracetime = 0;
        for phase in [&mut config.download, &mut config.upload] {
            phase.streams = 2;
            phase.stream_delay = 0;
            phase.delay = 0;
            phase.gracetime = 500;
            phase.duration = 1500;
            phase.size = 4 * 131_072;
            phase.overhead_compensation = 1.0;
        }
        config
    }

    fn engine(
        config: Config,
        transport: MockTransport,
    ) -> (SpeedTest, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        let messenger = Messenger::new(tx, Duration::ZERO);
        let test =
            SpeedTest::new(config, Arc::new(transport), messenger).unwrap();
        (test, rx)
    }

    fn default_engine() -> (SpeedTest, UnboundedReceiver<Event>) {
        engine(quick_config(), MockTransport::new(MockBehavior::default()))
    }

    fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run() {
        let transport = MockTransport::new(MockBehavior::default());
        let saved = transport.saved();
        let (test, mut rx) = engine(quick_config(), transport);
        assert_eq!(test.status(), Status::Waiting);

        let results = test.start().await.unwrap();

        assert_eq!(test.status(), Status::Done);
        assert_eq!(test.step(), None);
        assert!(!test.is_running());
        assert_eq!(results.ip.as_ref().unwrap().address, "203.0.113.7");
        assert_eq!(results.latency.as_ref().unwrap().avg, Some(50.0));
        assert!(results.download.as_ref().unwrap().speed.unwrap() > 0.0);
        assert!(results.upload.as_ref().unwrap().speed.unwrap() > 0.0);
        assert_eq!(results.id.as_deref(), Some("result-1"));

        let saved = saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].ip_info.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(saved[0].latency.avg, Some(50.0));

        let events = drain(&mut rx);
        assert_eq!(events.first().map(|e| e.status), Some(Status::Ready));
        assert_eq!(events.last().map(|e| e.status), Some(Status::Done));
        let steps: Vec<_> = events.iter().filter_map(|e| e.step).collect();
        for step in Step::SEQUENCE {
            assert!(steps.contains(&step), "no event for {}", step);
        }
        assert!(test.open_channels() == 0 && test.pending_timers() == 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_rejected() {
        let (test, _rx) = default_engine();

        let running = tokio::spawn({
            let test = test.clone();
            async move { test.start().await }
        });
        sleep(Duration::from_millis(1200)).await;

        let before = test.status_event();
        assert_eq!(before.step, Some(Step::Download));

        let error = test.start().await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::AlreadyRunning(Status::Running));
        assert_eq!(error.status(), Status::Running);

        let after = test.status_event();
        assert_eq!(after.status, before.status);
        assert_eq!(after.step, before.step);
        assert_eq!(after.results, before.results);
        assert!(test.is_running());

        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_download() {
        let mut config = quick_config();
        config.download.duration = 10_000;
        let (test, mut rx) =
            engine(config, MockTransport::new(MockBehavior::default()));

        let running = tokio::spawn({
            let test = test.clone();
            async move { test.start().await }
        });
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(test.step(), Some(Step::Download));
        assert_eq!(test.open_channels(), 2);
        assert_eq!(test.pending_timers(), 1);

        test.abort();
        assert_eq!(test.status(), Status::Aborted);
        assert_eq!(test.open_channels(), 0);
        assert_eq!(test.pending_timers(), 0);

        let error = running.await.unwrap().unwrap_err();
        assert_eq!(error.kind, ErrorKind::Aborted);
        assert_eq!(test.status(), Status::Aborted);
        assert_eq!(test.step(), None);
        assert!(!test.is_running());
        assert_eq!(test.open_channels(), 0);

        // Latency results survive the abort.
        assert_eq!(test.results().latency.unwrap().status, Status::Done);
        assert_eq!(test.results().download.unwrap().status, Status::Aborted);
        let last = drain(&mut rx).last().map(|e| e.status);
        assert_eq!(last, Some(Status::Aborted));

        test.abort();
        assert_eq!(test.status(), Status::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_abort() {
        let (test, _rx) = default_engine();

        let running = tokio::spawn({
            let test = test.clone();
            async move { test.start().await }
        });
        sleep(Duration::from_millis(300)).await;
        test.abort();
        assert!(running.await.unwrap().is_err());

        assert!(test.start().await.is_ok());
        assert_eq!(test.status(), Status::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_when_idle_is_noop() {
        let (test, _rx) = default_engine();

        test.abort();
        assert_eq!(test.status(), Status::Waiting);
        assert!(test.start().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_failure_fails_run() {
        let (test, _rx) = engine(
            quick_config(),
            MockTransport::new(MockBehavior::default().with_ip_failure()),
        );

        let error = test.start().await.unwrap_err();

        assert_eq!(error.kind, ErrorKind::Transport);
        assert_eq!(test.status(), Status::Failed);
        assert!(test.status_event().error.is_some());
        assert!(test.results().latency.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stream_error_fails_run() {
        let mut config = quick_config();
        config.latency.ignore_errors = false;
        let (test, _rx) =
            engine(config, MockTransport::new(MockBehavior::failing()));

        let error = test.start().await.unwrap_err();

        assert_eq!(error.status(), Status::Failed);
        assert_eq!(test.status(), Status::Failed);
        assert_eq!(test.results().latency.unwrap().status, Status::Failed);
        assert!(test.results().download.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_failure_is_an_alert() {
        let (test, _rx) = engine(
            quick_config(),
            MockTransport::new(MockBehavior::default().with_save_failure()),
        );

        let results = test.start().await.unwrap();

        assert_eq!(test.status(), Status::Done);
        assert_eq!(results.id, None);
        assert!(test.status_event().alerts.contains_key(SAVE_ALERT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_persistence_can_be_disabled() {
        let mut config = quick_config();
        config.result.enabled = false;
        let transport = MockTransport::new(MockBehavior::default());
        let saved = transport.saved();
        let (test, _rx) = engine(config, transport);

        let results = test.start().await.unwrap();

        assert_eq!(results.id, None);
        assert!(saved.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrides_refused_while_running() {
        let (test, _rx) = default_engine();
        let mut overrides = Map::new();
        overrides.insert("download.streams".to_string(), serde_json::json!(1));

        let running = tokio::spawn({
            let test = test.clone();
            async move { test.start().await }
        });
        sleep(Duration::from_millis(100)).await;
        assert!(test.apply_overrides(&overrides).is_err());
        running.await.unwrap().unwrap();

        let config = test.apply_overrides(&overrides).unwrap();
        assert_eq!(config.download.streams, 1);
        assert_eq!(test.config().download.streams, 1);
    }

    #[test]
    fn test_https_endpoint_raises_alert() {
        let mut config = quick_config();
        config.endpoint.http = "https://speed.example.com".to_string();
        let test = SpeedTest::new(
            config,
            Arc::new(MockTransport::new(MockBehavior::default())),
            Messenger::detached(),
        )
        .unwrap();

        assert!(test.status_event().alerts.contains_key("https"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = quick_config();
        config.download.duration = 0;
        let (tx, mut rx) = unbounded_channel();

        let error = SpeedTest::new(
            config,
            Arc::new(MockTransport::new(MockBehavior::default())),
            Messenger::new(tx, Duration::ZERO),
        )
        .err()
        .unwrap();

        assert_eq!(error.kind, ErrorKind::Config);
        assert!(error.message.contains("download.duration"));
        assert!(rx.try_recv().is_err());
    }
}
