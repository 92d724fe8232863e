//! Engine configuration.
//!
//! The configuration is a nested record with one section per phase. It is
//! serialized as camelCase JSON, which is the shape the server advertises
//! in `config.json` and the shape dotted overrides address
//! (`"download.duration"`).

pub mod resolver;

use crate::errors::SpeedTestError;
use crate::retry::RetryConfig;
use crate::status::Step;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

pub use resolver::{deep_merge, expand_dotted, parse_override, ConfigResolver};

/// Overhead of TCP + IPv4 + Ethernet headers on a 1500 byte MTU.
pub const OVERHEAD_TCP_IPV4_ETH: f64 = 1500.0 / (1500.0 - 20.0 - 20.0 - 14.0);

/// Overhead of TCP + IPv6 + Ethernet headers on a 1500 byte MTU.
pub const OVERHEAD_TCP_IPV6_ETH: f64 = 1500.0 / (1500.0 - 40.0 - 20.0 - 14.0);

/// Alert raised when the endpoints are reached over TLS.
pub const HTTPS_ALERT: &str =
    "Speed test endpoint is accessed through a secured connection, results may be impacted.";

const DEFAULT_SERVER: &str = "http://localhost:8080";

/// Transport strategy used by the channels of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// One HTTP request per transfer
    #[serde(rename = "http", alias = "xhr")]
    Http,
    /// One persistent WebSocket per stream
    #[serde(rename = "websocket")]
    WebSocket,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Http => f.write_str("http"),
            Mode::WebSocket => f.write_str("websocket"),
        }
    }
}

/// Base URIs of the speed test server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Base URI for HTTP transfers, e.g. `http://host:8080`
    pub http: String,
    /// Base URI for WebSocket transfers; derived from `http` when absent
    pub websocket: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { http: DEFAULT_SERVER.to_string(), websocket: None }
    }
}

impl EndpointConfig {
    pub fn http_base(&self) -> Result<Url, SpeedTestError> {
        Url::parse(&self.http).map_err(|e| {
            SpeedTestError::config(format!(
                "invalid endpoint.http {:?}: {}",
                self.http, e
            ))
        })
    }

    pub fn websocket_base(&self) -> Result<Url, SpeedTestError> {
        match &self.websocket {
            Some(uri) => Url::parse(uri).map_err(|e| {
                SpeedTestError::config(format!(
                    "invalid endpoint.websocket {:?}: {}",
                    uri, e
                ))
            }),
            None => {
                let http = self.http_base()?;
                let scheme =
                    if http.scheme() == "https" { "wss" } else { "ws" };
                let mut ws = http.clone();
                ws.set_scheme(scheme).map_err(|_| {
                    SpeedTestError::config(format!(
                        "cannot derive a websocket endpoint from {}",
                        http
                    ))
                })?;
                Ok(ws)
            }
        }
    }
}

/// Settings of the IP discovery phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpConfig {
    pub path: String,
}

impl Default for IpConfig {
    fn default() -> Self {
        Self { path: "ip".to_string() }
    }
}

/// Settings of one measurement phase. Times are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PhaseConfig {
    /// Transport strategy
    pub mode: Mode,
    /// Path of the transfer endpoint, relative to the mode's base URI
    pub path: String,
    /// Number of concurrent streams
    pub streams: usize,
    /// Start offset between consecutive streams
    pub stream_delay: u64,
    /// Time before the phase timer starts
    pub delay: u64,
    /// Time after `delay` during which samples are not measured
    pub gracetime: u64,
    /// Time after `delay` at which the phase ends
    pub duration: u64,
    /// Payload size per transfer, in bytes
    pub size: u64,
    /// Multiplier from payload rate to wire rate
    pub overhead_compensation: f64,
    /// Restart failed transfers instead of failing the phase
    pub ignore_errors: bool,
    /// Latency only: stop after this many samples
    pub count: Option<usize>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Http,
            path: String::new(),
            streams: 1,
            stream_delay: 0,
            delay: 0,
            gracetime: 0,
            duration: 10_000,
            size: 0,
            overhead_compensation: OVERHEAD_TCP_IPV4_ETH,
            ignore_errors: true,
            count: None,
        }
    }
}

impl PhaseConfig {
    pub fn latency() -> Self {
        Self {
            mode: Mode::WebSocket,
            path: "ping".to_string(),
            duration: 5_000,
            gracetime: 1_000,
            ..Self::default()
        }
    }

    pub fn download() -> Self {
        Self {
            path: "download".to_string(),
            streams: 6,
            stream_delay: 150,
            delay: 2_000,
            gracetime: 2_000,
            size: 20 * 1024 * 1024,
            ..Self::default()
        }
    }

    pub fn upload() -> Self {
        Self {
            path: "upload".to_string(),
            streams: 6,
            stream_delay: 150,
            delay: 2_000,
            gracetime: 2_000,
            size: 1024 * 1024,
            ..Self::default()
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay)
    }

    pub fn gracetime(&self) -> Duration {
        Duration::from_millis(self.gracetime)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration)
    }

    pub fn stream_delay(&self) -> Duration {
        Duration::from_millis(self.stream_delay)
    }

    fn validate(&self, step: Step) -> Result<(), SpeedTestError> {
        if self.streams == 0 {
            return Err(SpeedTestError::config(format!(
                "{}.streams must be at least 1",
                step
            )));
        }
        if self.duration == 0 {
            return Err(SpeedTestError::config(format!(
                "{}.duration must be greater than 0",
                step
            )));
        }
        if !(self.overhead_compensation > 0.0
            && self.overhead_compensation.is_finite())
        {
            return Err(SpeedTestError::config(format!(
                "{}.overheadCompensation must be a positive number",
                step
            )));
        }
        if step != Step::Latency && self.size == 0 {
            return Err(SpeedTestError::config(format!(
                "{}.size must be greater than 0",
                step
            )));
        }
        Ok(())
    }
}

/// Settings of result persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResultConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self { enabled: true, path: "save".to_string() }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub ip: IpConfig,
    pub latency: PhaseConfig,
    pub download: PhaseConfig,
    pub upload: PhaseConfig,
    pub result: ResultConfig,
    /// Restart pacing for streams and retries of the config fetch
    pub retry: RetryConfig,
    /// Minimum time between live progress pushes, in ms (0: every sample)
    pub progress_interval: u64,
    /// Per-request transport timeout, in ms
    pub timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            ip: IpConfig::default(),
            latency: PhaseConfig::latency(),
            download: PhaseConfig::download(),
            upload: PhaseConfig::upload(),
            result: ResultConfig::default(),
            retry: RetryConfig::default(),
            progress_interval: 100,
            timeout: 30_000,
        }
    }
}

impl Config {
    /// Defaults pointed at the given server.
    pub fn for_server(server: &Url) -> Self {
        let mut config = Config::default();
        config.endpoint.http =
            server.as_str().trim_end_matches('/').to_string();
        config
    }

    /// Settings of a measurement phase; `None` for the IP phase.
    pub fn phase(&self, step: Step) -> Option<&PhaseConfig> {
        match step {
            Step::Ip => None,
            Step::Latency => Some(&self.latency),
            Step::Download => Some(&self.download),
            Step::Upload => Some(&self.upload),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), SpeedTestError> {
        self.endpoint.http_base()?;
        self.endpoint.websocket_base()?;

        for step in [Step::Latency, Step::Download, Step::Upload] {
            if let Some(phase) = self.phase(step) {
                phase.validate(step)?;
            }
        }

        Ok(())
    }

    /// Alerts the host should show alongside results.
    pub fn alerts(&self) -> BTreeMap<String, String> {
        let mut alerts = BTreeMap::new();

        let http_tls = self
            .endpoint
            .http_base()
            .map(|url| url.scheme() == "https")
            .unwrap_or(false);
        let ws_tls = self
            .endpoint
            .websocket_base()
            .map(|url| url.scheme() == "wss")
            .unwrap_or(false);

        if http_tls || ws_tls {
            alerts.insert("https".to_string(), HTTPS_ALERT.to_string());
        }

        alerts
    }
}
