//! Transfer channels: the units of data movement a phase runs concurrently.
//!
//! A [`TransferChannel`] moves data for one stream. Two implementations
//! exist: [`RequestChannel`] issues one HTTP request per transfer and
//! [`DuplexChannel`] keeps a WebSocket open for the lifetime of the
//! stream. The [`Transport`] picks one per stream from the phase's
//! [`Mode`](crate::config::Mode).

pub mod duplex;
pub mod registry;
pub mod request;

pub use duplex::DuplexChannel;
pub use registry::{ChannelGuard, ChannelRegistry};
pub use request::RequestChannel;

use crate::api::requests::{IpInfo, IpRequest, SaveResult};
use crate::api::Client;
use crate::config::{Config, Mode};
use crate::errors::SpeedTestError;
use crate::results::ResultRecord;
use crate::status::Step;
use async_trait::async_trait;
use bytes::Bytes;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// Failure of a single transfer.
#[derive(Debug)]
pub enum TransferError {
    Http(reqwest::Error),
    WebSocket(tungstenite::Error),
    Url(url::ParseError),
    /// A request body could not be encoded
    Encode(serde_json::Error),
    /// A response body could not be decoded
    Decode(String),
    /// The peer sent a frame the protocol does not allow
    Protocol(String),
    /// The channel was closed before the transfer completed
    Closed,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Http(e) => write!(f, "HTTP transfer failed: {}", e),
            TransferError::WebSocket(e) => {
                write!(f, "WebSocket transfer failed: {}", e)
            }
            TransferError::Url(e) => write!(f, "invalid transfer URL: {}", e),
            TransferError::Encode(e) => {
                write!(f, "could not encode request: {}", e)
            }
            TransferError::Decode(msg) => {
                write!(f, "could not decode response: {}", msg)
            }
            TransferError::Protocol(msg) => {
                write!(f, "protocol violation: {}", msg)
            }
            TransferError::Closed => f.write_str("channel closed"),
        }
    }
}

impl Error for TransferError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransferError::Http(e) => Some(e),
            TransferError::WebSocket(e) => Some(e),
            TransferError::Url(e) => Some(e),
            TransferError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        TransferError::Http(e)
    }
}

impl From<tungstenite::Error> for TransferError {
    fn from(e: tungstenite::Error) -> Self {
        TransferError::WebSocket(e)
    }
}

impl From<url::ParseError> for TransferError {
    fn from(e: url::ParseError) -> Self {
        TransferError::Url(e)
    }
}

impl From<TransferError> for SpeedTestError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Protocol(ref msg) => {
                SpeedTestError::protocol(msg.clone()).with_source(e)
            }
            _ => SpeedTestError::transport(e.to_string()).with_source(e),
        }
    }
}

/// One unit of work sent over a channel.
#[derive(Debug, Clone)]
pub enum Transfer {
    /// Latency ping, matched with its pong by `index`
    Ping { index: u64 },
    /// Ask the server for `size` bytes
    Download { size: u64 },
    /// Send `payload` to the server
    Upload { payload: Bytes },
}

/// What a channel reports back while a transfer is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Bytes moved since the previous progress event of the same transfer
    Progress { bytes: u64 },
    /// Answer to a latency ping
    Pong { index: u64, rtt: Duration },
    /// The transfer finished; the next one may be sent
    Complete,
}

#[async_trait]
pub trait TransferChannel: Send {
    /// Establish the underlying connection, if any.
    async fn open(&mut self) -> Result<(), TransferError>;

    /// Start a transfer. Its progress is read with [`next_event`].
    ///
    /// [`next_event`]: TransferChannel::next_event
    async fn send(&mut self, transfer: Transfer) -> Result<(), TransferError>;

    /// Wait for the next event of the in-flight transfer.
    async fn next_event(&mut self) -> Result<ChannelEvent, TransferError>;

    /// Release the underlying resource. Never fails.
    async fn close(&mut self);
}

/// Factory for channels and the one-shot requests of a run.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Build the channel for one stream of `step`.
    fn channel(
        &self,
        step: Step,
        config: &Config,
    ) -> Result<Box<dyn TransferChannel>, TransferError>;

    async fn lookup_ip(
        &self,
        config: &Config,
    ) -> Result<IpInfo, TransferError>;

    /// Persist a finished run; returns the server's id for it.
    async fn store_result(
        &self,
        config: &Config,
        record: &ResultRecord,
    ) -> Result<String, TransferError>;
}

/// The real network: reqwest for HTTP, tokio-tungstenite for WebSocket.
#[derive(Debug, Clone)]
pub struct NetworkTransport {
    http: reqwest::Client,
}

impl NetworkTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { http })
    }

    fn api(&self, config: &Config) -> Result<Client, TransferError> {
        let base = url::Url::parse(&config.endpoint.http)?;

        Ok(Client::from_parts(self.http.clone(), base))
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn channel(
        &self,
        step: Step,
        config: &Config,
    ) -> Result<Box<dyn TransferChannel>, TransferError> {
        let phase = config.phase(step).ok_or_else(|| {
            TransferError::Protocol(format!("{} has no transfer channel", step))
        })?;

        match phase.mode {
            Mode::Http => {
                let base = url::Url::parse(&config.endpoint.http)?;
                Ok(Box::new(RequestChannel::new(
                    self.http.clone(),
                    base,
                    &phase.path,
                )))
            }
            Mode::WebSocket => {
                let base = config
                    .endpoint
                    .websocket_base()
                    .map_err(|e| TransferError::Protocol(e.message))?;
                let url = crate::api::join_url(&base, &phase.path)?;
                Ok(Box::new(DuplexChannel::new(url)))
            }
        }
    }

    async fn lookup_ip(
        &self,
        config: &Config,
    ) -> Result<IpInfo, TransferError> {
        self.api(config)?
            .send(IpRequest { path: config.ip.path.clone() })
            .await
    }

    async fn store_result(
        &self,
        config: &Config,
        record: &ResultRecord,
    ) -> Result<String, TransferError> {
        let id = self
            .api(config)?
            .fetch(SaveResult { path: &config.result.path, record })
            .await?;

        Ok(id.trim().trim_matches('"').to_string())
    }
}
