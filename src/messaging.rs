//! Command and event protocol between the engine and its host.
//!
//! The host sends [`Command`]s (`"start"`, `"abort"`, `"status"`,
//! `"config"` or `{"config": {...}}`); the engine answers with status
//! [`Event`]s, pushed through a [`Messenger`].

use crate::config::Config;
use crate::errors::SpeedTestError;
use crate::results::Results;
use crate::status::{Status, Step};
use log::trace;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Abort,
    Status,
    Config,
    /// Dotted-path overrides to merge into the live configuration
    Overrides(Map<String, Value>),
}

impl Command {
    /// Parse one command line.
    ///
    /// Accepts bare tokens (`start`), JSON strings (`"start"`) and the
    /// `{"config": {...}}` object.
    pub fn parse(raw: &str) -> Result<Command, SpeedTestError> {
        let raw = raw.trim();

        let value = match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(_) => Value::String(raw.to_string()),
        };

        match value {
            Value::String(token) => match token.as_str() {
                "start" => Ok(Command::Start),
                "abort" => Ok(Command::Abort),
                "status" => Ok(Command::Status),
                "config" => Ok(Command::Config),
                other => Err(SpeedTestError::config(format!(
                    "unknown command {:?}",
                    other
                ))),
            },
            Value::Object(mut object) => match object.remove("config") {
                Some(Value::Object(overrides)) => {
                    Ok(Command::Overrides(overrides))
                }
                _ => Err(SpeedTestError::config(
                    "expected {\"config\": {...}} with an object of overrides",
                )),
            },
            _ => Err(SpeedTestError::config(format!(
                "unknown command {}",
                raw
            ))),
        }
    }
}

/// Snapshot of the engine pushed to the host.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub status: Status,
    pub step: Option<Step>,
    pub config: Arc<Config>,
    pub results: Results,
    pub alerts: BTreeMap<String, String>,
    /// Message of the error a `failed` run ended with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pushes events to the host.
///
/// Terminal and lifecycle events are always delivered. Progress events are
/// throttled to one per `interval`; a zero interval delivers every one.
#[derive(Debug)]
pub struct Messenger {
    tx: Option<UnboundedSender<Event>>,
    interval: Mutex<Duration>,
    last_progress: Mutex<Option<Instant>>,
}

impl Messenger {
    pub fn new(tx: UnboundedSender<Event>, interval: Duration) -> Self {
        Self {
            tx: Some(tx),
            interval: Mutex::new(interval),
            last_progress: Mutex::new(None),
        }
    }

    /// A messenger without a host; events are dropped.
    pub fn detached() -> Self {
        Self {
            tx: None,
            interval: Mutex::new(Duration::ZERO),
            last_progress: Mutex::new(None),
        }
    }

    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock().unwrap_or_else(|p| p.into_inner()) = interval;
    }

    /// Deliver an event unconditionally.
    pub fn post(&self, event: Event) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Host is gone, dropping event");
            }
        }
    }

    /// Deliver a progress event unless one was delivered less than
    /// `interval` ago. The event is only built when it will be sent.
    pub fn progress(&self, event: impl FnOnce() -> Event) {
        if self.tx.is_none() {
            return;
        }

        let interval = *self.interval.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        {
            let mut last =
                self.last_progress.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(last) = *last {
                if now.duration_since(last) < interval {
                    return;
                }
            }
            *last = Some(now);
        }

        self.post(event());
    }
}
