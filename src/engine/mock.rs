//! Simulated transport for engine tests. Timing follows tokio's clock, so
//! tests run with paused time are deterministic.

use crate::api::requests::IpInfo;
use crate::config::Config;
use crate::results::ResultRecord;
use crate::status::Step;
use crate::transport::{
    ChannelEvent, Transfer, TransferChannel, TransferError, Transport,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub(crate) struct MockBehavior {
    rtt: Duration,
    chunk: u64,
    interval: Duration,
    open_delay: Duration,
    /// Opens failing before the first one succeeds
    failed_opens: usize,
    ip_fails: bool,
    save_fails: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            rtt: Duration::from_millis(50),
            chunk: 131_072,
            interval: Duration::from_millis(125),
            open_delay: Duration::ZERO,
            failed_opens: 0,
            ip_fails: false,
            save_fails: false,
        }
    }
}

impl MockBehavior {
    pub fn round_trip(ms: u64) -> Self {
        Self { rtt: Duration::from_millis(ms), ..Self::default() }
    }

    pub fn download(chunk: u64, interval_ms: u64, open_delay_ms: u64) -> Self {
        Self {
            chunk,
            interval: Duration::from_millis(interval_ms),
            open_delay: Duration::from_millis(open_delay_ms),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self::default().failing_first(usize::MAX)
    }

    pub fn failing_first(mut self, opens: usize) -> Self {
        self.failed_opens = opens;
        self
    }

    pub fn with_ip_failure(mut self) -> Self {
        self.ip_fails = true;
        self
    }

    pub fn with_save_failure(mut self) -> Self {
        self.save_fails = true;
        self
    }
}

pub(crate) struct MockTransport {
    behavior: MockBehavior,
    opened: Arc<AtomicUsize>,
    saved: Arc<Mutex<Vec<ResultRecord>>>,
}

impl MockTransport {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            opened: Arc::new(AtomicUsize::new(0)),
            saved: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Count of channel opens attempted, failed ones included.
    pub fn opened(&self) -> Arc<AtomicUsize> {
        self.opened.clone()
    }

    pub fn saved(&self) -> Arc<Mutex<Vec<ResultRecord>>> {
        self.saved.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn channel(
        &self,
        _step: Step,
        _config: &Config,
    ) -> Result<Box<dyn TransferChannel>, TransferError> {
        Ok(Box::new(MockChannel {
            behavior: self.behavior.clone(),
            opened: self.opened.clone(),
            in_flight: None,
        }))
    }

    async fn lookup_ip(
        &self,
        _config: &Config,
    ) -> Result<IpInfo, TransferError> {
        sleep(Duration::from_millis(10)).await;
        if self.behavior.ip_fails {
            return Err(TransferError::Closed);
        }
        Ok(IpInfo::new("203.0.113.7").with_org("AS64500 Example"))
    }

    async fn store_result(
        &self,
        _config: &Config,
        record: &ResultRecord,
    ) -> Result<String, TransferError> {
        if self.behavior.save_fails {
            return Err(TransferError::Decode("save rejected".to_string()));
        }
        let mut saved = self.saved.lock().unwrap();
        saved.push(record.clone());
        Ok(format!("result-{}", saved.len()))
    }
}

enum InFlight {
    Ping(u64),
    Bytes(u64),
}

struct MockChannel {
    behavior: MockBehavior,
    opened: Arc<AtomicUsize>,
    in_flight: Option<InFlight>,
}

#[async_trait]
impl TransferChannel for MockChannel {
    async fn open(&mut self) -> Result<(), TransferError> {
        let attempt = self.opened.fetch_add(1, Ordering::SeqCst);
        if attempt < self.behavior.failed_opens {
            return Err(TransferError::Closed);
        }
        if !self.behavior.open_delay.is_zero() {
            sleep(self.behavior.open_delay).await;
        }
        Ok(())
    }

    async fn send(&mut self, transfer: Transfer) -> Result<(), TransferError> {
        self.in_flight = Some(match transfer {
            Transfer::Ping { index } => InFlight::Ping(index),
            Transfer::Download { size } => InFlight::Bytes(size),
            Transfer::Upload { payload } => {
                InFlight::Bytes(payload.len() as u64)
            }
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ChannelEvent, TransferError> {
        match self.in_flight.take() {
            Some(InFlight::Ping(index)) => {
                sleep(self.behavior.rtt).await;
                Ok(ChannelEvent::Pong { index, rtt: self.behavior.rtt })
            }
            Some(InFlight::Bytes(0)) => Ok(ChannelEvent::Complete),
            Some(InFlight::Bytes(remaining)) => {
                sleep(self.behavior.interval).await;
                let bytes = remaining.min(self.behavior.chunk);
                self.in_flight = Some(InFlight::Bytes(remaining - bytes));
                Ok(ChannelEvent::Progress { bytes })
            }
            None => Err(TransferError::Closed),
        }
    }

    async fn close(&mut self) {
        self.in_flight = None;
    }
}
