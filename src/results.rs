//! Published results of a run.
//!
//! [`Results`] is the cumulative snapshot pushed to the host on every
//! sample. [`ResultRecord`] is the summary persisted once a run is done.

use crate::api::requests::IpInfo;
use crate::stats::round2;
use crate::status::Status;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Client address as seen by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpResult {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
}

impl From<&IpInfo> for IpResult {
    fn from(info: &IpInfo) -> Self {
        Self { address: info.ip.clone(), org: info.org.clone() }
    }
}

/// Latency statistics in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyResult {
    pub status: Status,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    pub jitter: f64,
}

impl LatencyResult {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            progress: 0.0,
            min: None,
            max: None,
            avg: None,
            jitter: 0.0,
        }
    }
}

/// Throughput in bits per second, after overhead compensation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthResult {
    pub status: Status,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl BandwidthResult {
    pub fn new(status: Status) -> Self {
        Self { status, progress: 0.0, speed: None }
    }
}

/// Cumulative results of the current (or last) run.
///
/// `progress` values may exceed 1 right before a phase ends; use
/// [`clamp_progress`] before displaying them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Results {
    pub ip: Option<IpResult>,
    pub latency: Option<LatencyResult>,
    pub download: Option<BandwidthResult>,
    pub upload: Option<BandwidthResult>,
    /// Identifier returned by the server when the run was persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Clamp a progress ratio to `[0, 1]`.
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        return 0.0;
    }
    progress.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub avg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedSummary {
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpSummary {
    pub ip: Option<String>,
    pub org: Option<String>,
}

/// Summary of a finished run, as persisted by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    /// Completion time, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub latency: LatencySummary,
    pub jitter: Option<f64>,
    pub download: SpeedSummary,
    pub upload: SpeedSummary,
    pub ip_info: IpSummary,
}

impl ResultRecord {
    pub fn new(results: &Results, completed_at: DateTime<Utc>) -> Self {
        let latency = results.latency.as_ref();
        let speed = |result: &Option<BandwidthResult>| SpeedSummary {
            speed: result.as_ref().and_then(|r| r.speed),
        };

        Self {
            timestamp: completed_at.timestamp_millis(),
            latency: LatencySummary { avg: latency.and_then(|l| l.avg) },
            jitter: latency.map(|l| round2(l.jitter)),
            download: speed(&results.download),
            upload: speed(&results.upload),
            ip_info: IpSummary {
                ip: results.ip.as_ref().map(|ip| ip.address.clone()),
                org: results.ip.as_ref().and_then(|ip| ip.org.clone()),
            },
        }
    }
}
