//! Terminal rendering of status events.

use crate::messaging::Event;
use crate::results::clamp_progress;
use crate::status::{Status, Step};
use colored::{Color, Colorize};

const BAR_WIDTH: usize = 24;

/// Get color for speed value based on thresholds.
///
/// - Green: >= 100 Mbps (fast)
/// - Yellow: 25-100 Mbps (moderate)
/// - Red: < 25 Mbps (slow)
pub fn speed_color(speed_mbps: f64) -> Color {
    if speed_mbps >= 100.0 {
        Color::Green
    } else if speed_mbps >= 25.0 {
        Color::Yellow
    } else {
        Color::Red
    }
}

pub fn to_mbps(bits_per_second: f64) -> f64 {
    bits_per_second / 1_000_000.0
}

/// Format a speed in bit/s as Mbps with 2 decimal places.
pub fn format_speed(bits_per_second: f64) -> String {
    format!("{:.2} Mbps", to_mbps(bits_per_second))
}

/// Format latency value with 2 decimal places.
pub fn format_latency(latency_ms: f64) -> String {
    format!("{:.2} ms", latency_ms)
}

pub fn progress_bar(progress: f64) -> String {
    let filled = (clamp_progress(progress) * BAR_WIDTH as f64).round() as usize;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

/// One-line view of the running step, for redrawing in place.
pub fn progress_line(event: &Event) -> Option<String> {
    let step = event.step?;
    let results = &event.results;

    let (progress, value) = match step {
        Step::Ip => (0.0, None),
        Step::Latency => {
            let latency = results.latency.as_ref()?;
            (latency.progress, latency.avg.map(format_latency))
        }
        Step::Download => {
            let download = results.download.as_ref()?;
            (download.progress, download.speed.map(format_speed))
        }
        Step::Upload => {
            let upload = results.upload.as_ref()?;
            (upload.progress, upload.speed.map(format_speed))
        }
    };

    Some(format!(
        "{:<9} {} {:>3}%  {}",
        step.as_str(),
        progress_bar(progress),
        (clamp_progress(progress) * 100.0).round() as u32,
        value.unwrap_or_default()
    ))
}

/// Final report of a run.
pub fn summary_lines(event: &Event) -> Vec<String> {
    let results = &event.results;
    let mut lines = Vec::new();

    if let Some(ip) = &results.ip {
        let org = ip
            .org
            .as_deref()
            .map(|org| format!(" ({})", org))
            .unwrap_or_default();
        lines.push(format!(
            "{} {}{}",
            "Your IP:".bold().white(),
            ip.address.bright_blue(),
            org.bright_blue()
        ));
    }

    if let Some(latency) = &results.latency {
        if let Some(avg) = latency.avg {
            lines.push(format!(
                "{} {}",
                "Latency:".bold().white(),
                format_latency(avg)
            ));
            lines.push(format!(
                "{} {}",
                "Jitter:".bold().white(),
                format_latency(latency.jitter)
            ));
        }
    }

    let bandwidth =
        [("Download:", &results.download), ("Upload:", &results.upload)];
    for (label, result) in bandwidth {
        if let Some(speed) = result.as_ref().and_then(|r| r.speed) {
            lines.push(format!(
                "{} {}",
                label.bold().white(),
                format_speed(speed).color(speed_color(to_mbps(speed)))
            ));
        }
    }

    if let Some(id) = &results.id {
        lines.push(format!("{} {}", "Result id:".bold().white(), id));
    }

    for alert in event.alerts.values() {
        lines.push(format!("{} {}", "Note:".bold().yellow(), alert));
    }

    match event.status {
        Status::Aborted => lines.push("Test aborted".yellow().to_string()),
        Status::Failed => lines.push(format!(
            "{} {}",
            "Test failed:".bold().red(),
            event.error.as_deref().unwrap_or("unknown error")
        )),
        _ => {}
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::results::{BandwidthResult, IpResult, Results};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn event(status: Status, step: Option<Step>, results: Results) -> Event {
        Event {
            status,
            step,
            config: Arc::new(Config::default()),
            results,
            alerts: BTreeMap::new(),
            error: None,
        }
    }

    proptest! {
        #[test]
        fn prop_speed_formatting_precision(
            speed in proptest::num::f64::NORMAL
        ) {
            let formatted = format_speed(speed);
            prop_assert!(formatted.ends_with(" Mbps"));
            let numeric_part = formatted.trim_end_matches(" Mbps");
            let dot = numeric_part.find('.');
            prop_assert!(dot.is_some());
            prop_assert_eq!(numeric_part.len() - dot.unwrap_or(0) - 1, 2);
        }

        #[test]
        fn prop_progress_bar_has_fixed_width(progress in -1.0f64..3.0) {
            prop_assert_eq!(progress_bar(progress).len(), BAR_WIDTH + 2);
        }

        #[test]
        fn prop_speed_color_coding_moderate(speed in 25.0f64..100.0f64) {
            prop_assert_eq!(speed_color(speed), Color::Yellow);
        }
    }

    #[test]
    fn test_format_speed_in_mbps() {
        assert_eq!(format_speed(16_777_216.0), "16.78 Mbps");
        assert_eq!(format_latency(50.0), "50.00 ms");
        assert_eq!(speed_color(250.0), Color::Green);
        assert_eq!(speed_color(3.0), Color::Red);
    }

    #[test]
    fn test_progress_line_for_download() {
        let results = Results {
            download: Some(BandwidthResult {
                status: Status::Running,
                progress: 0.5,
                speed: Some(94_000_000.0),
            }),
            ..Results::new()
        };

        let running = event(Status::Running, Some(Step::Download), results);
        let line = progress_line(&running).unwrap();
        assert!(line.starts_with("download"));
        assert!(line.contains(" 50%"));
        assert!(line.ends_with("94.00 Mbps"));

        let done = event(Status::Done, None, Results::new());
        assert!(progress_line(&done).is_none());
    }

    #[test]
    fn test_summary_reports_failure() {
        let results = Results {
            ip: Some(IpResult {
                address: "203.0.113.7".to_string(),
                org: None,
            }),
            ..Results::new()
        };
        let mut failed = event(Status::Failed, None, results);
        failed.error = Some("connection refused".to_string());

        let lines = summary_lines(&failed);
        assert!(lines[0].contains("203.0.113.7"));
        assert!(lines.last().unwrap().contains("connection refused"));
    }
}
