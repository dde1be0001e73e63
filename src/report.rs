use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::metrics::RequestRecord;
use crate::stats::{BatchSummary, LatencyStats};
use crate::tracker::{RequestTracker, TrackerSnapshot};

pub const REPORT_TYPE: &str = "tracker_metrics";
pub const REPORT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected report type {0:?}")]
    UnexpectedType(String),

    #[error("Unsupported report version {0}")]
    UnsupportedVersion(u32),
}

/// The persisted form of a tracker: raw records plus the batch summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    #[serde(rename = "type")]
    pub report_type: String,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub total_requests: usize,
    pub batch_start_time: Option<f64>,
    pub batch_end_time: f64,
    pub batch_duration: Option<f64>,
    pub raw_metrics: Vec<RequestRecord>,
    pub batch_stats: BatchSummary,
}

impl MetricsReport {
    pub fn from_snapshot(snapshot: TrackerSnapshot) -> Self {
        let batch_duration = snapshot.batch_duration();
        Self {
            report_type: REPORT_TYPE.to_string(),
            version: REPORT_VERSION,
            timestamp: Utc::now(),
            total_requests: snapshot.records.len(),
            batch_start_time: snapshot.batch_start,
            batch_end_time: snapshot.taken_at,
            batch_duration,
            raw_metrics: snapshot.records,
            batch_stats: snapshot.summary,
        }
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PersistError> {
        let report: MetricsReport = serde_json::from_str(json)?;
        if report.report_type != REPORT_TYPE {
            return Err(PersistError::UnexpectedType(report.report_type));
        }
        if report.version > REPORT_VERSION {
            return Err(PersistError::UnsupportedVersion(report.version));
        }
        Ok(report)
    }
}

/// `metrics_<YYYYmmdd_HHMMSS>.json`
pub fn default_filename(now: DateTime<Local>) -> String {
    format!("metrics_{}.json", now.format("%Y%m%d_%H%M%S"))
}

/// Write the tracker's records and summary to `output_dir`.
///
/// `filename` gets a `.json` suffix if it lacks one; without a name, one is
/// derived from the current time. The directory is created if needed.
/// Returns the path written.
pub async fn save_metrics_to_json<C>(
    tracker: &RequestTracker<C>,
    filename: Option<&str>,
    output_dir: impl AsRef<Path>,
) -> Result<PathBuf, PersistError> {
    let report = MetricsReport::from_snapshot(tracker.snapshot());
    write_report(&report, filename, output_dir).await
}

pub async fn write_report(
    report: &MetricsReport,
    filename: Option<&str>,
    output_dir: impl AsRef<Path>,
) -> Result<PathBuf, PersistError> {
    let output_dir = output_dir.as_ref();
    tokio::fs::create_dir_all(output_dir).await?;

    let mut filename = match filename {
        Some(name) => name.to_string(),
        None => default_filename(Local::now()),
    };
    if !filename.ends_with(".json") {
        filename.push_str(".json");
    }

    let path = output_dir.join(filename);
    tokio::fs::write(&path, report.to_json()?).await?;
    log::info!(
        "Wrote {} request records to {}",
        report.total_requests,
        path.display()
    );

    Ok(path)
}

pub async fn load_metrics_from_json(path: impl AsRef<Path>) -> Result<MetricsReport, PersistError> {
    let contents = tokio::fs::read_to_string(path).await?;
    MetricsReport::from_json(&contents)
}

/// Human-readable summary lines, latencies in milliseconds.
pub fn summary_lines(summary: &BatchSummary) -> Vec<String> {
    let mut lines = vec![
        "Batch Complete".to_string(),
        format!("Duration: {:.1}s", summary.batch_duration),
        format!(
            "Requests: Total: {} Ok: {} Err: {} Success: {}",
            summary.total_requests,
            summary.successful_requests,
            summary.failed_requests,
            fmt_percent(summary.success_rate)
        ),
        format!(
            "Tokens: Input: {} Output: {} Total: {}",
            summary.total_input_tokens,
            summary.total_output_tokens,
            summary.total_input_tokens + summary.total_output_tokens
        ),
        format!(
            "Throughput: Requests/s: {} Output tokens/s: {}",
            fmt_rate(summary.rps),
            fmt_rate(summary.overall_tps)
        ),
    ];

    if let Some(ttft) = &summary.ttft {
        lines.push(latency_line("TTFT", ttft));
    }
    if let Some(itl) = &summary.itl {
        lines.push(latency_line("ITL", itl));
    }
    if let Some(e2e) = &summary.e2e_latency {
        lines.push(latency_line("Request Latency", e2e));
    }
    if let Some(tps) = &summary.tps {
        lines.push(format!(
            "TPS (tokens/s): mean: {:.2} p1: {:.2} p5: {:.2} p50: {:.2} min: {:.2} max: {:.2}",
            tps.avg, tps.p1, tps.p5, tps.p50, tps.min, tps.max
        ));
    }

    lines
}

fn latency_line(label: &str, stats: &LatencyStats) -> String {
    format!(
        "{} (ms): mean: {:.1} p50: {:.0} p95: {:.0} p99: {:.0} min: {:.0} max: {:.0}",
        label,
        stats.avg * 1000.0,
        stats.p50 * 1000.0,
        stats.p95 * 1000.0,
        stats.p99 * 1000.0,
        stats.min * 1000.0,
        stats.max * 1000.0
    )
}

fn fmt_rate(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}", v))
}

fn fmt_percent(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}%", v * 100.0))
}

/// Print the summary with a timestamp prefix on every line.
pub fn print_console_report(summary: &BatchSummary) {
    let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false);

    println!();
    println!("{} -----", timestamp);
    for line in summary_lines(summary) {
        println!("{} {}", timestamp, line);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_report() -> MetricsReport {
        let records = vec![
            RequestRecord::completed(0.1, Some(0.4), 1.3, 12, 40),
            RequestRecord::failed(0.2, 0.9, 7),
            RequestRecord::completed(0.3, Some(0.9), 2.1, 5, 17),
        ];
        let summary = BatchSummary::compute(&records, 2.7);

        MetricsReport {
            report_type: REPORT_TYPE.to_string(),
            version: REPORT_VERSION,
            timestamp: Utc::now(),
            total_requests: records.len(),
            batch_start_time: Some(0.1),
            batch_end_time: 2.8,
            batch_duration: Some(2.7),
            raw_metrics: records,
            batch_stats: summary,
        }
    }

    #[test]
    fn test_default_filename() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(default_filename(now), "metrics_20240309_140507.json");
    }

    #[test]
    fn test_json_round_trip_is_exact() {
        let report = sample_report();
        let json = report.to_json().unwrap();
        let loaded = MetricsReport::from_json(&json).unwrap();

        assert_eq!(loaded, report);
        assert_eq!(loaded.batch_stats.itl, report.batch_stats.itl);
        assert_eq!(loaded.batch_stats.tps, report.batch_stats.tps);
    }

    #[test]
    fn test_json_layout() {
        let value: serde_json::Value =
            serde_json::from_str(&sample_report().to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "tracker_metrics");
        assert_eq!(value["version"], 1);
        assert_eq!(value["total_requests"], 3);
        assert_eq!(value["raw_metrics"][1]["status"], "failed");
        assert!(value["raw_metrics"][1]["first_token_time"].is_null());
        assert_eq!(value["batch_stats"]["successful_requests"], 2);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_rejects_foreign_reports() {
        let mut value: serde_json::Value =
            serde_json::from_str(&sample_report().to_json().unwrap()).unwrap();

        value["type"] = serde_json::json!("gpu_metrics");
        let err = MetricsReport::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, PersistError::UnexpectedType(t) if t == "gpu_metrics"));

        value["type"] = serde_json::json!(REPORT_TYPE);
        value["version"] = serde_json::json!(REPORT_VERSION + 1);
        let err = MetricsReport::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, PersistError::UnsupportedVersion(_)));

        let err = MetricsReport::from_json("{\"type\": \"tracker_metrics\"}").unwrap_err();
        assert!(matches!(err, PersistError::Json(_)));
    }

    #[tokio::test]
    async fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("runs");
        let report = sample_report();

        let path = write_report(&report, Some("batch"), &nested).await.unwrap();
        assert_eq!(path, nested.join("batch.json"));

        let loaded = load_metrics_from_json(&path).await.unwrap();
        assert_eq!(loaded, report);
    }

    #[tokio::test]
    async fn test_default_name_when_unspecified() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_report(&sample_report(), None, dir.path()).await.unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("metrics_"));
        assert!(name.ends_with(".json"));
    }

    #[test]
    fn test_summary_lines() {
        let lines = summary_lines(&sample_report().batch_stats);

        assert!(lines.iter().any(|l| l == "Requests: Total: 3 Ok: 2 Err: 1 Success: 66.67%"));
        assert!(lines.iter().any(|l| l.starts_with("TTFT (ms): mean: 450.0")));
        assert!(lines.iter().any(|l| l.starts_with("TPS (tokens/s)")));
    }

    #[test]
    fn test_summary_lines_without_data() {
        let lines = summary_lines(&BatchSummary::default());

        assert!(lines.iter().any(|l| l == "Throughput: Requests/s: n/a Output tokens/s: n/a"));
        assert!(!lines.iter().any(|l| l.starts_with("TTFT")));
    }
}
