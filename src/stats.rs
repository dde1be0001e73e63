use serde::{Deserialize, Serialize};

use crate::metrics::RequestRecord;

/// Nearest-rank percentile without interpolation.
///
/// Returns the element at zero-based index `floor(p / 100 * (n - 1))` of the
/// sorted sample, or `0.0` for an empty sample. `p` is clamped to `[0, 100]`.
/// The caller's slice is left untouched.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    Sample::new(values.to_vec()).map_or(0.0, |sample| sample.percentile(p))
}

/// A non-empty, sorted sample of one metric.
#[derive(Debug, Clone)]
pub struct Sample {
    sorted: Vec<f64>,
}

impl Sample {
    /// Returns `None` for an empty sample so callers cannot read statistics
    /// out of no data.
    pub fn new(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        Some(Self { sorted: values })
    }

    pub fn min(&self) -> f64 {
        self.sorted[0]
    }

    pub fn max(&self) -> f64 {
        self.sorted[self.sorted.len() - 1]
    }

    pub fn mean(&self) -> f64 {
        self.sorted.iter().sum::<f64>() / self.sorted.len() as f64
    }

    pub fn percentile(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 100.0);
        let last = self.sorted.len() - 1;
        let index = ((p / 100.0) * last as f64).floor() as usize;
        self.sorted[index.min(last)]
    }
}

/// Distribution summary of a latency metric, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencyStats {
    pub fn from_values(values: Vec<f64>) -> Option<Self> {
        let sample = Sample::new(values)?;
        Some(Self {
            avg: sample.mean(),
            min: sample.min(),
            max: sample.max(),
            p50: sample.percentile(50.0),
            p95: sample.percentile(95.0),
            p99: sample.percentile(99.0),
        })
    }
}

/// Distribution summary of per-request tokens per second.
///
/// Carries the low tail (p1, p5) since slow requests are the throughput risk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p1: f64,
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl ThroughputStats {
    pub fn from_values(values: Vec<f64>) -> Option<Self> {
        let sample = Sample::new(values)?;
        Some(Self {
            avg: sample.mean(),
            min: sample.min(),
            max: sample.max(),
            p1: sample.percentile(1.0),
            p5: sample.percentile(5.0),
            p50: sample.percentile(50.0),
            p95: sample.percentile(95.0),
            p99: sample.percentile(99.0),
        })
    }
}

/// Aggregate statistics over a batch of request records.
///
/// Any metric whose sample is empty is `None`, never zero. Only successful
/// records feed the distributions and token totals; failed records count
/// towards `total_requests` and `failed_requests` only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub success_rate: Option<f64>,
    pub batch_duration: f64,
    pub rps: Option<f64>,
    pub overall_tps: Option<f64>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub avg_input_tokens: Option<f64>,
    pub avg_output_tokens: Option<f64>,
    pub ttft: Option<LatencyStats>,
    pub e2e_latency: Option<LatencyStats>,
    pub itl: Option<LatencyStats>,
    pub tps: Option<ThroughputStats>,
}

impl BatchSummary {
    /// Aggregates `records` observed over `batch_duration` seconds.
    pub fn compute(records: &[RequestRecord], batch_duration: f64) -> Self {
        let successful: Vec<&RequestRecord> = records.iter().filter(|r| r.is_success()).collect();

        let total_requests = records.len();
        let successful_requests = successful.len();

        let total_input_tokens: u64 = successful.iter().map(|r| r.input_tokens).sum();
        let total_output_tokens: u64 = successful.iter().map(|r| r.output_tokens).sum();

        let per_success = |total: u64| {
            (successful_requests > 0).then(|| total as f64 / successful_requests as f64)
        };

        Self {
            total_requests,
            successful_requests,
            failed_requests: total_requests - successful_requests,
            success_rate: (total_requests > 0)
                .then(|| successful_requests as f64 / total_requests as f64),
            batch_duration,
            rps: rate(successful_requests as f64, batch_duration),
            overall_tps: overall_tps(&successful, total_output_tokens),
            total_input_tokens,
            total_output_tokens,
            avg_input_tokens: per_success(total_input_tokens),
            avg_output_tokens: per_success(total_output_tokens),
            ttft: LatencyStats::from_values(successful.iter().filter_map(|r| r.ttft()).collect()),
            e2e_latency: LatencyStats::from_values(
                successful.iter().map(|r| r.e2e_latency()).collect(),
            ),
            itl: LatencyStats::from_values(successful.iter().filter_map(|r| r.itl()).collect()),
            tps: ThroughputStats::from_values(successful.iter().filter_map(|r| r.tps()).collect()),
        }
    }
}

fn rate(count: f64, duration: f64) -> Option<f64> {
    (duration > 0.0).then(|| count / duration)
}

/// Output tokens over the span from the earliest start to the latest end.
fn overall_tps(successful: &[&RequestRecord], total_output_tokens: u64) -> Option<f64> {
    if total_output_tokens == 0 {
        return None;
    }
    let first_start = successful
        .iter()
        .map(|r| r.request_start)
        .min_by(|a, b| a.total_cmp(b))?;
    let last_end = successful
        .iter()
        .map(|r| r.request_end)
        .max_by(|a, b| a.total_cmp(b))?;

    rate(total_output_tokens as f64, last_end - first_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn scenario() -> Vec<RequestRecord> {
        vec![
            RequestRecord::completed(0.0, Some(1.0), 3.0, 10, 4),
            RequestRecord::failed(0.0, 2.0, 6),
            RequestRecord::completed(1.0, Some(2.0), 2.5, 3, 2),
        ]
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values = [30.0, 10.0, 50.0, 20.0, 40.0];

        assert_eq!(percentile(&values, 50.0), 30.0);
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&values, 100.0), 50.0);
        // floor(0.95 * 4) = 3
        assert_eq!(percentile(&values, 95.0), 40.0);
        // caller order is preserved
        assert_eq!(values, [30.0, 10.0, 50.0, 20.0, 40.0]);
    }

    #[test]
    fn test_percentile_empty_and_single() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7.5], 1.0), 7.5);
        assert_eq!(percentile(&[7.5], 99.0), 7.5);
    }

    #[test]
    fn test_percentile_clamps_out_of_range() {
        let values = [1.0, 2.0, 3.0];
        assert_eq!(percentile(&values, -10.0), 1.0);
        assert_eq!(percentile(&values, 250.0), 3.0);
    }

    #[test]
    fn test_sample_rejects_empty() {
        assert!(Sample::new(Vec::new()).is_none());
        let sample = Sample::new(vec![2.0, 4.0]).unwrap();
        assert_eq!((sample.min(), sample.max()), (2.0, 4.0));
        assert_eq!(sample.mean(), 3.0);
    }

    #[test]
    fn test_batch_scenario() {
        let summary = BatchSummary::compute(&scenario(), 3.0);

        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.successful_requests, 2);
        assert_eq!(summary.failed_requests, 1);
        assert!(approx(summary.success_rate.unwrap(), 2.0 / 3.0));
        assert!(approx(summary.rps.unwrap(), 2.0 / 3.0));

        let ttft = summary.ttft.unwrap();
        assert_eq!(ttft.avg, 1.0);
        assert_eq!(ttft.min, 1.0);
        assert_eq!(ttft.max, 1.0);

        let itl = summary.itl.unwrap();
        assert_eq!(itl.min, 0.5);
        assert!(approx(itl.max, 2.0 / 3.0));
        assert!(approx(itl.avg, (2.0 / 3.0 + 0.5) / 2.0));
        assert_eq!(itl.p50, 0.5);

        let e2e = summary.e2e_latency.unwrap();
        assert_eq!(e2e.avg, 2.25);
        assert_eq!(e2e.min, 1.5);
        assert_eq!(e2e.max, 3.0);

        let tps = summary.tps.unwrap();
        assert_eq!(tps.min, 2.0);
        assert_eq!(tps.max, 4.0);
        assert_eq!(tps.avg, 3.0);
        assert_eq!(tps.p1, 2.0);
        assert_eq!(tps.p5, 2.0);
    }

    #[test]
    fn test_token_accounting_ignores_failures() {
        let summary = BatchSummary::compute(&scenario(), 3.0);

        assert_eq!(summary.total_input_tokens, 13);
        assert_eq!(summary.total_output_tokens, 6);
        assert_eq!(summary.avg_input_tokens, Some(6.5));
        assert_eq!(summary.avg_output_tokens, Some(3.0));
        // 6 tokens between t=0 and t=3
        assert_eq!(summary.overall_tps, Some(2.0));
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let records = scenario();
        let first = BatchSummary::compute(&records, 3.0);
        let second = BatchSummary::compute(&records, 3.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_order_does_not_matter() {
        let mut records = scenario();
        let forward = BatchSummary::compute(&records, 3.0);
        records.reverse();
        let backward = BatchSummary::compute(&records, 3.0);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_empty_batch() {
        let summary = BatchSummary::compute(&[], 2.0);

        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.successful_requests, 0);
        assert_eq!(summary.success_rate, None);
        assert_eq!(summary.rps, Some(0.0));
        assert_eq!(summary.overall_tps, None);
        assert_eq!(summary.avg_input_tokens, None);
        assert!(summary.ttft.is_none());
        assert!(summary.e2e_latency.is_none());
        assert!(summary.itl.is_none());
        assert!(summary.tps.is_none());
    }

    #[test]
    fn test_zero_duration_has_no_rate() {
        let summary = BatchSummary::compute(&scenario(), 0.0);
        assert_eq!(summary.rps, None);
        assert_eq!(summary.successful_requests, 2);
    }

    #[test]
    fn test_all_failed_suppresses_distributions() {
        let records = vec![
            RequestRecord::failed(0.0, 0.5, 4),
            RequestRecord::failed(0.1, 0.7, 4),
        ];
        let summary = BatchSummary::compute(&records, 1.0);

        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.successful_requests, 0);
        assert_eq!(summary.success_rate, Some(0.0));
        assert_eq!(summary.rps, Some(0.0));
        assert!(summary.e2e_latency.is_none());
        assert!(summary.ttft.is_none());
        assert_eq!(summary.total_input_tokens, 0);
    }

    #[test]
    fn test_single_token_requests_have_no_itl_sample() {
        let records = vec![
            RequestRecord::completed(0.0, Some(0.2), 0.2, 2, 1),
            RequestRecord::completed(0.0, Some(0.3), 0.3, 2, 1),
        ];
        let summary = BatchSummary::compute(&records, 1.0);

        assert!(summary.ttft.is_some());
        assert!(summary.itl.is_none());
        assert!(summary.tps.is_none());
    }

    #[test]
    fn test_successful_never_exceeds_total() {
        for n in 0..6 {
            let records: Vec<RequestRecord> = (0..n)
                .map(|i| {
                    if i % 2 == 0 {
                        RequestRecord::completed(0.0, Some(0.1), 1.0, 1, 3)
                    } else {
                        RequestRecord::failed(0.0, 1.0, 1)
                    }
                })
                .collect();
            let summary = BatchSummary::compute(&records, 4.0);
            assert!(summary.successful_requests <= summary.total_requests);
            assert_eq!(
                summary.rps,
                Some(summary.successful_requests as f64 / 4.0)
            );
        }
    }
}
