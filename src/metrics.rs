//! Per-request records and the timing model derived from them.
//!
//! Timestamps are seconds on a monotonic clock (see [`crate::tracker::Clock`]).
//! Every derived metric returns `None` instead of failing when it is not
//! defined for a record.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Failed,
}

/// One attempted streamed request.
///
/// Records are built once the attempt concludes and are never mutated
/// afterwards, so `request_end` is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_start: f64,
    pub first_token_time: Option<f64>,
    pub request_end: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub status: RequestStatus,
}

impl RequestRecord {
    /// Record for a stream that was consumed to exhaustion.
    ///
    /// A completion that counted zero output tokens carries no first token
    /// time, even if a whitespace-only fragment arrived.
    pub fn completed(
        request_start: f64,
        first_token_time: Option<f64>,
        request_end: f64,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Self {
        let first_token_time = if output_tokens == 0 {
            None
        } else {
            first_token_time
        };

        Self {
            request_start,
            first_token_time,
            request_end,
            input_tokens,
            output_tokens,
            status: RequestStatus::Success,
        }
    }

    /// Record for an attempt whose client call or stream failed.
    pub fn failed(request_start: f64, request_end: f64, input_tokens: u64) -> Self {
        Self {
            request_start,
            first_token_time: None,
            request_end,
            input_tokens,
            output_tokens: 0,
            status: RequestStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Success
    }

    /// Time to first token.
    pub fn ttft(&self) -> Option<f64> {
        self.first_token_time.map(|first| first - self.request_start)
    }

    /// End-to-end latency, from issuance to the end of the stream.
    pub fn e2e_latency(&self) -> f64 {
        self.request_end - self.request_start
    }

    /// Decode-phase duration: first token to end of stream.
    pub fn generation_time(&self) -> Option<f64> {
        self.first_token_time.map(|first| self.request_end - first)
    }

    /// Inter-token latency, averaged over the tokens after the first.
    pub fn itl(&self) -> Option<f64> {
        if self.output_tokens <= 1 {
            return None;
        }
        let generation_time = self.generation_time()?;
        Some(generation_time / (self.output_tokens - 1) as f64)
    }

    /// Decode-phase tokens per second for this request.
    pub fn tps(&self) -> Option<f64> {
        if self.output_tokens <= 1 {
            return None;
        }
        let generation_time = self.generation_time()?;
        if generation_time <= 0.0 {
            return None;
        }
        Some(self.output_tokens as f64 / generation_time)
    }
}

/// The derived metrics of a single record, gathered in one place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub ttft: Option<f64>,
    pub e2e_latency: f64,
    pub itl: Option<f64>,
    pub tps: Option<f64>,
}

impl RequestStats {
    pub fn from_record(record: &RequestRecord) -> Self {
        Self {
            ttft: record.ttft(),
            e2e_latency: record.e2e_latency(),
            itl: record.itl(),
            tps: record.tps(),
        }
    }
}

impl From<&RequestRecord> for RequestStats {
    fn from(record: &RequestRecord) -> Self {
        Self::from_record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_derived_metrics() {
        let record = RequestRecord::completed(0.0, Some(1.0), 3.0, 5, 4);

        assert_eq!(record.ttft(), Some(1.0));
        assert_eq!(record.e2e_latency(), 3.0);
        assert!(approx(record.itl().unwrap(), 2.0 / 3.0));
        assert!(approx(record.tps().unwrap(), 2.0));
    }

    #[test]
    fn test_single_token_has_no_itl_or_tps() {
        let record = RequestRecord::completed(0.0, Some(0.5), 0.5, 1, 1);

        assert_eq!(record.ttft(), Some(0.5));
        assert_eq!(record.itl(), None);
        assert_eq!(record.tps(), None);
    }

    #[test]
    fn test_zero_generation_time() {
        // Every token arrived in the first fragment.
        let record = RequestRecord::completed(0.0, Some(2.0), 2.0, 1, 6);

        assert_eq!(record.itl(), Some(0.0));
        assert_eq!(record.tps(), None);
    }

    #[test]
    fn test_failed_record() {
        let record = RequestRecord::failed(1.0, 1.25, 7);

        assert!(!record.is_success());
        assert_eq!(record.ttft(), None);
        assert_eq!(record.itl(), None);
        assert_eq!(record.tps(), None);
        assert_eq!(record.e2e_latency(), 0.25);
        assert_eq!(record.input_tokens, 7);
        assert_eq!(record.output_tokens, 0);
    }

    #[test]
    fn test_zero_output_tokens_drops_first_token_time() {
        let record = RequestRecord::completed(0.0, Some(0.1), 0.2, 3, 0);

        assert_eq!(record.first_token_time, None);
        assert_eq!(record.ttft(), None);
        assert!(record.is_success());
    }

    #[test]
    fn test_request_stats() {
        let record = RequestRecord::completed(1.0, Some(2.0), 2.5, 1, 2);
        let stats = RequestStats::from(&record);

        assert_eq!(stats.ttft, Some(1.0));
        assert_eq!(stats.e2e_latency, 1.5);
        assert_eq!(stats.itl, Some(0.5));
        assert_eq!(stats.tps, Some(4.0));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RequestStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
    }
}
