//! Post-response cost reconciliation. The streaming wrapper forwards
//! upstream bytes to the client unchanged while parsing SSE frames for a
//! usage report; settlement itself always runs on the bounded runner so it
//! never delays delivery.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde_json::Value;

use crate::pricing::{calculate_cost, Pricing};
use crate::providers::{Provider, TokenUsage};
use crate::runner::BoundedRunner;
use crate::spend::SpendAccountant;

use std::sync::Arc;

/// Frame buffer bounds: a stream that never produces a frame delimiter must
/// not grow the tracker without limit.
const TRACKER_MAX_BUFFER_BYTES: usize = 512 * 1024;
const TRACKER_TAIL_BYTES: usize = 128 * 1024;

/// Request-scoped accounting state, created by the rate-limit gate after a
/// successful reservation and consumed exactly once at settlement.
#[derive(Clone, Debug)]
pub struct Reservation {
    pub tenant: String,
    pub estimate: f64,
    pub pricing: Pricing,
    pub model: String,
    pub started_at: Instant,
}

pub fn is_streaming_content_type(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    content_type.contains("text/event-stream")
        || content_type.contains("application/x-ndjson")
        || content_type.contains("stream")
}

/// Everything needed to resolve one reservation. Consuming it settles at
/// most once; the runner carries the store round-trip off the request path.
pub struct Settlement {
    pub reservation: Reservation,
    pub provider: Arc<dyn Provider>,
    pub accountant: Arc<SpendAccountant>,
    pub runner: BoundedRunner,
}

impl Settlement {
    /// Resolves the reservation: charge actual cost when a usage report was
    /// found, refund when the response errored without one, otherwise keep
    /// the estimate.
    pub fn settle(self, usage: Option<TokenUsage>, errored: bool) {
        let Reservation {
            tenant,
            estimate,
            pricing,
            ..
        } = self.reservation;
        if estimate == 0.0 {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(tenant_id = %tenant, "no runtime for settlement, skipping");
            return;
        }

        let accountant = self.accountant;
        if let Some(usage) = usage {
            let actual = calculate_cost(usage.input_tokens, usage.output_tokens, pricing);
            self.runner.spawn(async move {
                accountant.adjust_cost(&tenant, estimate, actual).await;
            });
        } else if errored {
            self.runner.spawn(async move {
                accountant.refund_estimate(&tenant, estimate).await;
            });
        }
    }

    /// Refund without inspecting a response; used on transport failure.
    pub fn refund(self) {
        let Reservation {
            tenant, estimate, ..
        } = self.reservation;
        if estimate == 0.0 {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(tenant_id = %tenant, "no runtime for refund, skipping");
            return;
        }
        let accountant = self.accountant;
        self.runner.spawn(async move {
            accountant.refund_estimate(&tenant, estimate).await;
        });
    }

    /// Settles a fully buffered response: JSON-decode a side copy, charge
    /// actual cost when usage is present, refund when the body carries an
    /// `error` or the status is an application error without usage.
    pub fn settle_buffered(self, status: StatusCode, body: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            tracing::debug!(
                tenant_id = %self.reservation.tenant,
                "response not JSON, keeping estimate"
            );
            return;
        };
        let errored = status.as_u16() >= 400 || value.get("error").is_some();
        let usage = self.provider.parse_token_usage(&value);
        self.settle(usage, errored);
    }
}

/// Accumulating SSE parser. Frame boundaries may split arbitrarily across
/// reads, so bytes collect in a rolling buffer and frames are only emitted
/// on a complete `\n\n` / `\r\n\r\n` boundary.
#[derive(Default)]
pub struct SseUsageTracker {
    buffer: BytesMut,
    usage: Option<TokenUsage>,
    errored: bool,
    saw_done: bool,
}

impl SseUsageTracker {
    pub fn ingest(&mut self, chunk: &[u8], provider: &dyn Provider) {
        self.buffer.extend_from_slice(chunk);

        loop {
            let Some((pos, delimiter_len)) = find_sse_delimiter(self.buffer.as_ref()) else {
                break;
            };
            let frame = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            self.parse_frame(frame.as_ref(), provider);
        }

        if self.buffer.len() > TRACKER_MAX_BUFFER_BYTES {
            let keep_from = self.buffer.len().saturating_sub(TRACKER_TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
    }

    /// Parses whatever is left in the buffer as a final frame. Called at
    /// EOF and on close.
    pub fn flush(&mut self, provider: &dyn Provider) {
        if self.buffer.is_empty() {
            return;
        }
        let frame = self.buffer.split_off(0);
        self.parse_frame(frame.as_ref(), provider);
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    fn parse_frame(&mut self, frame: &[u8], provider: &dyn Provider) {
        let Some(data) = extract_sse_data(frame) else {
            return;
        };
        let trimmed = trim_ascii_whitespace(&data);
        if trimmed == b"[DONE]" {
            self.saw_done = true;
            return;
        }

        let Ok(chunk) = serde_json::from_slice::<Value>(trimmed) else {
            return;
        };
        if chunk.get("error").is_some() {
            self.errored = true;
        }
        if let Some(usage) = provider.parse_token_usage(&chunk) {
            // Providers repeat usage across chunks with growing counts;
            // track the maximum observed for each side.
            let merged = self.usage.get_or_insert_with(TokenUsage::default);
            merged.input_tokens = merged.input_tokens.max(usage.input_tokens);
            merged.output_tokens = merged.output_tokens.max(usage.output_tokens);
        }
    }
}

/// Single forward scan so mixed newline styles still split at the earliest
/// frame boundary.
fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len()
            && buf[idx] == b'\r'
            && buf[idx + 1] == b'\n'
            && buf[idx + 2] == b'\r'
            && buf[idx + 3] == b'\n'
        {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

fn extract_sse_data(frame: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    for line in frame.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(rest);
    }
    (!out.is_empty()).then_some(out)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Transparent streaming wrapper: bytes pass through untouched while the
/// tracker watches for usage. Finalizes exactly once, on `[DONE]`, EOF, or
/// drop, whichever comes first.
pub struct StreamingReconciler<S> {
    inner: S,
    provider: Arc<dyn Provider>,
    tracker: SseUsageTracker,
    settlement: Option<Settlement>,
}

impl<S> StreamingReconciler<S> {
    pub fn new(inner: S, settlement: Settlement) -> Self {
        let provider = settlement.provider.clone();
        Self {
            inner,
            provider,
            tracker: SseUsageTracker::default(),
            settlement: Some(settlement),
        }
    }

    fn finalize(&mut self) {
        let Some(settlement) = self.settlement.take() else {
            return;
        };
        settlement.settle(self.tracker.usage(), self.tracker.errored());
    }

    fn finalize_with_flush(&mut self) {
        if self.settlement.is_some() {
            self.tracker.flush(self.provider.as_ref());
            self.finalize();
        }
    }
}

impl<S, E> Stream for StreamingReconciler<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
{
    type Item = std::result::Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.tracker.ingest(chunk.as_ref(), this.provider.as_ref());
                if this.tracker.saw_done() {
                    this.finalize();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                this.finalize_with_flush();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for StreamingReconciler<S> {
    fn drop(&mut self) {
        // A client that disconnects mid-stream still settles the
        // reservation with whatever usage was observed.
        self.finalize_with_flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::OpenAiProvider;
    use crate::spend::{LimitDecision, SpendLedger};
    use crate::Result;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingLedger {
        adjustments: Mutex<Vec<(String, f64, f64)>>,
    }

    #[async_trait]
    impl SpendLedger for RecordingLedger {
        async fn check_and_reserve(
            &self,
            _tenant: &str,
            _estimated_cost: f64,
        ) -> Result<LimitDecision> {
            Ok(LimitDecision {
                allowed: true,
                current_spend: 0.0,
                limit: 100.0,
                remaining: 100.0,
            })
        }

        async fn adjust_cost(&self, tenant: &str, estimate: f64, actual: f64) -> Result<()> {
            self.adjustments
                .lock()
                .expect("lock")
                .push((tenant.to_string(), estimate, actual));
            Ok(())
        }

        async fn get_spend(&self, _tenant: &str) -> Result<f64> {
            Ok(0.0)
        }

        async fn get_limit(&self, _tenant: &str) -> Result<f64> {
            Ok(100.0)
        }
    }

    fn pricing() -> Pricing {
        Pricing {
            input_price: 2.50,
            output_price: 10.00,
        }
    }

    fn settlement(
        ledger: Arc<RecordingLedger>,
        runner: BoundedRunner,
        estimate: f64,
    ) -> Settlement {
        Settlement {
            reservation: Reservation {
                tenant: "t-1".to_string(),
                estimate,
                pricing: pricing(),
                model: "gpt-4o".to_string(),
                started_at: Instant::now(),
            },
            provider: Arc::new(OpenAiProvider::new("sk-test").expect("provider")),
            accountant: Arc::new(SpendAccountant::new(ledger, 100.0)),
            runner,
        }
    }

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new("sk-test").expect("provider")
    }

    #[test]
    fn tracker_handles_frames_split_across_reads() {
        let provider = provider();
        let mut tracker = SseUsageTracker::default();
        tracker.ingest(b"data: {\"usage\":{\"prompt_tok", &provider);
        assert_eq!(tracker.usage(), None);
        tracker.ingest(b"ens\":2,\"completion_tokens\":3}}\n", &provider);
        assert_eq!(tracker.usage(), None);
        tracker.ingest(b"\ndata: [DONE]\n\n", &provider);
        assert!(tracker.saw_done());
        assert_eq!(
            tracker.usage(),
            Some(TokenUsage {
                input_tokens: 2,
                output_tokens: 3
            })
        );
    }

    #[test]
    fn tracker_accepts_crlf_delimiters() {
        let provider = provider();
        let mut tracker = SseUsageTracker::default();
        tracker.ingest(
            b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1}}\r\n\r\n",
            &provider,
        );
        assert!(tracker.usage().is_some());
    }

    #[test]
    fn tracker_merges_usage_with_maximum() {
        let provider = provider();
        let mut tracker = SseUsageTracker::default();
        tracker.ingest(
            b"data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":1}}\n\n",
            &provider,
        );
        tracker.ingest(
            b"data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":9}}\n\n",
            &provider,
        );
        assert_eq!(
            tracker.usage(),
            Some(TokenUsage {
                input_tokens: 5,
                output_tokens: 9
            })
        );
    }

    #[test]
    fn tracker_flags_error_chunks() {
        let provider = provider();
        let mut tracker = SseUsageTracker::default();
        tracker.ingest(b"data: {\"error\":{\"message\":\"overloaded\"}}\n\n", &provider);
        assert!(tracker.errored());
        assert_eq!(tracker.usage(), None);
    }

    #[test]
    fn tracker_flush_parses_residual_frame() {
        let provider = provider();
        let mut tracker = SseUsageTracker::default();
        tracker.ingest(
            b"data: {\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":3}}",
            &provider,
        );
        assert_eq!(tracker.usage(), None);
        tracker.flush(&provider);
        assert!(tracker.usage().is_some());
    }

    #[tokio::test]
    async fn streaming_passes_bytes_through_unchanged_and_adjusts_once() {
        let ledger = Arc::new(RecordingLedger::default());
        let runner = BoundedRunner::new(8);

        let frames: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":3}}\n\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let expected: Vec<u8> = frames
            .iter()
            .flat_map(|frame| frame.as_ref().expect("frame").to_vec())
            .collect();

        let mut reconciler = StreamingReconciler::new(
            futures_util::stream::iter(frames),
            settlement(ledger.clone(), runner.clone(), 0.01),
        );

        let mut forwarded = Vec::new();
        while let Some(chunk) = reconciler.next().await {
            forwarded.extend_from_slice(chunk.expect("chunk").as_ref());
        }
        drop(reconciler);
        assert_eq!(forwarded, expected);

        assert_eq!(runner.drain(Duration::from_secs(5)).await, 0);
        let adjustments = ledger.adjustments.lock().expect("lock");
        assert_eq!(adjustments.len(), 1);
        let (tenant, estimate, actual) = &adjustments[0];
        assert_eq!(tenant, "t-1");
        assert_eq!(*estimate, 0.01);
        let expected_actual = calculate_cost(2, 3, pricing());
        assert!((actual - expected_actual).abs() < 1e-12);
    }

    #[tokio::test]
    async fn dropping_mid_stream_finalizes_with_observed_usage() {
        let ledger = Arc::new(RecordingLedger::default());
        let runner = BoundedRunner::new(8);

        let frames: Vec<std::result::Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(
            b"data: {\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":6}}\n\n",
        ))];
        let mut reconciler = StreamingReconciler::new(
            futures_util::stream::iter(frames),
            settlement(ledger.clone(), runner.clone(), 0.02),
        );
        let _ = reconciler.next().await;
        drop(reconciler);

        assert_eq!(runner.drain(Duration::from_secs(5)).await, 0);
        assert_eq!(ledger.adjustments.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn streaming_error_without_usage_refunds() {
        let ledger = Arc::new(RecordingLedger::default());
        let runner = BoundedRunner::new(8);

        let frames: Vec<std::result::Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(
            b"data: {\"error\":{\"message\":\"boom\"}}\n\n",
        ))];
        let mut reconciler = StreamingReconciler::new(
            futures_util::stream::iter(frames),
            settlement(ledger.clone(), runner.clone(), 0.05),
        );
        while reconciler.next().await.is_some() {}
        drop(reconciler);

        assert_eq!(runner.drain(Duration::from_secs(5)).await, 0);
        let adjustments = ledger.adjustments.lock().expect("lock");
        assert_eq!(adjustments.len(), 1);
        // Refund arrives as an adjustment to zero.
        assert_eq!(adjustments[0].2, 0.0);
    }

    #[tokio::test]
    async fn eof_then_drop_settles_only_once() {
        let ledger = Arc::new(RecordingLedger::default());
        let runner = BoundedRunner::new(8);

        let frames: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1}}\n\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let mut reconciler = StreamingReconciler::new(
            futures_util::stream::iter(frames),
            settlement(ledger.clone(), runner.clone(), 0.01),
        );
        while reconciler.next().await.is_some() {}
        drop(reconciler);

        assert_eq!(runner.drain(Duration::from_secs(5)).await, 0);
        assert_eq!(ledger.adjustments.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn buffered_settlement_charges_usage() {
        let ledger = Arc::new(RecordingLedger::default());
        let runner = BoundedRunner::new(8);

        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":20}}"#;
        settlement(ledger.clone(), runner.clone(), 0.5)
            .settle_buffered(StatusCode::OK, body);

        assert_eq!(runner.drain(Duration::from_secs(5)).await, 0);
        let adjustments = ledger.adjustments.lock().expect("lock");
        assert_eq!(adjustments.len(), 1);
        let expected = calculate_cost(10, 20, pricing());
        assert!((adjustments[0].2 - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn buffered_error_without_usage_refunds() {
        let ledger = Arc::new(RecordingLedger::default());
        let runner = BoundedRunner::new(8);

        let body = br#"{"error":{"message":"model not found"}}"#;
        settlement(ledger.clone(), runner.clone(), 0.5)
            .settle_buffered(StatusCode::NOT_FOUND, body);

        assert_eq!(runner.drain(Duration::from_secs(5)).await, 0);
        let adjustments = ledger.adjustments.lock().expect("lock");
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].1, 0.5);
        assert_eq!(adjustments[0].2, 0.0);
    }

    #[tokio::test]
    async fn non_json_body_keeps_the_estimate() {
        let ledger = Arc::new(RecordingLedger::default());
        let runner = BoundedRunner::new(8);

        settlement(ledger.clone(), runner.clone(), 0.5)
            .settle_buffered(StatusCode::OK, b"<html>hello</html>");

        assert_eq!(runner.drain(Duration::from_secs(5)).await, 0);
        assert!(ledger.adjustments.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn zero_estimate_never_settles() {
        let ledger = Arc::new(RecordingLedger::default());
        let runner = BoundedRunner::new(8);

        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":20}}"#;
        settlement(ledger.clone(), runner.clone(), 0.0)
            .settle_buffered(StatusCode::OK, body);

        assert_eq!(runner.drain(Duration::from_secs(5)).await, 0);
        assert!(ledger.adjustments.lock().expect("lock").is_empty());
    }
}
