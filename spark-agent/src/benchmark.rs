//! Concurrent chat-completion benchmark
//!
//! Dispatches N identical requests at once against one endpoint, waits for
//! all of them (each bounded by its own timeout) and reports aggregate
//! throughput: completion tokens of successful requests divided by the span
//! from first dispatch to last completion.

use crate::inference::{ChatMessage, ChatRequest, InferenceClient};
use futures::future::join_all;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BenchmarkRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl BenchmarkRequest {
    fn chat_request(&self) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(&self.prompt)],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub index: usize,
    pub completion_tokens: u64,
    pub latency: Duration,
    /// None on success
    pub error: Option<String>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    finished: Instant,
}

impl RequestOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkSummary {
    pub results: Vec<RequestOutcome>,
    pub successes: usize,
    pub failures: usize,
    pub total_completion_tokens: u64,
    pub wall_clock: Duration,
    pub throughput_tokens_per_sec: f64,
    pub mean_latency: Option<Duration>,
}

/// Send `concurrency` requests at once and wait for every one of them
pub async fn run_concurrent(client: &InferenceClient, request: &BenchmarkRequest, concurrency: usize) -> BenchmarkSummary {
    let concurrency = concurrency.max(1);
    info!(
        "Dispatching {} concurrent request(s) to {} (max_tokens={})",
        concurrency,
        client.base_url(),
        request.max_tokens
    );
    let chat = request.chat_request();

    let outcomes = join_all((0..concurrency).map(|index| {
        let chat = &chat;
        async move {
            let started = Instant::now();
            let response = tokio::time::timeout(request.timeout, client.chat(chat)).await;
            let finished = Instant::now();

            let (completion_tokens, error) = match response {
                Ok(Ok(response)) => (response.completion_tokens(), None),
                Ok(Err(e)) => (0, Some(format!("{:#}", e))),
                Err(_) => (0, Some(format!("timed out after {:?}", request.timeout))),
            };
            match &error {
                None => debug!("request {} finished: {} tokens", index, completion_tokens),
                Some(e) => warn!("request {} failed: {}", index, e),
            }

            RequestOutcome {
                index,
                completion_tokens,
                latency: finished - started,
                error,
                started,
                finished,
            }
        }
    }))
    .await;

    summarize(outcomes)
}

/// Aggregate per-request outcomes
pub fn summarize(results: Vec<RequestOutcome>) -> BenchmarkSummary {
    let first_dispatch = results.iter().map(|r| r.started).min();
    let last_completion = results.iter().map(|r| r.finished).max();
    let wall_clock = match (first_dispatch, last_completion) {
        (Some(start), Some(end)) => end.saturating_duration_since(start),
        _ => Duration::ZERO,
    };

    let successes: Vec<&RequestOutcome> = results.iter().filter(|r| r.succeeded()).collect();
    let total_completion_tokens: u64 = successes.iter().map(|r| r.completion_tokens).sum();
    let throughput_tokens_per_sec = if wall_clock.is_zero() {
        0.0
    } else {
        total_completion_tokens as f64 / wall_clock.as_secs_f64()
    };
    let mean_latency = if successes.is_empty() {
        None
    } else {
        Some(successes.iter().map(|r| r.latency).sum::<Duration>() / successes.len() as u32)
    };

    BenchmarkSummary {
        successes: successes.len(),
        failures: results.len() - successes.len(),
        total_completion_tokens,
        wall_clock,
        throughput_tokens_per_sec,
        mean_latency,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: usize, start_ms: u64, end_ms: u64, tokens: u64, error: Option<&str>, base: Instant) -> RequestOutcome {
        let started = base + Duration::from_millis(start_ms);
        let finished = base + Duration::from_millis(end_ms);
        RequestOutcome {
            index,
            completion_tokens: tokens,
            latency: finished - started,
            error: error.map(String::from),
            started,
            finished,
        }
    }

    #[test]
    fn test_throughput_counts_successes_over_full_span() {
        let base = Instant::now();
        let summary = summarize(vec![
            outcome(0, 0, 1000, 100, None, base),
            outcome(1, 10, 2000, 100, None, base),
            // failed request extends the span but contributes no tokens
            outcome(2, 5, 2000, 0, Some("500"), base),
        ]);

        assert_eq!(summary.successes, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.total_completion_tokens, 200);
        assert_eq!(summary.wall_clock, Duration::from_millis(2000));
        assert!((summary.throughput_tokens_per_sec - 100.0).abs() < 1e-9);
        assert_eq!(summary.mean_latency, Some(Duration::from_millis(1495)));
    }

    #[test]
    fn test_all_failed() {
        let base = Instant::now();
        let summary = summarize(vec![outcome(0, 0, 50, 0, Some("refused"), base)]);
        assert_eq!(summary.successes, 0);
        assert_eq!(summary.throughput_tokens_per_sec, 0.0);
        assert!(summary.mean_latency.is_none());
    }

    #[test]
    fn test_empty() {
        let summary = summarize(Vec::new());
        assert_eq!(summary.wall_clock, Duration::ZERO);
        assert!(summary.results.is_empty());
    }
}
