//! Metrics collection module for the matching core
//!
//! Prometheus collectors for engine calls, settled trades and retried
//! transactions. `server.rs` exposes the registry over HTTP.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Engine calls, by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "engine calls"), &["method"]).unwrap();

    /// Failed engine calls, by method and error code
    pub static ref ERR_COUNTER_VEC: CounterVec = CounterVec::new(
        Opts::new("request_error_counter", "failed engine calls"),
        &["method", "code"]
    )
    .unwrap();

    /// Wall time of engine calls, retries and backoff included
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "engine call latency in seconds"),
        &["method"]
    )
    .unwrap();

    /// Trades settled, by matching policy ("immediate" or "batch")
    pub static ref TRADE_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("trade_counter", "settled trades"), &["policy"]).unwrap();

    /// Transactions replayed after a deadlock, lock wait timeout or lost connection
    pub static ref RETRY_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("retry_counter", "retried transactions"), &["method"]).unwrap();
}

/// Registers the collectors above. Safe to call more than once.
pub fn init_registry() {
    for collector in [
        REQ_COUNTER_VEC.clone(),
        ERR_COUNTER_VEC.clone(),
        TRADE_COUNTER_VEC.clone(),
        RETRY_COUNTER_VEC.clone(),
    ] {
        let _ = REGISTRY_INSTANCE.register(Box::new(collector));
    }
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
}

/// Something that can label a failed request.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

impl ErrorCode for crate::error::ExchangeError {
    fn code(&self) -> &'static str {
        crate::error::ExchangeError::code(self)
    }
}

/// Counts and times one engine call. A failed call is also counted under
/// its error code.
pub async fn record_metrics<F, Fut, T, E>(method_name: &'static str, handler: F) -> Result<T, E>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T, E>> + Send,
    E: ErrorCode,
{
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let started = Instant::now();
    let result = handler().await;
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        ERR_COUNTER_VEC
            .with_label_values(&[method_name, e.code()])
            .inc();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;

    #[tokio::test]
    async fn failures_are_counted_by_code() {
        let before = ERR_COUNTER_VEC
            .with_label_values(&["metrics_test", "forbidden"])
            .get();
        let result: Result<(), ExchangeError> = record_metrics("metrics_test", || async {
            Err(ExchangeError::Forbidden("x".to_string()))
        })
        .await;
        assert!(result.is_err());
        let after = ERR_COUNTER_VEC
            .with_label_values(&["metrics_test", "forbidden"])
            .get();
        assert_eq!(after - before, 1.0);
        assert!(REQ_COUNTER_VEC.with_label_values(&["metrics_test"]).get() >= 1.0);
    }
}
