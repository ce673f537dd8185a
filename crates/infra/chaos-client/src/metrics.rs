use metrics::{Counter, Gauge, Histogram, counter};
use metrics_derive::Metrics;

/// Collected metrics for the chaos client.
#[derive(Metrics, Clone)]
#[metrics(scope = "chaos_client")]
pub struct Metrics {
    /// Submitted transactions that committed and delivered their event.
    #[metric(describe = "Submitted transactions that committed and delivered their event")]
    pub successful_submits: Counter,

    /// Submitted transactions that failed at any stage.
    #[metric(describe = "Submitted transactions that failed at any stage")]
    pub unsuccessful_submits: Counter,

    /// Evaluations that returned a result.
    #[metric(describe = "Evaluations that returned a result")]
    pub successful_evaluates: Counter,

    /// Evaluations that failed.
    #[metric(describe = "Evaluations that failed")]
    pub unsuccessful_evaluates: Counter,

    /// Transactions that committed but whose event never arrived in time.
    #[metric(describe = "Transactions whose completion event did not arrive before the timeout")]
    pub event_timeouts: Counter,

    /// Transactions committed with a non-zero validation code.
    #[metric(describe = "Transactions committed with a non-zero validation code")]
    pub validation_failures: Counter,

    /// Events that arrived with no registered listener.
    #[metric(describe = "Completion events that arrived with no registered listener")]
    pub unclaimed_events: Counter,

    /// Times the completion event subscription was (re)started.
    #[metric(describe = "Times the completion event subscription was started")]
    pub event_stream_starts: Counter,

    /// Times the driver backed off because the ledger was not reachable.
    #[metric(describe = "Backoffs taken because the ledger connection was not ready")]
    pub reconnect_backoffs: Counter,

    /// Times the driver backed off because the admission ceiling was reached.
    #[metric(describe = "Backoffs taken because the admission ceiling was reached")]
    pub admission_backoffs: Counter,

    /// Transactions currently in flight.
    #[metric(describe = "Transactions currently in flight")]
    pub in_flight: Gauge,

    /// Most recent health classification (0 working, 1 stalled, 2 allfailures).
    #[metric(describe = "Most recent health classification")]
    pub health_state: Gauge,

    /// Wall clock duration of a transaction from proposal to outcome.
    #[metric(describe = "Duration of a transaction from proposal to outcome in seconds")]
    pub transaction_duration: Histogram,
}

impl Metrics {
    /// Records a non-zero validation code by value.
    pub fn validation_code(&self, code: i32) {
        counter!("chaos_client.validation_codes", "code" => code.to_string()).increment(1);
    }
}
