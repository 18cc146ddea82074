use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec, register_gauge,
    register_histogram,
};


lazy_static! {
    pub static ref THROTTLE_DECISIONS: CounterVec = register_counter_vec!(
        "throttle_decisions_total",
        "Throttle decisions by scope and outcome",
        &["scope", "outcome"]
    )
    .unwrap();
    pub static ref THROTTLE_DENIED: CounterVec = register_counter_vec!(
        "throttle_denied_total",
        "Denied requests by scope",
        &["scope"]
    )
    .unwrap();
    pub static ref STORE_ERRORS: Counter =
        register_counter!("throttle_store_errors_total", "Counting store failures and timeouts").unwrap();
    pub static ref CHECK_LATENCY: Histogram = register_histogram!(
        "throttle_check_latency_seconds",
        "Latency of check_and_record in seconds"
    )
    .unwrap();
    pub static ref TRACKED_KEYS: Gauge =
        register_gauge!("throttle_tracked_keys", "Current number of live throttle records").unwrap();
    pub static ref PROXIED_REQUESTS: Counter =
        register_counter!("throttle_proxied_requests_total", "Requests forwarded upstream").unwrap();
}
