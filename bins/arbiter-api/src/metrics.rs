// Prometheus metrics for the API process

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Jobs handed to the queue, by target kind (`submission`, `author_solution`)
    pub static ref JOBS_ENQUEUED: IntCounterVec = IntCounterVec::new(
        Opts::new("arbiter_jobs_enqueued_total", "Judging jobs enqueued"),
        &["kind"]
    )
    .expect("metric can be created");

    pub static ref ENQUEUE_FAILURES: IntCounter = IntCounter::new(
        "arbiter_enqueue_failures_total",
        "Record writes or enqueues that failed"
    )
    .expect("metric can be created");

    pub static ref REJECTED_REQUESTS: IntCounter = IntCounter::new(
        "arbiter_rejected_requests_total",
        "Requests rejected because they cannot be judged"
    )
    .expect("metric can be created");

    /// Pending jobs per language queue, sampled on every scrape
    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("arbiter_queue_depth", "Jobs waiting to be claimed"),
        &["language"]
    )
    .expect("metric can be created");
}

/// Register every collector with `REGISTRY`; safe to call more than once
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let collectors: [Box<dyn prometheus::core::Collector>; 4] = [
        Box::new(JOBS_ENQUEUED.clone()),
        Box::new(ENQUEUE_FAILURES.clone()),
        Box::new(REJECTED_REQUESTS.clone()),
        Box::new(QUEUE_DEPTH.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Current metrics in the Prometheus text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
