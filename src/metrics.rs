use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &[],
    ).unwrap();
    // Cache lookups by result (hit, miss, in_progress)
    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_lookups", "The number of materialization cache lookups"),
        &["result"]
    ).unwrap();
    // Finished builds by outcome (ready, failure kind)
    pub static ref BUILDS: IntCounterVec = IntCounterVec::new(
        Opts::new("builds", "The number of builds that reached a terminal state"),
        &["outcome"]
    ).unwrap();
    // Fetch attempts retried after a transient error
    pub static ref FETCH_RETRIES: IntCounter = IntCounter::new(
        "fetch_retries", "The number of source reads retried after a transient error"
    ).unwrap();
    // Chunks appended to staging data files
    pub static ref CHUNKS_WRITTEN: IntCounter = IntCounter::new(
        "chunks_written", "The number of chunks written by builds"
    ).unwrap();
    // Cache entries removed by the sweeper
    pub static ref EVICTIONS: IntCounter = IntCounter::new(
        "evictions", "The number of cache entries evicted"
    ).unwrap();
    // Builds currently held by workers
    pub static ref ACTIVE_BUILDS: IntGauge = IntGauge::new(
        "active_builds", "The number of builds currently held by workers"
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .unwrap();
    REGISTRY.register(Box::new(CACHE_LOOKUPS.clone())).unwrap();
    REGISTRY.register(Box::new(BUILDS.clone())).unwrap();
    REGISTRY.register(Box::new(FETCH_RETRIES.clone())).unwrap();
    REGISTRY.register(Box::new(CHUNKS_WRITTEN.clone())).unwrap();
    REGISTRY.register(Box::new(EVICTIONS.clone())).unwrap();
    REGISTRY.register(Box::new(ACTIVE_BUILDS.clone())).unwrap();
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("failed to encode metrics: {}", err);
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}
