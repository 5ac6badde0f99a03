use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Proxy request duration in seconds, injected latency included. Tagged with outcome.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const CHAOS_INJECTED_FAILURE: MetricDef = MetricDef {
    name: "chaos.injected_failure",
    metric_type: MetricType::Counter,
    description: "Requests short-circuited by chaos. Tagged with status.",
};

pub const CHAOS_INJECTED_LATENCY: MetricDef = MetricDef {
    name: "chaos.injected_latency",
    metric_type: MetricType::Histogram,
    description: "Latency added by chaos in milliseconds",
};

pub const UPSTREAM_ERROR: MetricDef = MetricDef {
    name: "upstream.error",
    metric_type: MetricType::Counter,
    description: "Failed upstream round trips. Tagged with kind.",
};

pub const USAGE_RECORD_FAILED: MetricDef = MetricDef {
    name: "usage.record_failed",
    metric_type: MetricType::Counter,
    description: "Usage increments the store rejected",
};

pub const CONFIG_CACHE_HIT: MetricDef = MetricDef {
    name: "config_cache.hit",
    metric_type: MetricType::Counter,
    description: "Key lookups served from the routing config cache",
};

pub const CONFIG_CACHE_MISS: MetricDef = MetricDef {
    name: "config_cache.miss",
    metric_type: MetricType::Counter,
    description: "Key lookups that went to the backing store",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    CHAOS_INJECTED_FAILURE,
    CHAOS_INJECTED_LATENCY,
    UPSTREAM_ERROR,
    USAGE_RECORD_FAILED,
    CONFIG_CACHE_HIT,
    CONFIG_CACHE_MISS,
];
