use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    request_counter: IntCounterVec,
    detection_duration: HistogramVec,
    detected_items: IntCounter,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_counter = IntCounterVec::new(
            Opts::new("requests_total", "Total number of requests"),
            &["route", "status"],
        )?;

        let detection_duration = HistogramVec::new(
            HistogramOpts::new(
                "detection_duration_ms",
                "Duration of detection operations in milliseconds",
            )
            .buckets(generate_boundaries((50, 250, 1000, 5000, 20000))),
            &["route"],
        )?;

        let detected_items = IntCounter::new(
            "detected_items_total",
            "Total number of food items returned",
        )?;

        registry.register(Box::new(request_counter.clone()))?;
        registry.register(Box::new(detection_duration.clone()))?;
        registry.register(Box::new(detected_items.clone()))?;

        Ok(Metrics {
            request_counter,
            detection_duration,
            detected_items,
            registry,
        })
    }

    pub fn record_request(&self, route: &str, status: u16) {
        let status = status.to_string();
        self.request_counter
            .with_label_values(&[route, status.as_str()])
            .inc();
    }

    pub fn record_detection_duration(&self, duration_ms: u64, route: &str) {
        self.detection_duration
            .with_label_values(&[route])
            .observe(duration_ms as f64);
    }

    pub fn record_detected_items(&self, count: usize) {
        self.detected_items.inc_by(count as u64);
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Histogram buckets with a finer step where most detections land.
fn generate_boundaries(parts: (u64, u64, u64, u64, u64)) -> Vec<f64> {
    let mut boundaries: Vec<u64> = (parts.0..=parts.1)
        .step_by(50)
        .chain((parts.1..=parts.2).step_by(125))
        .chain((parts.2..=parts.3).step_by(1000))
        .chain((parts.3..=parts.4).step_by(5000))
        .collect();
    boundaries.dedup();
    boundaries.into_iter().map(|x| x as f64).collect()
}
