use std::sync::Arc;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::*;
use warp::http::{header::CONTENT_TYPE, StatusCode};
use warp::{reply, Filter, Rejection, Reply};

use crate::mutate::Mutator;
use crate::review::AdmissionResponse;
use crate::Result;

/// Prometheus collectors owned by the webhook process
pub struct Metrics {
    registry: Registry,
    requests: HistogramVec,
    mutations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Latency of admission requests by response code, method and path",
            ),
            &["code", "method", "path"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let mutations = IntCounterVec::new(
            Opts::new(
                "irsa_webhook_mutations_total",
                "Admission reviews handled by resource kind and outcome",
            ),
            &["resource", "outcome"],
        )?;
        registry.register(Box::new(mutations.clone()))?;

        Ok(Metrics {
            registry,
            requests,
            mutations,
        })
    }

    /// Record one finished HTTP request
    pub fn observe(&self, info: &warp::log::Info<'_>) {
        self.requests
            .with_label_values(&[
                info.status().as_str(),
                info.method().as_str(),
                info.path(),
            ])
            .observe(info.elapsed().as_secs_f64());
    }

    /// Record the outcome of one admission review
    pub fn record_review(&self, mutator: Option<Mutator>, response: &AdmissionResponse) {
        let resource = mutator.map(Mutator::kind).unwrap_or("unknown");
        let outcome = if response.patch.is_some() {
            "patched"
        } else if response.allowed {
            "unchanged"
        } else {
            "error"
        };
        self.mutations.with_label_values(&[resource, outcome]).inc();
    }

    /// Text exposition of every registered collector
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }

    fn exposition(&self) -> reply::Response {
        match self.render() {
            Ok(body) => reply::with_header(body, CONTENT_TYPE, TextEncoder::new().format_type())
                .into_response(),
            Err(err) => {
                error!(error = %err, "could not encode metrics");
                reply::with_status(err.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
            }
        }
    }
}

/// `GET /metrics` and `GET /healthz`, served over plain HTTP
pub fn routes(
    metrics: Arc<Metrics>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let healthz = warp::path("healthz")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| "ok");

    let exposition = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || metrics.exposition());

    healthz.or(exposition)
}
