use std::sync::Arc;

use tracing::*;
use warp::http::{header::CONTENT_TYPE, StatusCode};
use warp::hyper::body::Bytes;
use warp::{reply, Filter, Rejection, Reply};

use crate::metrics::Metrics;
use crate::mutate;
use crate::placeholder::Modifier;
use crate::review::{self, AdmissionResponse, Review, ReviewResponse, StatusReason};

pub const INVALID_CONTENT_TYPE: &str = "Invalid Content-Type, expected `application/json`\n";
pub const MISSING_REQUEST_MESSAGE: &str = "Could not read request resource.";

/// `POST /mutate` handler state, cheap to clone per request
#[derive(Clone)]
pub struct Webhook {
    modifier: Arc<Modifier>,
    metrics: Arc<Metrics>,
}

impl Webhook {
    pub fn new(modifier: Arc<Modifier>, metrics: Arc<Metrics>) -> Self {
        Webhook { modifier, metrics }
    }

    /// Answer one HTTP request carrying an admission review
    pub fn handle(&self, content_type: Option<&str>, body: &[u8]) -> reply::Response {
        if content_type != Some("application/json") {
            error!(
                content_type = content_type.unwrap_or_default(),
                "expected application/json"
            );
            return reply::with_status(INVALID_CONTENT_TYPE, StatusCode::UNSUPPORTED_MEDIA_TYPE)
                .into_response();
        }

        trace!(payload = %String::from_utf8_lossy(body), "webhook request");
        let review = self.review(body);

        match serde_json::to_vec(&review) {
            Ok(payload) => {
                trace!(payload = %String::from_utf8_lossy(&payload), "webhook response");
                reply::with_header(payload, CONTENT_TYPE, "application/json").into_response()
            }
            Err(err) => {
                error!(error = %err, "can't encode response");
                reply::with_status(
                    format!("could not encode response: {err}"),
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
                .into_response()
            }
        }
    }

    /// Decode the inbound envelope, route it, and wrap the result in an outbound envelope
    pub fn review(&self, body: &[u8]) -> ReviewResponse {
        // an empty body carries no review at all, which is not a decode failure
        let inbound = if body.is_empty() {
            None
        } else {
            match serde_json::from_slice::<Review>(body) {
                Ok(review) => Some(review),
                Err(err) => {
                    error!(error = %err, "can't decode body");
                    let response = AdmissionResponse::failed(StatusReason::BadRequest, err);
                    self.metrics.record_review(None, &response);
                    return ReviewResponse::with_response(response);
                }
            }
        };

        let Some(req) = inbound.as_ref().and_then(|r| r.request.as_ref()) else {
            warn!("admission review without a request");
            let response = AdmissionResponse::failed(StatusReason::BadRequest, MISSING_REQUEST_MESSAGE);
            self.metrics.record_review(None, &response);
            return ReviewResponse::with_response(response);
        };

        let (mutator, mut response) = mutate::route(inbound.as_ref(), &self.modifier);
        self.metrics.record_review(mutator, &response);
        info!(
            uid = %req.uid,
            resource = %review::resource_path(&req.resource),
            operation = ?req.operation,
            patched = response.patch.is_some(),
            "reviewed"
        );

        response.uid = req.uid.clone();
        ReviewResponse::with_response(response)
    }
}

/// The admission route, instrumented and traced
pub fn routes(webhook: Webhook) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let metrics = webhook.metrics.clone();

    // An unreadable body is reviewed as an empty one
    let body = warp::body::bytes()
        .or(warp::any().map(Bytes::new))
        .unify();

    warp::path("mutate")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::header::optional::<String>("content-type"))
        .and(body)
        .map(move |content_type: Option<String>, body: Bytes| {
            webhook.handle(content_type.as_deref(), &body)
        })
        .with(warp::log::custom(move |info| metrics.observe(&info)))
        .with(warp::trace::request())
}
