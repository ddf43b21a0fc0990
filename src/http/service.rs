//! Request routing for the sidecar endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, instrument, warn};

use crate::error::ZonelimitError;
use crate::ratelimit::{BlockReply, DelayScheduler, RateLimiter, TokioDelay, Verdict};

pub type RespBody = BoxBody<Bytes, hyper::Error>;

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Body of `/check` and `/block` requests.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AttributesRequest {
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Handles sidecar requests against one shared [`RateLimiter`].
pub struct ZonelimitService {
    rate_limiter: Arc<RateLimiter>,
    scheduler: Arc<dyn DelayScheduler>,
}

impl ZonelimitService {
    /// Delayed requests wait on the tokio timer.
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self::with_scheduler(rate_limiter, Arc::new(TokioDelay))
    }

    pub fn with_scheduler(rate_limiter: Arc<RateLimiter>, scheduler: Arc<dyn DelayScheduler>) -> Self {
        Self {
            rate_limiter,
            scheduler,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Route one request.
    ///
    /// - `POST /check/{location}` judges the request attributes. A delayed
    ///   request is answered once the delay has elapsed; a refused one with
    ///   the location's status code.
    /// - `POST /block/{location}` runs the location's block-control action.
    /// - `GET /rate/{location}` reports the rate attribute.
    /// - `GET /health` always answers 200.
    #[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Response<RespBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if path == "/health" {
            return match method {
                Method::GET => json_response(StatusCode::OK, &json!({"status": "healthy"})),
                _ => method_not_allowed(),
            };
        }

        let Some((endpoint, location)) = split_path(&path) else {
            return not_found("no such endpoint");
        };

        match (endpoint, method) {
            ("check", Method::POST) => self.check(location, req).await,
            ("block", Method::POST) => self.block(location, req).await,
            ("rate", Method::GET) => self.rate(location),
            ("check" | "block" | "rate", _) => method_not_allowed(),
            _ => not_found("no such endpoint"),
        }
    }

    async fn check<B>(&self, name: &str, req: Request<B>) -> Response<RespBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let Some(location) = self.rate_limiter.location(name) else {
            return not_found("unknown location");
        };
        let body = match read_attributes(req).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        let verdict = self
            .rate_limiter
            .enforce(&location, &body.attributes, self.scheduler.as_ref())
            .await;
        debug!(location = %name, verdict = ?verdict, "Request checked");

        let status = match &verdict {
            Verdict::Reject { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
            }
            _ => StatusCode::OK,
        };
        json_response(status, &verdict)
    }

    async fn block<B>(&self, name: &str, req: Request<B>) -> Response<RespBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let Some(location) = self.rate_limiter.location(name) else {
            return not_found("unknown location");
        };
        let body = match read_attributes(req).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        match self.rate_limiter.block_control(&location, &body.attributes) {
            Ok(Some(reply)) => json_response(StatusCode::OK, &reply),
            Ok(None) => not_found("location has no block control"),
            Err(err @ ZonelimitError::Capacity { .. }) => {
                error!(location = %name, error = %err, "Block control failed");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &BlockReply::error(err.to_string()),
                )
            }
            Err(err) => {
                error!(location = %name, error = %err, "Block control failed");
                json_response(StatusCode::INTERNAL_SERVER_ERROR, &json!({"error": err.to_string()}))
            }
        }
    }

    fn rate(&self, name: &str) -> Response<RespBody> {
        let Some(location) = self.rate_limiter.location(name) else {
            return not_found("unknown location");
        };
        let rate = self.rate_limiter.rate_variable(&location);
        json_response(StatusCode::OK, &json!({"location": name, "rate": rate}))
    }
}

/// `/check/api` -> `("check", "api")`
fn split_path(path: &str) -> Option<(&str, &str)> {
    let (endpoint, location) = path.strip_prefix('/')?.split_once('/')?;
    if location.is_empty() || location.contains('/') {
        return None;
    }
    Some((endpoint, location))
}

async fn read_attributes<B>(req: Request<B>) -> Result<AttributesRequest, Response<RespBody>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "Failed to read request body");
            return Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large or unreadable",
            ));
        }
    };
    if bytes.is_empty() {
        return Ok(AttributesRequest::default());
    }
    serde_json::from_slice(&bytes).map_err(|err| {
        warn!(error = %err, "Malformed request body");
        error_response(StatusCode::BAD_REQUEST, &format!("malformed body: {err}"))
    })
}

fn full(bytes: impl Into<Bytes>) -> RespBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<RespBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            error!(error = %err, "Failed to serialize response");
            let mut response = Response::new(full("Internal Server Error"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<RespBody> {
    json_response(status, &json!({"error": message}))
}

fn not_found(message: &str) -> Response<RespBody> {
    error_response(StatusCode::NOT_FOUND, message)
}

fn method_not_allowed() -> Response<RespBody> {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, RulesConfig, Timestamp};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    const RULES: &str = r#"
zones:
  - {name: per_ip, size: 1m, rate: 10r/s, key: [remote_addr]}
defaults:
  status: 429
locations:
  api:
    rules:
      - {zone: per_ip, burst: 1}
  admin_set:
    block: {action: set, zone: per_ip, block_time: 60}
"#;

    #[derive(Default)]
    struct RecordingDelay {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl DelayScheduler for RecordingDelay {
        async fn delay(&self, delay: Duration) {
            self.delays.lock().push(delay);
        }
    }

    fn service() -> (ZonelimitService, Arc<RecordingDelay>) {
        let rules = RulesConfig::from_yaml(RULES).unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
        let limiter = Arc::new(RateLimiter::with_clock(&rules, clock).unwrap());
        let delays = Arc::new(RecordingDelay::default());
        let scheduler: Arc<dyn DelayScheduler> = delays.clone();
        (ZonelimitService::with_scheduler(limiter, scheduler), delays)
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<RespBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    const CLIENT: &str = r#"{"attributes": {"remote_addr": "10.0.0.1"}}"#;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/check/api"), Some(("check", "api")));
        assert_eq!(split_path("/check/"), None);
        assert_eq!(split_path("/check/a/b"), None);
        assert_eq!(split_path("/health"), None);
    }

    #[tokio::test]
    async fn test_health() {
        let (svc, _) = service();
        let response = svc.handle(request(Method::GET, "/health", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_check_pass_delay_reject() {
        let (svc, delays) = service();

        let response = svc.handle(request(Method::POST, "/check/api", CLIENT)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["verdict"], "pass");

        let response = svc.handle(request(Method::POST, "/check/api", CLIENT)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["verdict"], "delay");
        assert_eq!(json["delay_ms"], 100);
        assert_eq!(*delays.delays.lock(), vec![Duration::from_millis(100)]);

        let response = svc.handle(request(Method::POST, "/check/api", CLIENT)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response).await;
        assert_eq!(json["verdict"], "reject");
        assert_eq!(json["status"], 429);
    }

    #[tokio::test]
    async fn test_check_without_attributes_passes() {
        let (svc, _) = service();
        for _ in 0..5 {
            let response = svc.handle(request(Method::POST, "/check/api", "")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_check_unknown_location() {
        let (svc, _) = service();
        let response = svc.handle(request(Method::POST, "/check/nope", CLIENT)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_check_malformed_body() {
        let (svc, _) = service();
        let response = svc.handle(request(Method::POST, "/check/api", "{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_oversized_body() {
        let (svc, _) = service();
        let body = "x".repeat(MAX_BODY_BYTES + 1);
        let response = svc.handle(request(Method::POST, "/check/api", &body)).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_wrong_method() {
        let (svc, _) = service();
        let response = svc.handle(request(Method::GET, "/check/api", "")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_block_set_then_check_rejects() {
        let (svc, _) = service();

        let response = svc.handle(request(Method::POST, "/block/admin_set", CLIENT)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ret"], true);
        assert_eq!(json["block_stop_time"], 1_700_000_060u64);
        assert_eq!(json["block_time"], 60);

        let response = svc.handle(request(Method::POST, "/check/api", CLIENT)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_block_without_key() {
        let (svc, _) = service();
        let response = svc.handle(request(Method::POST, "/block/admin_set", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ret"], false);
        assert_eq!(json["errmsg"], "limit vars is empty");
    }

    #[tokio::test]
    async fn test_block_on_location_without_binding() {
        let (svc, _) = service();
        let response = svc.handle(request(Method::POST, "/block/api", CLIENT)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rate_endpoint() {
        let (svc, _) = service();
        let response = svc.handle(request(Method::GET, "/rate/api", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["location"], "api");
        assert!(json["rate"].is_null());
    }
}
