//! Access log for the signaling service.
//!
//! Registry polls (`/health`, `/statuses`, `/metrics`) arrive every few seconds, so
//! their successes only show up at debug level. Offers and config changes are logged
//! at info, admission rejections and client errors at warn, server errors at error.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, StatusCode},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

const POLL_SUFFIXES: [&str; 3] = ["/health", "/statuses", "/metrics"];

/// How loudly a finished request is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Poll,
    Served,
    Rejected,
    ClientError,
    ServerError,
}

impl Outcome {
    fn classify(path: &str, status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            Outcome::Rejected
        } else if status.is_server_error() {
            Outcome::ServerError
        } else if status.is_client_error() {
            Outcome::ClientError
        } else if POLL_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
            Outcome::Poll
        } else {
            Outcome::Served
        }
    }
}

/// Who asked for what; captured before the request is handed on.
struct RequestSummary {
    method: String,
    path: String,
    peer: String,
    user_agent: String,
}

impl RequestSummary {
    fn of(req: &ServiceRequest) -> Self {
        Self {
            method: req.method().to_string(),
            path: req.path().to_string(),
            peer: req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string(),
            user_agent: req
                .headers()
                .get(header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-")
                .to_string(),
        }
    }

    fn finished(&self, status: StatusCode, elapsed: Duration) {
        let (method, path, peer) = (self.method.as_str(), self.path.as_str(), self.peer.as_str());
        let status_code = status.as_u16();
        let duration_ms = elapsed.as_millis() as u64;
        match Outcome::classify(path, status) {
            Outcome::Poll => debug!(method, path, status_code, duration_ms, "Poll answered"),
            Outcome::Served => info!(method, path, peer, status_code, duration_ms, "Request served"),
            Outcome::Rejected => warn!(method, path, peer, duration_ms, "Rejected, session limit reached"),
            Outcome::ClientError => warn!(
                method,
                path,
                peer,
                user_agent = %self.user_agent,
                status_code,
                duration_ms,
                "Client error"
            ),
            Outcome::ServerError => error!(method, path, peer, status_code, duration_ms, "Server error"),
        }
    }
}

/// Logs every request once it has an outcome.
pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let summary = RequestSummary::of(&req);
        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            match &result {
                Ok(response) => summary.finished(response.status(), started.elapsed()),
                Err(err) => error!(
                    method = %summary.method,
                    path = %summary.path,
                    peer = %summary.peer,
                    error = %err,
                    "Request failed before a response was built"
                ),
            }
            result
        })
    }
}
