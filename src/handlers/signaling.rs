//! Signaling endpoint: SDP offer/answer exchange and session bookkeeping.

use crate::{
    error::{AppError, AppResult, PipelineError},
    models::SessionOffer,
    state::AppState,
};
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::{debug, info};

pub const WORKER_TYPE: &str = "RTCSignalingServer";
pub const OFFER_PATH: &str = "/api/v1/RTCSignalingServer/offer";

/// `POST /api/v1/RTCSignalingServer/offer`
pub async fn offer(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<SessionOffer>,
) -> AppResult<HttpResponse> {
    state.sessions.cleanup_sessions().await;

    let offer = body.into_inner();
    debug!(offer_sdp = %offer.sdp, "Offer received");
    let answer = match state
        .sessions
        .create_session(offer, state.session_context(), state.max_sessions())
        .await
    {
        Ok(answer) => answer,
        Err(e @ PipelineError::SessionLimit(_)) => return Err(e.into()),
        Err(e) => {
            state.record_session_failed();
            return Err(e.into());
        }
    };
    state.record_session_created();

    info!(
        session_id = %answer.session_id,
        client = %req.connection_info().realip_remote_addr().unwrap_or("unknown"),
        "Session answered"
    );
    debug!(answer_sdp = %answer.sdp, "Answer sent");
    Ok(HttpResponse::Ok().json(answer))
}

/// `GET /api/v1/RTCSignalingServer/cleanup`
pub async fn cleanup(state: web::Data<AppState>) -> HttpResponse {
    let running = state.sessions.cleanup_sessions().await;
    HttpResponse::Ok().json(json!({ "status": true, "running": running }))
}

/// `GET /api/v1/RTCSignalingServer/config.json`: what the browser needs to build its
/// own peer connection.
pub async fn client_config(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let ice_servers: Vec<serde_json::Value> = config
        .webrtc
        .ice_servers
        .iter()
        .map(|server| {
            json!({
                "urls": server.urls,
                "username": server.username,
                "credential": server.credential
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "offerURL": OFFER_PATH,
        "iceServers": ice_servers
    }))
}

/// `GET /api/v1/statuses`: load report polled by the service registry.
pub async fn statuses(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    if state.over_session_limit() {
        return Err(AppError::TooManyRequests("Too many requests.".into()));
    }
    Ok(HttpResponse::Ok().json(json!({
        "worker_type": WORKER_TYPE,
        "sessions": state.sessions.session_count()
    })))
}
