use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn config_json(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "webrtc": {
            "max_sessions": config.webrtc.max_sessions,
            // Credentials stay on the server side of this endpoint
            "ice_servers": config.webrtc.ice_servers.iter().map(|s| &s.urls).collect::<Vec<_>>()
        },
        "workers": {
            "fallback_host": config.workers.fallback_host,
            "fallback_port": config.workers.fallback_port,
            "connect_timeout_ms": config.workers.connect_timeout_ms
        },
        "pipeline": {
            "frame_buffer_capacity": config.pipeline.frame_buffer_capacity,
            "stage_queue_capacity": config.pipeline.stage_queue_capacity,
            "receive_timeout_ms": config.pipeline.receive_timeout_ms,
            "join_timeout_secs": config.pipeline.join_timeout_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_json(&config)
    })))
}

/// Partial update of the `webrtc` section. New values apply to sessions created afterwards.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(current_config.clone()).map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_json(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test as http_test, App};

    #[actix_web::test]
    async fn test_update_max_sessions() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = http_test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = http_test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "webrtc": { "max_sessions": 3 } }))
            .to_request();
        let body: serde_json::Value = http_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["updated_config"]["webrtc"]["max_sessions"], 3);
        assert_eq!(state.max_sessions(), 3);

        let req = http_test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "webrtc": { "ice_servers": [{ "urls": "http://nope" }] } }))
            .to_request();
        let resp = http_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().webrtc.ice_servers.len(), 1);
    }
}
