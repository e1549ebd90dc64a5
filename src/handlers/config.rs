use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Read-only view of the running configuration.
///
/// Secrets forwarded to the voice process (database credentials, proxy
/// endpoint) are reported only as set or unset.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "auth": {
                "region": config.auth.region,
                "user_pool_id": config.auth.user_pool_id,
                "client_id": config.auth.client_id,
                "identity_pool_id": config.auth.identity_pool_id,
                "issuer": config.auth.issuer()
            },
            "voice": {
                "command": config.voice.command,
                "fallback_command": config.voice.fallback_command,
                "args": config.voice.args,
                "working_dir": config.voice.working_dir,
                "callback_url": config.voice.callback_url,
                "db_credentials_set": !config.voice.db_credentials.is_empty(),
                "proxy_endpoint_set": !config.voice.proxy_endpoint.is_empty()
            },
            "playback": {
                "lead_time_secs": config.playback.lead_time_secs,
                "max_queue_secs": config.playback.max_queue_secs,
                "sample_rate": config.playback.sample_rate
            },
            "performance": {
                "max_concurrent_sessions": config.performance.max_concurrent_sessions
            }
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::testing::test_state;
    use actix_web::test::{call_and_read_body_json, init_service, TestRequest};
    use actix_web::App;

    #[actix_web::test]
    async fn test_config_hides_secrets() {
        let mut config = AppConfig::default();
        config.voice.db_credentials = "postgres://tutor:hunter2@db".to_string();
        let app = init_service(
            App::new()
                .app_data(web::Data::new(test_state(config, false)))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["voice"]["command"], "python3");
        assert_eq!(body["config"]["voice"]["db_credentials_set"], true);
        assert_eq!(body["config"]["voice"]["proxy_endpoint_set"], false);
        assert!(!body.to_string().contains("hunter2"));
    }
}
