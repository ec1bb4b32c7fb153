use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config.public_view()
    })))
}

/// Partial update. Host and port changes only take effect on restart.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let current_config = state
        .apply_config_update(&json_str)
        .map_err(AppError::ValidationError)?;

    info!(
        api_key_configured = current_config.api_key_configured(),
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config.public_view()
    })))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::handlers::configure_api;
    use crate::state::test_support::temp_state;
    use actix_web::{test, web, App};
    use serde_json::json;

    #[actix_web::test]
    async fn test_update_applies_and_hides_key() {
        let (_dir, state) = temp_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_api),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({ "genai": { "api_key": "new-secret", "voice_name": "Kore" } }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "success");
        assert_eq!(body["updated_config"]["genai"]["voice_name"], "Kore");
        assert_eq!(body["updated_config"]["genai"]["api_key_configured"], true);
        assert!(!body.to_string().contains("new-secret"));
        assert!(state.genai_client().is_configured());

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["genai"]["voice_name"], "Kore");
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let (_dir, state) = temp_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_api),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({ "audio": { "output_channels": 0 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().audio.output_channels, 1);
    }
}
