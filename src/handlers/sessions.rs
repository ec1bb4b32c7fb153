//! # Chat Session Handlers
//!
//! ## Endpoints:
//! - `GET /api/v1/sessions` - summaries, most recently updated first
//! - `POST /api/v1/sessions` - create (`{ "title": "..." }` optional)
//! - `GET /api/v1/sessions/{id}` - full session with turns
//! - `DELETE /api/v1/sessions/{id}`
//! - `GET /api/v1/sessions/{id}/export` - Markdown transcript

use crate::error::AppError;
use crate::history::export_markdown;
use crate::state::AppState;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.history.list()?;
    Ok(HttpResponse::Ok().json(json!({ "sessions": sessions })))
}

pub async fn create_session(
    state: web::Data<AppState>,
    body: Option<web::Json<CreateSessionRequest>>,
) -> Result<HttpResponse, AppError> {
    let request = body.map(web::Json::into_inner).unwrap_or_default();
    let session = state.history.create(request.title)?;
    Ok(HttpResponse::Created().json(session))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session = state.history.get(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(session))
}

pub async fn delete_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    state.history.delete(&path.into_inner())?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn export_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session = state.history.get(&path.into_inner())?;
    let markdown = export_markdown(&session);

    Ok(HttpResponse::Ok()
        .content_type("text/markdown; charset=utf-8")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(format!("chat-{}.md", session.id))],
        })
        .body(markdown))
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::genai::Role;
    use crate::handlers::configure_api;
    use crate::history::ChatTurn;
    use crate::state::test_support::temp_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};
    use serde_json::json;

    #[actix_web::test]
    async fn test_session_crud_and_export() {
        let (_dir, state) = temp_state(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_api),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/sessions")
            .set_json(json!({ "title": "Recipes" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: serde_json::Value = test::read_body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_string();

        state
            .history
            .append_turns(&id, vec![ChatTurn::new(Role::User, "Pancakes?", Vec::new())])
            .unwrap();

        let req = test::TestRequest::get().uri("/api/v1/sessions").to_request();
        let list: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(list["sessions"][0]["id"], id.as_str());
        assert_eq!(list["sessions"][0]["turn_count"], 1);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/sessions/{}/export", id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("# Recipes"));
        assert!(text.contains("Pancakes?"));

        let req = test::TestRequest::delete()
            .uri(&format!("/api/v1/sessions/{}", id))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/sessions/{}", id))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_create_without_body_uses_default_title() {
        let (_dir, state) = temp_state(AppConfig::default());
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(configure_api)).await;

        let req = test::TestRequest::post().uri("/api/v1/sessions").to_request();
        let created: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(created["title"], "New chat");
    }
}
