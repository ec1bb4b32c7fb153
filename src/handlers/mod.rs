pub mod chat;
pub mod config;
pub mod sessions;
pub mod tts;

pub use chat::*;
pub use config::*;
pub use sessions::*;
pub use tts::*;

use crate::health;
use actix_web::web;

/// REST routes under `/api/v1`, plus `/health` at the root for probes.
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(get_config))
            .route("/config", web::put().to(update_config))
            .route("/chat", web::post().to(chat))
            .route("/chat/upload", web::post().to(chat_upload))
            .route("/tts", web::post().to(synthesize))
            .route("/sessions", web::get().to(list_sessions))
            .route("/sessions", web::post().to(create_session))
            .route("/sessions/{id}", web::get().to(get_session))
            .route("/sessions/{id}", web::delete().to(delete_session))
            .route("/sessions/{id}/export", web::get().to(export_session)),
    )
    .route("/health", web::get().to(health::health_check));
}
