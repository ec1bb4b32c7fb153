//! Health and metrics endpoints.

use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "connected_clients": metrics.connected_clients
        },
        "remote": {
            "api_key_configured": config.api_key_configured(),
            "text_model": config.genai.text_model,
            "live_model": config.live.model
        },
        "live": live_status(&config, &metrics),
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "live": {
            "connected_clients": metrics.connected_clients,
            "active_sessions": metrics.active_live_sessions,
            "sessions_started": metrics.live_sessions_started,
            "sessions_rejected": metrics.live_sessions_rejected,
            "max_concurrent_sessions": state.get_config().performance.max_concurrent_sessions
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn live_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let limit = config.performance.max_concurrent_sessions;
    let usage = if limit > 0 {
        metrics.active_live_sessions as f64 / limit as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "at_capacity"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "active_sessions": metrics.active_live_sessions,
        "max_sessions": limit,
        "session_usage_percent": (usage * 100.0).round()
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::temp_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_live_capacity() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let (_dir, state) = temp_state(config);
        assert!(state.try_acquire_live_session());

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["live"]["status"], "at_capacity");
        assert_eq!(body["live"]["active_sessions"], 1);
        assert_eq!(body["remote"]["api_key_configured"], false);
    }

    #[actix_web::test]
    async fn test_metrics_lists_live_counters() {
        let (_dir, state) = temp_state(AppConfig::default());
        state.record_endpoint_request("GET /health", 5, false);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["endpoints"][0]["endpoint"], "GET /health");
        assert_eq!(body["live"]["active_sessions"], 0);
    }
}
