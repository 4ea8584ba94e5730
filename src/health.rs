use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.config();
    let gateway = state.gateway();
    let adapters = gateway.adapters();

    let status = if state.is_shutting_down() {
        "shutting_down"
    } else {
        "healthy"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
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
            "active_sessions": metrics.active_sessions
        },
        "adapters": {
            "transcription": adapters.transcriber.model_name(),
            "dialogue": adapters.dialogue.model_name(),
            "synthesis": adapters.synthesizer.model_name()
        },
        "credentials_missing": config.credential_warnings().len(),
        "memory": get_memory_info(),
        "system": get_system_status(config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let endpoint_stats: Vec<_> = metrics
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
        "sessions": {
            "active": metrics.active_sessions,
            "opened": metrics.sessions_opened,
            "rejected": metrics.sessions_rejected,
            "setup_failures": metrics.setup_failures,
            "failed": metrics.sessions_failed,
            "failures_by_stage": metrics.failures_by_stage,
            "client_closed": metrics.sessions_client_closed,
            "shut_down": metrics.sessions_shut_down,
            "turns_completed": metrics.turns_completed
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

/// Resident and virtual memory of this process, from `/proc` on Linux.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let kib = |field: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(field))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": kib("VmRSS:") * 1024,
                "virtual_memory_bytes": kib("VmSize:") * 1024,
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

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max_sessions = config.session.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active_sessions
    })
}
