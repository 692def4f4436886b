use crate::config::AppConfig;
use crate::relay::session::RegistrySummary;
use crate::relay::upstream::endpoint_host;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let http = state.http_snapshot();
    let sessions = state.sessions.summary();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "upstream": upstream_status(config),
        "metrics": {
            "total_requests": http.request_count,
            "total_errors": http.error_count,
            "error_rate": http.error_rate(),
            "active_sessions": state.sessions.active_count(),
            "session_slots_free": state.sessions.max_sessions().saturating_sub(state.sessions.active_count())
        },
        "memory": get_memory_info(),
        "system": get_system_status(&sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let http = state.http_snapshot();
    let sessions = state.sessions.summary();
    let uptime_seconds = state.uptime_seconds();

    let active: Vec<_> = state
        .sessions
        .sessions()
        .iter()
        .map(|session| {
            let traffic = session.stats().snapshot();
            json!({
                "id": session.id,
                "peer": session.peer,
                "status": session.status().as_str(),
                "created_at": session.created_at.to_rfc3339(),
                "opened_at": session.opened_at().map(|t| t.to_rfc3339()),
                "frames_up": traffic.frames_up,
                "frames_down": traffic.frames_down
            })
        })
        .collect();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in http.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": http.request_count,
            "total_errors": http.error_count,
            "error_rate": http.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                http.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "sessions": {
            "active": sessions.active_sessions,
            "max_concurrent": sessions.max_sessions,
            "by_status": sessions.status_counts,
            "started": sessions.sessions_started,
            "completed": sessions.sessions_completed,
            "failed": sessions.sessions_failed,
            "rejected": sessions.sessions_rejected,
            "live": active
        },
        "relay": {
            "frames_up": sessions.traffic.frames_up,
            "bytes_up": sessions.traffic.bytes_up,
            "frames_down": sessions.traffic.frames_down,
            "bytes_down": sessions.traffic.bytes_down
        },
        "memory": get_memory_info()
    }))
}

/// Whether sessions can be opened at all. The URL itself is never shown since
/// the credential travels in its query string.
fn upstream_status(config: &AppConfig) -> serde_json::Value {
    json!({
        "credential_configured": config.has_credential(),
        "host": endpoint_host(&config.upstream),
        "model": config.upstream.setup.model,
        "setup_enabled": config.upstream.setup.enabled,
        "ready": config.has_credential()
    })
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    vm_rss = parse_kb(line);
                } else if line.starts_with("VmSize:") {
                    vm_size = parse_kb(line);
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "pid": pid,
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// Bytes from a `/proc/<pid>/status` line such as `VmRSS:  1234 kB`.
fn parse_kb(line: &str) -> u64 {
    line.split_whitespace()
        .nth(1)
        .and_then(|kb| kb.parse::<u64>().ok())
        .unwrap_or(0)
        * 1024
}

fn get_system_status(sessions: &RegistrySummary) -> serde_json::Value {
    let session_usage = if sessions.max_sessions > 0 {
        sessions.active_sessions as f64 / sessions.max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": sessions.max_sessions,
        "current_sessions": sessions.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing relay.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
