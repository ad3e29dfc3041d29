use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let breaker = state.breaker.snapshot();
    let active_calls = state.registry.active_count();

    let memory_info = get_memory_info();
    let system_status = get_system_status(
        active_calls,
        config.performance.max_concurrent_calls,
        breaker.state,
    );

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "call-bridge-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_calls": active_calls,
            "calls_started": metrics.calls_started,
            "calls_fallen_back": metrics.calls_fallen_back
        },
        "circuit_breaker": {
            "state": breaker.state.as_str(),
            "total_failures": breaker.total_failures
        },
        "memory": memory_info,
        "system": system_status
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let breaker = state.breaker.snapshot();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    let failures_by_category: serde_json::Map<String, serde_json::Value> = breaker
        .failures_by_category
        .iter()
        .map(|(category, count)| (category.to_string(), json!(count)))
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "calls": {
            "active": state.registry.active_count(),
            "active_call_ids": state.registry.active_ids(),
            "started": metrics.calls_started,
            "completed": metrics.calls_completed,
            "fallen_back": metrics.calls_fallen_back,
            "reconnect_attempts": metrics.reconnect_attempts
        },
        "circuit_breaker": {
            "state": breaker.state.as_str(),
            "total_failures": breaker.total_failures,
            "failures_by_category": failures_by_category
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_calls": state.get_config().performance.max_concurrent_calls
        }
    }))
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
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(
    active_calls: usize,
    max_calls: usize,
    breaker_state: crate::resilience::circuit::BreakerState,
) -> serde_json::Value {
    use crate::resilience::circuit::BreakerState;

    let call_usage = if max_calls > 0 {
        active_calls as f64 / max_calls as f64
    } else {
        0.0
    };

    let status = if breaker_state != BreakerState::Closed {
        "degraded"
    } else if call_usage > 0.9 {
        "high_load"
    } else if call_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (call_usage * 100.0).round(),
        "max_calls": max_calls,
        "current_calls": active_calls,
        "load_warnings": if call_usage > 0.8 {
            vec!["High call volume - consider increasing max_concurrent_calls"]
        } else if breaker_state != BreakerState::Closed {
            vec!["AI provider failing - new calls are routed to conference fallback"]
        } else {
            vec![]
        }
    })
}
