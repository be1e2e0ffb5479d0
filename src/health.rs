use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let memory_info = get_memory_info();
    let system_status = get_system_status(config, &metrics);
    let reference = state.analyzer.reference();

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
            "active_sessions": metrics.active_sessions,
            "chunks_received": metrics.chunks_received,
            "chunks_skipped": metrics.chunks_skipped,
            "events_delivered": metrics.events_delivered,
            "events_failed": metrics.events_failed,
            "delivery_rate": metrics.delivery_rate()
        },
        "memory": memory_info,
        "pipeline": {
            "format": state.analyzer.format(),
            "reference": {
                "path": config.pipeline.reference_path,
                "samples": reference.waveform().len(),
                "duration_seconds": state.analyzer.format().duration_seconds(reference.waveform().len())
            },
            "queue": state.publisher.queue()
        },
        "system": system_status
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "active": metrics.active_sessions,
            "completed": metrics.sessions_completed
        },
        "chunks": {
            "received": metrics.chunks_received,
            "dropped": metrics.chunks_dropped,
            "analyzed": metrics.chunks_analyzed,
            "skipped": metrics.chunks_skipped,
            "skip_rate": metrics.skip_rate(),
            "chunks_per_second": if uptime_seconds > 0 {
                metrics.chunks_received as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "events": {
            "delivered": metrics.events_delivered,
            "failed": metrics.events_failed,
            "delivery_rate": metrics.delivery_rate()
        },
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "idle_workers": state.idle_workers(),
            "session_buffer_chunks": config.performance.session_buffer_chunks,
            "max_chunk_bytes": config.performance.max_chunk_bytes
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
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

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let worker_usage = if config.performance.max_concurrent_sessions > 0 {
        metrics.active_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if worker_usage >= 1.0 {
        "saturated"
    } else if worker_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    let mut warnings = Vec::new();
    if worker_usage > 0.8 {
        warnings.push("High worker usage - new sessions may wait for a free worker");
    }
    if metrics.chunks_dropped > 0 {
        warnings.push("Chunks dropped - sensors are sending faster than sessions analyze");
    }

    json!({
        "status": status,
        "worker_usage_percent": (worker_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": warnings
    })
}
