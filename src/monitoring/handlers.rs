//! HTTP handlers for the reporting facade
//!
//! Endpoints:
//! - GET /perf/report  - Full aggregated statistics (JSON)
//! - GET /perf/health  - Lightweight health signal for cheap polling
//! - GET /perf/metrics - Prometheus format metrics

use actix_web::{web, HttpResponse, Result as ActixResult};

use super::{build_report, health_signal};
use crate::context::PerfContext;

/// Full report: pool, queue and cache statistics plus operator
/// recommendations, one JSON document.
pub async fn report_handler(ctx: web::Data<PerfContext>) -> ActixResult<HttpResponse> {
    let report = build_report(&ctx.pool, &ctx.queues, &ctx.cache);
    Ok(HttpResponse::Ok().json(report))
}

/// Cheap health poll: 200/503 plus a few headers, no full aggregation.
pub async fn health_handler(ctx: web::Data<PerfContext>) -> ActixResult<HttpResponse> {
    let signal = health_signal(&ctx.pool, &ctx.queues, &ctx.cache);
    let status = if signal.healthy {
        actix_web::http::StatusCode::OK
    } else {
        actix_web::http::StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(HttpResponse::build(status)
        .insert_header(("X-Cache-Hit-Rate", format!("{:.1}", signal.cache_hit_rate_pct)))
        .insert_header(("X-Active-Requests", signal.active_requests.to_string()))
        .insert_header(("X-High-Load", signal.high_load.to_string()))
        .json(signal))
}

/// Metrics endpoint (Prometheus text format)
pub async fn metrics_handler(_ctx: web::Data<PerfContext>) -> ActixResult<HttpResponse> {
    let metrics_text = super::metrics::export_prometheus();
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(metrics_text))
}

/// Register reporting routes
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/perf")
            .route("/report", web::get().to(report_handler))
            .route("/health", web::get().to(health_handler))
            .route("/metrics", web::get().to(metrics_handler)),
    );
}
