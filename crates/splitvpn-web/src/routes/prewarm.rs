//! `/api/prewarm/*` (spec §6, §4.3).

use actix_web::{web, HttpResponse};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/prewarm")
            .route("/run", web::post().to(run))
            .route("/stop", web::post().to(stop))
            .route("/clear", web::post().to(clear))
            .route("/status", web::get().to(status)),
    );
}

async fn run(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let groups = state.routing.list().await;
    state.prewarm.run(&groups).await?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "ok": true })))
}

async fn stop(state: web::Data<AppState>, _user: AuthUser) -> HttpResponse {
    state.prewarm.cancel_run();
    HttpResponse::Accepted().json(serde_json::json!({ "ok": true }))
}

async fn clear(state: web::Data<AppState>, _user: AuthUser) -> HttpResponse {
    state.prewarm.clear().await;
    HttpResponse::Ok().json(serde_json::json!({ "ok": true }))
}

async fn status(state: web::Data<AppState>, _user: AuthUser) -> HttpResponse {
    let status = state.prewarm.status().await;
    HttpResponse::Ok().json(serde_json::json!({
        "lastRunAt": status.last_run_at,
        "durationMs": status.duration_ms,
        "inProgress": status.in_progress,
        "lastError": status.last_error,
        "resolvedCount": status.resolved_count,
    }))
}
