//! `/api/resolver/*` (spec §6, §4.2): out-of-band trigger and status.

use actix_web::{web, HttpResponse};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/resolver")
            .route("/run", web::post().to(run))
            .route("/status", web::get().to(status)),
    );
}

async fn run(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let groups = state.routing.list().await;
    state.resolver.trigger_now(&groups).await?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "ok": true })))
}

async fn status(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let status = state.resolver.status().await;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "lastRunAt": status.last_run_at,
        "durationMs": status.duration_ms,
        "errors": status.errors,
        "inProgress": status.in_progress,
        "countsByType": status.counts_by_type,
    })))
}
