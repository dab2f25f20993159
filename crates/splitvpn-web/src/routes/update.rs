//! `/api/update/*` (spec §6, §4.13): firmware update status/check/apply.

use actix_web::{web, HttpResponse};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/update")
            .route("/status", web::get().to(status))
            .route("/check", web::post().to(check))
            .route("/apply", web::post().to(apply)),
    );
}

async fn status(state: web::Data<AppState>, _user: AuthUser) -> HttpResponse {
    HttpResponse::Ok().json(state.updater.status().await)
}

async fn check(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let status = state.updater.check().await?;
    Ok(HttpResponse::Ok().json(status))
}

async fn apply(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let status = state.updater.apply().await?;
    Ok(HttpResponse::Ok().json(status))
}
