//! `/api/vpns/*` (spec §6): structured profile CRUD using `UpsertRequest`.

use actix_web::{web, HttpResponse};

use splitvpn_types::UpsertProfileRequest;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/vpns")
            .route("", web::get().to(list))
            .route("", web::post().to(create))
            .route("/{name}", web::get().to(get))
            .route("/{name}", web::put().to(update))
            .route("/{name}", web::delete().to(delete)),
    );
}

async fn list(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.vpns.list().await))
}

async fn get(
    state: web::Data<AppState>,
    _user: AuthUser,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.vpns.get(&name).await?))
}

async fn create(
    state: web::Data<AppState>,
    _user: AuthUser,
    body: web::Json<UpsertProfileRequest>,
) -> Result<HttpResponse, ApiError> {
    let profile = state.vpns.create(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(profile))
}

async fn update(
    state: web::Data<AppState>,
    _user: AuthUser,
    name: web::Path<String>,
    body: web::Json<UpsertProfileRequest>,
) -> Result<HttpResponse, ApiError> {
    let profile = state.vpns.update(&name, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(profile))
}

async fn delete(
    state: web::Data<AppState>,
    _user: AuthUser,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let warnings = state.vpns.delete(&name).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "warnings": warnings })))
}
