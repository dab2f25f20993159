//! `/api/configs/*` (spec §6): the operational view over VPN profiles —
//! status, raw config text, and lifecycle actions — as distinct from the
//! structured CRUD surface at `/api/vpns` (`routes::vpns`).

use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/configs")
            .route("", web::get().to(list_configs))
            .route("/{name}/file", web::get().to(get_file))
            .route("/{name}/file", web::put().to(put_file))
            .route("/{name}/start", web::post().to(start))
            .route("/{name}/stop", web::post().to(stop))
            .route("/{name}/restart", web::post().to(restart))
            .route("/{name}/autostart", web::post().to(set_autostart)),
    );
}

#[derive(Debug, Serialize)]
struct ConfigsResponse {
    configs: Vec<String>,
    statuses: HashMap<String, bool>,
    errors: HashMap<String, String>,
}

async fn list_configs(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let profiles = state.vpns.list().await;
    let mut statuses = HashMap::new();
    let mut errors = HashMap::new();
    for profile in &profiles {
        match state.vpns.is_active(&profile.name).await {
            Ok(active) => {
                statuses.insert(profile.name.clone(), active);
            }
            Err(e) => {
                errors.insert(profile.name.clone(), e.to_string());
            }
        }
    }
    Ok(HttpResponse::Ok().json(ConfigsResponse {
        configs: profiles.into_iter().map(|p| p.name).collect(),
        statuses,
        errors,
    }))
}

#[derive(Debug, Serialize)]
struct FileResponse {
    content: String,
}

async fn get_file(
    state: web::Data<AppState>,
    _user: AuthUser,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let profile = state.vpns.get(&name).await?;
    Ok(HttpResponse::Ok().json(FileResponse {
        content: profile.config,
    }))
}

#[derive(Debug, Deserialize)]
struct PutFileRequest {
    content: String,
}

async fn put_file(
    state: web::Data<AppState>,
    _user: AuthUser,
    name: web::Path<String>,
    body: web::Json<PutFileRequest>,
) -> Result<HttpResponse, ApiError> {
    let existing = state.vpns.get(&name).await?;
    let mut req = crate::state::to_upsert_request(&existing);
    req.config = body.content.clone();
    let profile = state.vpns.update(&name, req).await?;
    Ok(HttpResponse::Ok().json(FileResponse {
        content: profile.config,
    }))
}

async fn start(state: web::Data<AppState>, _user: AuthUser, name: web::Path<String>) -> Result<HttpResponse, ApiError> {
    state.vpns.start_unit(&name).await?;
    broadcast_refresh(&state).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "ok": true })))
}

async fn stop(state: web::Data<AppState>, _user: AuthUser, name: web::Path<String>) -> Result<HttpResponse, ApiError> {
    state.vpns.stop_unit(&name).await?;
    broadcast_refresh(&state).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "ok": true })))
}

async fn restart(state: web::Data<AppState>, _user: AuthUser, name: web::Path<String>) -> Result<HttpResponse, ApiError> {
    state.vpns.restart_unit(&name).await?;
    broadcast_refresh(&state).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct AutostartRequest {
    enabled: bool,
}

async fn set_autostart(
    state: web::Data<AppState>,
    _user: AuthUser,
    name: web::Path<String>,
    body: web::Json<AutostartRequest>,
) -> Result<HttpResponse, ApiError> {
    state.vpns.set_autostart(&name, body.enabled).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "ok": true })))
}

/// Re-derive device hints and push a fresh `UpdatePayload` (spec §6 SSE
/// default `message`) so connected clients see the new status immediately
/// instead of waiting for the next periodic tick.
async fn broadcast_refresh(state: &AppState) {
    let _ = state.devices.refresh().await;
    state.broadcaster.publish_data("refresh");
}
