//! `/api/vpns/{name}/flow/*` (spec §6, §4.5).

use std::collections::HashMap;
use std::time::Duration;

use actix_web::{web, HttpResponse};

use splitvpn_core::flow::DeviceHint;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

const CONNTRACK_TIMEOUT: Duration = Duration::from_millis(1800);

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/vpns/{name}/flow")
            .route("/start", web::post().to(start))
            .route("/{session_id}/poll", web::post().to(poll))
            .route("/{session_id}/stop", web::post().to(stop)),
    );
}

async fn start(state: web::Data<AppState>, _user: AuthUser, name: web::Path<String>) -> Result<HttpResponse, ApiError> {
    state.vpns.get(&name).await?;
    let session_id = state.flow.start(&name).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "sessionId": session_id })))
}

async fn poll(
    state: web::Data<AppState>,
    _user: AuthUser,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (name, session_id) = path.into_inner();
    let profile = state.vpns.get(&name).await?;
    let rules = state.compile_profile_rules(&name, profile.fwmark).await;

    let mut device_hints = HashMap::new();
    for device in state.devices.list().await {
        if let Ok(ip) = device.ip.parse() {
            device_hints.insert(ip, DeviceHint { mac: Some(device.mac) });
        }
    }
    let local_interfaces = state.devices.local_interfaces().await;

    let snapshot = state
        .flow
        .poll(
            &name,
            &session_id,
            profile.fwmark,
            &rules,
            &device_hints,
            &local_interfaces,
            CONNTRACK_TIMEOUT,
        )
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "snapshot": snapshot })))
}

async fn stop(
    state: web::Data<AppState>,
    _user: AuthUser,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (name, session_id) = path.into_inner();
    state.flow.stop(&name, &session_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "ok": true })))
}
