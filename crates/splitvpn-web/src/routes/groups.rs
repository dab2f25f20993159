//! `/api/groups/*` and `/api/routing/asn-preview` (spec §6).

use actix_web::{web, HttpResponse};
use serde::Deserialize;

use splitvpn_types::UpsertGroupRequest;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/groups")
            .route("", web::get().to(list))
            .route("", web::post().to(create))
            .route("/{id}", web::get().to(get))
            .route("/{id}", web::put().to(update))
            .route("/{id}", web::delete().to(delete)),
    )
    .route("/api/routing/asn-preview", web::post().to(asn_preview));
}

async fn list(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.routing.list().await))
}

async fn get(
    state: web::Data<AppState>,
    _user: AuthUser,
    id: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.routing.get(*id).await?))
}

async fn create(
    state: web::Data<AppState>,
    _user: AuthUser,
    body: web::Json<UpsertGroupRequest>,
) -> Result<HttpResponse, ApiError> {
    let group = state.routing.create(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(group))
}

async fn update(
    state: web::Data<AppState>,
    _user: AuthUser,
    id: web::Path<i64>,
    body: web::Json<UpsertGroupRequest>,
) -> Result<HttpResponse, ApiError> {
    let group = state.routing.update(*id, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(group))
}

async fn delete(
    state: web::Data<AppState>,
    _user: AuthUser,
    id: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    state.routing.delete(*id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct AsnPreviewRequest {
    asns: Vec<String>,
}

async fn asn_preview(
    state: web::Data<AppState>,
    _user: AuthUser,
    body: web::Json<AsnPreviewRequest>,
) -> Result<HttpResponse, ApiError> {
    let items = state.resolver.asn_preview(&body.asns).await?;
    let total_entries_v4: usize = items.iter().map(|i| i.entries_v4).sum();
    let total_entries_v6: usize = items.iter().map(|i| i.entries_v6).sum();
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "items": items.into_iter().map(|i| serde_json::json!({
            "asn": i.asn,
            "entriesV4": i.entries_v4,
            "entriesV6": i.entries_v6,
        })).collect::<Vec<_>>(),
        "totalEntriesV4": total_entries_v4,
        "totalEntriesV6": total_entries_v6,
    })))
}
