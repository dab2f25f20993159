//! `/api/backup` (spec §6, §4.6): export as a downloadable JSON snapshot,
//! import from either a raw JSON body or a `multipart/form-data` upload.

use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures::{StreamExt, TryStreamExt};

use splitvpn_types::BackupSnapshot;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/backup")
            .route("", web::get().to(export))
            .route("", web::post().to(import_json))
            .route("/upload", web::post().to(import_multipart)),
    );
}

async fn export(state: web::Data<AppState>, _user: AuthUser) -> HttpResponse {
    let snapshot = state.backup.export().await;
    HttpResponse::Ok()
        .insert_header(("Content-Disposition", "attachment; filename=\"backup.json\""))
        .json(snapshot)
}

async fn import_json(
    state: web::Data<AppState>,
    _user: AuthUser,
    body: web::Json<BackupSnapshot>,
) -> Result<HttpResponse, ApiError> {
    let warnings = state.backup.import(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "warnings": warnings })))
}

async fn import_multipart(
    state: web::Data<AppState>,
    _user: AuthUser,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let mut contents = Vec::new();
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| ApiError::validation(format!("invalid multipart body: {e}")))?
    {
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| ApiError::validation(format!("invalid multipart chunk: {e}")))?;
            contents.extend_from_slice(&chunk);
        }
    }

    let snapshot: BackupSnapshot = serde_json::from_slice(&contents)
        .map_err(|e| ApiError::validation(format!("invalid backup file: {e}")))?;
    let warnings = state.backup.import(snapshot).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "warnings": warnings })))
}
