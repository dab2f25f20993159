//! `/api/settings` (spec §6): read/update the scrubbed settings document.

use actix_web::{web, HttpResponse};

use splitvpn_types::Settings;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/settings")
            .route("", web::get().to(get_settings))
            .route("", web::put().to(put_settings)),
    );
}

async fn get_settings(state: web::Data<AppState>, _user: AuthUser) -> HttpResponse {
    HttpResponse::Ok().json(state.settings.get_scrubbed().await)
}

async fn put_settings(
    state: web::Data<AppState>,
    _user: AuthUser,
    body: web::Json<Settings>,
) -> Result<HttpResponse, ApiError> {
    let updated = state.settings.update(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(updated.scrubbed()))
}
