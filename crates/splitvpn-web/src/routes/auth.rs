//! Login/logout and in-session credential management (spec §6 "Auth").
//! `/login` and `/logout` are the public surface; `/api/auth/*` requires an
//! [`AuthUser`].

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::auth::{self, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/login", web::post().to(login))
        .route("/logout", web::post().to(logout))
        .service(
            web::scope("/api/auth")
                .route("/password", web::post().to(change_password))
                .route("/token", web::get().to(get_token))
                .route("/token", web::post().to(regenerate_token)),
        );
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    password: String,
}

/// `POST /login`: verify the password and, on success, set the session
/// cookie to the current bearer token (minting one on first login if the
/// instance has never had one).
async fn login(state: web::Data<AppState>, body: web::Json<LoginRequest>) -> Result<HttpResponse, ApiError> {
    let settings = state.settings.get().await;
    let hash = settings
        .auth_password_hash
        .as_deref()
        .ok_or_else(|| ApiError::conflict("no password has been set yet"))?;

    if !auth::verify_password(&body.password, hash) {
        return Err(ApiError::unauthorized());
    }

    let token = match settings.auth_token {
        Some(token) => token,
        None => {
            let token = auth::generate_token();
            state.settings.set_auth_token(token.clone()).await?;
            token
        }
    };

    Ok(HttpResponse::Ok()
        .cookie(auth::auth_cookie(&token))
        .json(serde_json::json!({ "ok": true })))
}

async fn logout() -> HttpResponse {
    HttpResponse::Ok()
        .cookie(auth::clear_auth_cookie())
        .json(serde_json::json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

/// `POST /api/auth/password`. When no password has ever been set, an empty
/// `current_password` is accepted so the instance can be provisioned.
async fn change_password(
    state: web::Data<AppState>,
    _user: AuthUser,
    body: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, ApiError> {
    let settings = state.settings.get().await;
    let authorized = match &settings.auth_password_hash {
        Some(hash) => auth::verify_password(&body.current_password, hash),
        None => body.current_password.is_empty(),
    };
    if !authorized {
        return Err(ApiError::unauthorized());
    }
    if body.new_password.is_empty() {
        return Err(ApiError::validation("new password must not be empty"));
    }

    let hash = auth::hash_password(&body.new_password)?;
    state.settings.set_auth_password_hash(hash).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: Option<String>,
}

async fn get_token(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let settings = state.settings.get().await;
    Ok(HttpResponse::Ok().json(TokenResponse {
        token: settings.auth_token,
    }))
}

async fn regenerate_token(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let token = auth::generate_token();
    state.settings.set_auth_token(token.clone()).await?;
    Ok(HttpResponse::Ok().json(TokenResponse { token: Some(token) }))
}
