//! Bearer/cookie authentication (spec §6 "Auth"). Unlike
//! `wirewarden-api::auth`, there is no JWT: the server holds a single opaque
//! token in `Settings::auth_token` and a request is authenticated when its
//! `Authorization: Bearer <token>` header or `token` cookie matches it
//! exactly. `AuthUser` below plays the same FromRequest role as
//! `wirewarden-api::extract::AuthUser`.

use actix_web::cookie::time::Duration as CookieDuration;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::dev::Payload;
use actix_web::web::Data;
use actix_web::{FromRequest, HttpRequest};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use futures::future::LocalBoxFuture;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::ApiError;
use crate::state::AppState;

/// Marker extractor: succeeds only when the request carries the current
/// bearer/cookie token. Route handlers take `_user: AuthUser` to require
/// authentication without inspecting any fields.
#[derive(Debug)]
pub struct AuthUser;

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let state = req.app_data::<Data<AppState>>().cloned();
        let header_token = bearer_token(req);
        let cookie_token = req.cookie("token").map(|c| c.value().to_owned());

        Box::pin(async move {
            let state = state.ok_or_else(|| ApiError::internal("app state missing"))?;
            let settings = state.settings.get().await;
            let expected = match &settings.auth_token {
                Some(token) => token,
                // No password/token configured yet: the instance is unprovisioned
                // and every request is allowed through to reach the setup flow.
                None => return Ok(AuthUser),
            };

            let presented = header_token.or(cookie_token);
            match presented {
                Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
                    Ok(AuthUser)
                }
                _ => Err(ApiError::unauthorized()),
            }
        })
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn auth_cookie(token: &str) -> Cookie<'static> {
    Cookie::build("token", token.to_owned())
        .http_only(true)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(CookieDuration::days(365))
        .finish()
}

pub fn clear_auth_cookie() -> Cookie<'static> {
    Cookie::build("token", "")
        .http_only(true)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(CookieDuration::ZERO)
        .finish()
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::internal(format!("failed to hash password: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// 32 random bytes, hex-encoded, used both as the bearer token and as the
/// session cookie value (spec §6 "token get/regenerate").
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_and_rejects_different_length_or_content() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
        assert!(!constant_time_eq(b"abc123", b"abc124"));
        assert!(!constant_time_eq(b"abc", b"abc123"));
    }

    #[test]
    fn password_hash_round_trips_and_rejects_wrong_password() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn verify_password_rejects_malformed_hash() {
        assert!(!verify_password("anything", "not-a-phc-hash"));
    }

    #[test]
    fn generate_token_is_64_hex_chars_and_varies() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
