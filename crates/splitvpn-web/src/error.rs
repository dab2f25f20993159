//! HTTP error translation (spec §7): every component error category maps to
//! a status code without the web layer needing to know the originating
//! cause, mirroring `wirewarden-api::error::ApiError` but driven by the
//! shared [`ErrorCategory`] taxonomy instead of one enum per route module.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use splitvpn_types::{Categorized, ErrorCategory};

#[derive(Debug)]
pub struct ApiError {
    category: ErrorCategory,
    message: String,
    status_override: Option<u16>,
}

impl ApiError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status_override: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn unauthorized() -> Self {
        let mut err = Self::new(ErrorCategory::Conflict, "unauthorized");
        err.status_override = Some(401);
        err
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl<E> From<E> for ApiError
where
    E: Categorized + std::fmt::Display,
{
    fn from(err: E) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
            status_override: None,
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        let code = self.status_override.unwrap_or_else(|| self.category.http_status());
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({ "error": self.message }))
    }
}
