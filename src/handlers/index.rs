use crate::error::AppError;
use actix_web::http::header::ContentType;
use actix_web::{HttpRequest, HttpResponse};

/// Browser client: microphone capture, playback and transcript display.
const INDEX_HTML: &str = include_str!("../../static/index.html");

pub async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(INDEX_HTML)
}

/// Fallback for routes that do not exist.
pub async fn not_found(req: HttpRequest) -> Result<HttpResponse, AppError> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}
