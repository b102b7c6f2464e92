use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};

pub const OWNER_HEADER: &str = "x-owner-id";

/// Opaque requester identity attached to each authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

pub async fn owner_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let owner = req
        .headers()
        .get(OWNER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|o| !o.is_empty() && o.len() <= 128)
        .map(|o| Owner(o.to_string()));

    match owner {
        Some(owner) => {
            req.extensions_mut().insert(owner);
            Ok(next.run(req).await)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}
