use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;

/// Guard for run-control routes. With no internal token configured the
/// service is assumed to sit on loopback and stays open; once a token is
/// set, every mutating run-control request must present it.
pub async fn require_operator(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.internal_token.as_deref() else {
        return next.run(req).await;
    };

    if let Some(header) = req.headers().get("x-forge-internal-token") {
        if let Ok(val) = header.to_str() {
            if val == expected {
                return next.run(req).await;
            }
        }
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "Missing or invalid x-forge-internal-token header"
        })),
    )
        .into_response()
}
