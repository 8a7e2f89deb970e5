use axum::http::StatusCode;

/// Liveness probe
///
/// Returns 200 OK while the process serves requests. Never touches the
/// origin and is not rate-limited.
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "health"
)]
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
