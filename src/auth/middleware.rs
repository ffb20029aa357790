use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::{debug, instrument, warn};

use crate::shared::{AppError, AppState};

/// JWT authentication middleware - validates the Authorization Bearer header and adds the
/// authenticated `Principal` to the request.
/// Usage: .layer(middleware::from_fn_with_state(app_state.clone(), auth::jwt_auth))
/// Handlers can then extract `Extension(principal): Extension<Principal>`.
#[instrument(skip(state, req, next))]
pub async fn jwt_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .ok_or_else(|| {
            warn!("Missing Authorization header in request");
            AppError::Unauthorized("Missing authorization header".to_string())
        })?;

    if !auth_header.starts_with("Bearer ") {
        warn!("Invalid Authorization header format (expected Bearer token)");
        return Err(AppError::Unauthorized(
            "Invalid authorization header format".to_string(),
        ));
    }

    let principal = state.credentials.authenticate(auth_header).await?;

    debug!(
        username = %principal.username,
        role = %principal.role,
        uri = %req.uri(),
        "Authenticated request"
    );

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
