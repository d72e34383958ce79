use axum::{
    extract::{Extension, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tower_cookies::Cookies;
use uuid::Uuid;

use super::AppContext;

pub const SESSION_COOKIE: &str = "streamify_user";

/// The authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: Uuid,
    pub email: String,
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response()
}

pub async fn auth_middleware(
    Extension(ctx): Extension<AppContext>,
    cookies: Cookies,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(user_id) = cookies
        .get(SESSION_COOKIE)
        .and_then(|c| c.value().parse::<Uuid>().ok())
    else {
        return unauthorized();
    };

    match ctx.users.find_user(user_id).await {
        Ok(Some(user)) => {
            tracing::Span::current()
                .record("user_id", tracing::field::display(user.id))
                .record("user_email", tracing::field::display(&user.email));
            request.extensions_mut().insert(CurrentUser {
                id: user.id,
                email: user.email,
            });
            next.run(request).await
        }
        Ok(None) => unauthorized(),
        Err(e) => {
            tracing::error!(error = %e, "failed to load session user");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal server error"})),
            )
                .into_response()
        }
    }
}
