use std::convert::Infallible;

use hyper::{Body, Request, Response, StatusCode};

use super::AppState;
use crate::web::auth::{authenticate, AuthError};
use crate::web::response_helpers::json_error;
use crate::web::websocket::{handle_posture_websocket, SessionContext};
use crate::web::websocket_utils::{
    build_websocket_upgrade_response, calculate_websocket_accept_key, get_websocket_key,
    is_websocket_upgrade,
};
use crate::{sys_error, sys_info};

/// WebSocket upgrade handler for the posture stream.
///
/// Authentication happens here, before the upgrade, so a rejected client
/// gets a plain 401 instead of a socket that closes immediately.
pub async fn handle_posture_websocket_upgrade(
    req: Request<Body>,
    state: AppState,
) -> Result<Response<Body>, Infallible> {
    if !is_websocket_upgrade(&req) {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "WebSocket upgrade required",
        ));
    }
    let Some(key) = get_websocket_key(&req) else {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "Missing Sec-WebSocket-Key header",
        ));
    };

    let identity = match authenticate(state.config.auth.as_ref(), req.uri().query()) {
        Ok(identity) => identity,
        Err(AuthError::Expired) => {
            return Ok(json_error(StatusCode::UNAUTHORIZED, "token expired"));
        }
        Err(_) => return Ok(json_error(StatusCode::UNAUTHORIZED, "invalid token")),
    };

    let accept_key = calculate_websocket_accept_key(&key);
    let ctx = SessionContext {
        pool: state.pool.clone(),
        db: state.db.clone(),
        identity,
        config: state.config.session,
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => handle_posture_websocket(upgraded, ctx).await,
            Err(e) => sys_error!("[WS_POSTURE UPGRADE ERROR] {e}"),
        }
    });

    sys_info!("[WS_POSTURE] Upgrade accepted");
    Ok(build_websocket_upgrade_response(&accept_key))
}
