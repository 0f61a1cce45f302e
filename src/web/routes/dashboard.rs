// Dashboard route: read back a user's stored posture measurements

use std::convert::Infallible;

use hyper::{Body, Request, Response, StatusCode};
use serde::Serialize;

use super::AppState;
use crate::web::auth::{authenticate, query_param, AuthError, Identity};
use crate::web::database::posture_logs::PostureLogRow;
use crate::web::response_helpers::{json_error, json_response};
use crate::{sys_error, sys_warn};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Serialize)]
struct DashboardResponse {
    user_id: i64,
    count: usize,
    logs: Vec<PostureLogRow>,
}

/// `GET /dashboard?token=...&limit=N`: newest measurements first.
pub async fn handle(req: Request<Body>, state: AppState) -> Result<Response<Body>, Infallible> {
    let query = req.uri().query();

    let user_id = match authenticate(state.config.auth.as_ref(), query) {
        Ok(Identity::User(id)) => id,
        // Auth disabled: nothing is ever stored.
        Ok(Identity::Anonymous) => return Ok(json_error(StatusCode::NOT_FOUND, "Not Found")),
        Err(AuthError::Expired) => {
            return Ok(json_error(StatusCode::UNAUTHORIZED, "token expired"));
        }
        Err(_) => return Ok(json_error(StatusCode::UNAUTHORIZED, "invalid token")),
    };

    let limit = match query_param(query, "limit") {
        None => DEFAULT_LIMIT,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n.min(MAX_LIMIT),
            _ => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    "limit must be a positive integer",
                ))
            }
        },
    };

    let Some(db) = state.db.clone() else {
        sys_warn!("[DASHBOARD] Authenticated request but no database is open");
        return Ok(json_error(StatusCode::NOT_FOUND, "Not Found"));
    };

    match tokio::task::spawn_blocking(move || db.recent_logs(user_id, limit)).await {
        Ok(Ok(logs)) => Ok(json_response(
            StatusCode::OK,
            &DashboardResponse {
                user_id,
                count: logs.len(),
                logs,
            },
        )),
        Ok(Err(e)) => {
            sys_error!("[DASHBOARD] Failed to read measurements for user {user_id}: {e}");
            Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to load measurements",
            ))
        }
        Err(e) => {
            sys_error!("[DASHBOARD] Read task failed: {e}");
            Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to load measurements",
            ))
        }
    }
}
