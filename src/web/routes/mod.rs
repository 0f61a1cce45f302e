// Route handler modules

pub mod dashboard;
pub mod health;
pub mod posture;

use std::convert::Infallible;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};

use crate::web::config::ServerConfig;
use crate::web::database::SharedDatabase;
use crate::web::response_helpers::{cors_preflight, json_error};
use crate::web::worker::SharedWorkerPool;

/// Shared server state handed to every request.
#[derive(Clone)]
pub struct AppState {
    pub pool: SharedWorkerPool,
    pub db: Option<SharedDatabase>,
    pub config: Arc<ServerConfig>,
}

pub async fn handle_request(
    req: Request<Body>,
    state: AppState,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => health::handle(&state.pool).await,
        (&Method::GET, "/dashboard") => dashboard::handle(req, state).await,
        (&Method::GET, "/ws/posture") => posture::handle_posture_websocket_upgrade(req, state).await,
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not Found")),
    }
}
