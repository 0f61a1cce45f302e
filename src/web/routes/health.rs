// Health check route handler

use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;

use crate::web::response_helpers::json_response;
use crate::web::worker::WorkerPool;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    workers: usize,
    live_workers: usize,
}

pub async fn handle(pool: &WorkerPool) -> Result<Response<Body>, Infallible> {
    let body = HealthResponse {
        status: "ok",
        workers: pool.len(),
        live_workers: pool.live_count(),
    };
    Ok(json_response(StatusCode::OK, &body))
}
