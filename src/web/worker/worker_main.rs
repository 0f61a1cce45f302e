//! Worker process entry point.
//!
//! Runs as a child process spawned by the server. Reads one JSON request per
//! line from stdin, runs landmark inference, and writes exactly one JSON
//! reply line per request to stdout. All log output goes to stderr, which
//! the server drains.

use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};

use textneck_types::{ControlMessage, FrameError, FrameRequest, WorkerReply};

use super::inference::{InferError, LandmarkModel, MoveNetModel};
use crate::{sys_debug, sys_error, sys_info};

/// Run the worker process until stdin closes.
pub fn run_worker(model_path: &Path) -> Result<(), String> {
    sys_info!(
        "[WORKER] Starting inference worker (pid={}, model={})",
        std::process::id(),
        model_path.display()
    );

    let mut model = MoveNetModel::load(model_path).map_err(|e| e.to_string())?;
    sys_info!("[WORKER] Model loaded, waiting for frames...");

    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(&mut model, stdin.lock(), stdout.lock()).map_err(|e| format!("Worker IO error: {e}"))?;

    sys_info!("[WORKER] Stdin closed, exiting");
    Ok(())
}

/// Request/reply loop over arbitrary streams.
pub fn serve<M, R, W>(model: &mut M, input: R, mut output: W) -> io::Result<()>
where
    M: LandmarkModel + ?Sized,
    R: BufRead,
    W: Write,
{
    for chunk in input.split(b'\n') {
        let reply = match String::from_utf8(chunk?) {
            Ok(line) => handle_line(model, &line),
            Err(_) => {
                sys_debug!("[WORKER] Request line is not valid UTF-8");
                serde_json::to_string(&WorkerReply::bad_request()).ok()
            }
        };
        if let Some(reply) = reply {
            writeln!(output, "{reply}")?;
            output.flush()?;
        }
    }
    Ok(())
}

/// Produce the reply line for one request line. Blank lines get no reply.
pub fn handle_line<M: LandmarkModel + ?Sized>(model: &mut M, line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Ok(ControlMessage::Ping) = serde_json::from_str::<ControlMessage>(line) {
        return serde_json::to_string(&ControlMessage::Pong).ok();
    }

    let reply = match serde_json::from_str::<FrameRequest>(line) {
        Ok(request) => process_one(model, request),
        Err(e) => {
            sys_debug!("[WORKER] Bad request line: {e}");
            WorkerReply::bad_request()
        }
    };
    serde_json::to_string(&reply).ok()
}

fn process_one<M: LandmarkModel + ?Sized>(model: &mut M, request: FrameRequest) -> WorkerReply {
    let FrameRequest { id, image_b64, gray } = request;

    let Ok(frame) = general_purpose::STANDARD.decode(image_b64.as_bytes()) else {
        return WorkerReply::failure(Some(id), FrameError::DecodeFailed);
    };

    match panic::catch_unwind(AssertUnwindSafe(|| model.infer(&frame, gray))) {
        Ok(Ok(inference)) => WorkerReply::success(
            id,
            inference.points,
            Some((inference.width, inference.height)),
        ),
        Ok(Err(InferError::Decode(e))) => {
            sys_debug!("[WORKER] Frame {id} not decodable: {e}");
            WorkerReply::failure(Some(id), FrameError::DecodeFailed)
        }
        Ok(Err(e @ InferError::Model(_))) => {
            sys_error!("[WORKER] Inference failed for {id}: {e}");
            WorkerReply::exception(Some(id), &e.to_string())
        }
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic in inference".to_string()
            };
            sys_error!("[WORKER] Inference panicked for {id}: {msg}");
            WorkerReply::exception(Some(id), &format!("panic: {msg}"))
        }
    }
}
