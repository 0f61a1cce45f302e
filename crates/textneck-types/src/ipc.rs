//! IPC protocol types for server ↔ inference worker communication.
//!
//! Uses JSON Lines (one JSON object per line) over stdin/stdout pipes.
//! Requests carry a correlation id; replies echo it back so a single
//! worker can serve many concurrent callers.

use serde::{Deserialize, Serialize};

/// Maximum length (in chars) of a traceback forwarded in a failure reply.
pub const MAX_TRACE_CHARS: usize = 800;

/// Frame request sent from server to worker via stdin.
///
/// Field order matters: `id` is serialized first so simple line-oriented
/// tools can pick it off without a JSON parser.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FrameRequest {
    pub id: String,
    pub image_b64: String,
    #[serde(default)]
    pub gray: bool,
}

/// Control messages that carry no correlation id.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Ping,
    Pong,
}

/// Reply sent from worker to server via stdout.
///
/// One flat struct covers success, failure and the uncorrelated
/// `bad_request` reply; absent fields are omitted on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkerReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<[f32; 3]>>,
    /// Source image width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Source image height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl WorkerReply {
    /// Successful reply. Coordinates are rounded to 4 decimals.
    pub fn success(id: impl Into<String>, points: Vec<[f32; 3]>, size: Option<(u32, u32)>) -> Self {
        let points: Vec<[f32; 3]> = points
            .into_iter()
            .map(|[x, y, z]| [round4(x), round4(y), round4(z)])
            .collect();
        Self {
            id: Some(id.into()),
            ok: true,
            n: Some(points.len()),
            points: Some(points),
            width: size.map(|(w, _)| w),
            height: size.map(|(_, h)| h),
            ..Self::default()
        }
    }

    pub fn failure(id: Option<String>, error: FrameError) -> Self {
        Self {
            id,
            ok: false,
            error: Some(error.as_str().to_string()),
            ..Self::default()
        }
    }

    /// `exception` failure carrying a (truncated) trace.
    pub fn exception(id: Option<String>, trace: &str) -> Self {
        Self {
            trace: Some(truncate_trace(trace)),
            ..Self::failure(id, FrameError::Exception)
        }
    }

    /// Reply sent for a line that could not be parsed at all.
    pub fn bad_request() -> Self {
        Self::failure(None, FrameError::BadRequest)
    }

    /// Error kind of a failed reply, if it is one of the known kinds.
    pub fn error_kind(&self) -> Option<FrameError> {
        self.error.as_deref().and_then(FrameError::parse)
    }
}

/// Per-frame error taxonomy. None of these are fatal to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameError {
    DecodeFailed,
    BadRequest,
    Exception,
    WriteFailed,
    Timeout,
    WorkerExited,
}

impl FrameError {
    pub const fn as_str(self) -> &'static str {
        match self {
            FrameError::DecodeFailed => "decode_failed",
            FrameError::BadRequest => "bad_request",
            FrameError::Exception => "exception",
            FrameError::WriteFailed => "write_failed",
            FrameError::Timeout => "timeout",
            FrameError::WorkerExited => "worker_exited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "decode_failed" => FrameError::DecodeFailed,
            "bad_request" => FrameError::BadRequest,
            "exception" => FrameError::Exception,
            "write_failed" => FrameError::WriteFailed,
            "timeout" => FrameError::Timeout,
            "worker_exited" => FrameError::WorkerExited,
            _ => return None,
        })
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round to 4 decimal places.
pub fn round4(v: f32) -> f32 {
    (v * 10_000.0).round() / 10_000.0
}

/// Truncate a trace to [`MAX_TRACE_CHARS`] characters.
pub fn truncate_trace(trace: &str) -> String {
    trace.chars().take(MAX_TRACE_CHARS).collect()
}
