//! Client → server control messages.
//!
//! Two surface forms are accepted and both parse into [`ClientCommand`]:
//! - plain-text commands `init[:angle[:shoulder_diff[:alert_frames]]]`,
//!   `pause`, `resume`, `stop` (case-insensitive, at most 64 chars)
//! - JSON objects `{"type":"config","gray":bool}` and `{"type":"ping"}`

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest plain-text command accepted.
pub const MAX_COMMAND_LEN: usize = 64;

/// Posture thresholds set by the `init` command.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Neck angle (degrees) at or above which a frame counts as poor posture.
    pub angle_deg: f64,
    /// Shoulder height difference (pixels) at or above which a frame counts as poor.
    pub shoulder_diff_px: f64,
    /// Consecutive poor frames before an alert is raised.
    pub alert_frames: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            angle_deg: 120.0,
            shoulder_diff_px: 20.0,
            alert_frames: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientCommand {
    Init(Thresholds),
    Pause,
    Resume,
    Stop,
    Config { gray: bool },
    Ping,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("command longer than {MAX_COMMAND_LEN} chars")]
    TooLong,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("invalid threshold value: {0}")]
    BadThreshold(String),
    #[error("invalid JSON control message")]
    InvalidJson,
}

#[derive(Deserialize)]
struct JsonControl {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    gray: Option<bool>,
}

impl ClientCommand {
    /// Parse one text message from the client.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let text = text.trim();
        if text.starts_with('{') {
            return parse_json(text);
        }
        if text.chars().count() > MAX_COMMAND_LEN {
            return Err(CommandError::TooLong);
        }

        let lower = text.to_ascii_lowercase();
        let mut parts = lower.split(':');
        let head = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        match head {
            "init" => parse_init(&rest).map(ClientCommand::Init),
            "pause" | "resume" | "stop" if !rest.is_empty() => {
                Err(CommandError::Unknown(text.to_string()))
            }
            "pause" => Ok(ClientCommand::Pause),
            "resume" => Ok(ClientCommand::Resume),
            "stop" => Ok(ClientCommand::Stop),
            _ => Err(CommandError::Unknown(text.to_string())),
        }
    }
}

fn parse_json(text: &str) -> Result<ClientCommand, CommandError> {
    let msg: JsonControl = serde_json::from_str(text).map_err(|_| CommandError::InvalidJson)?;
    match msg.kind.as_str() {
        "config" => Ok(ClientCommand::Config {
            gray: msg.gray.unwrap_or(false),
        }),
        "ping" => Ok(ClientCommand::Ping),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

fn parse_init(values: &[&str]) -> Result<Thresholds, CommandError> {
    if values.len() > 3 {
        return Err(CommandError::BadThreshold(values.join(":")));
    }

    let mut thresholds = Thresholds::default();
    if let Some(v) = values.first() {
        thresholds.angle_deg = parse_non_negative(v)?;
    }
    if let Some(v) = values.get(1) {
        thresholds.shoulder_diff_px = parse_non_negative(v)?;
    }
    if let Some(v) = values.get(2) {
        thresholds.alert_frames = v
            .trim()
            .parse::<u32>()
            .map_err(|_| CommandError::BadThreshold(v.to_string()))?;
    }
    Ok(thresholds)
}

fn parse_non_negative(v: &str) -> Result<f64, CommandError> {
    match v.trim().parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => Ok(n),
        _ => Err(CommandError::BadThreshold(v.to_string())),
    }
}
