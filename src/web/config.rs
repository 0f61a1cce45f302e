//! Server configuration from command line flags and `TEXTNECK_*` env vars.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use super::auth::AuthConfig;
use super::worker::WorkerSpec;

#[derive(Parser, Debug, Clone)]
#[command(name = "textneck_web", about = "Posture landmark streaming server")]
pub struct ServerArgs {
    /// Run as an inference worker (internal; spawned by the server).
    #[arg(long, hide = true)]
    pub worker: bool,

    #[arg(long, env = "TEXTNECK_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "TEXTNECK_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Number of inference worker processes.
    #[arg(long, env = "TEXTNECK_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Per-frame inference deadline in milliseconds.
    #[arg(long, env = "TEXTNECK_ASK_TIMEOUT_MS", default_value_t = 500)]
    pub ask_timeout_ms: u64,

    /// How often dead workers are respawned (0 disables respawning).
    #[arg(long, env = "TEXTNECK_RESPAWN_INTERVAL_MS", default_value_t = 2000)]
    pub respawn_interval_ms: u64,

    /// Pose model (ONNX) loaded by each worker.
    #[arg(long, env = "TEXTNECK_MODEL", default_value = "assets/models/movenet_lightning.onnx")]
    pub model: PathBuf,

    /// Run this command as the worker instead of re-spawning this binary.
    /// Split on whitespace; the first word is the program.
    #[arg(long, env = "TEXTNECK_WORKER_COMMAND")]
    pub worker_command: Option<String>,

    #[arg(long, env = "TEXTNECK_DB_PATH", default_value = "assets/textneck.db")]
    pub db_path: PathBuf,

    /// Recorded measurements buffered per session before a database flush.
    #[arg(long, env = "TEXTNECK_FLUSH_THRESHOLD", default_value_t = 30)]
    pub flush_threshold: usize,

    #[arg(long, env = "TEXTNECK_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// off, error, warn, info, debug or trace.
    #[arg(long, env = "TEXTNECK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HS256 secret for WebSocket tokens. Auth is disabled when unset.
    #[arg(long, env = "TEXTNECK_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    #[arg(long, env = "TEXTNECK_JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    #[arg(long, env = "TEXTNECK_JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    #[arg(long, env = "TEXTNECK_JWT_USER_ID_CLAIM", default_value = "sub")]
    pub jwt_user_id_claim: String,
}

/// Resolved configuration shared by the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub workers: usize,
    pub worker_spec: WorkerSpec,
    pub session: SessionConfig,
    pub respawn_interval: Option<Duration>,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: LevelFilter,
    pub auth: Option<AuthConfig>,
}

/// Per-connection settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub ask_timeout: Duration,
    pub flush_threshold: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ask_timeout: Duration::from_millis(500),
            flush_threshold: 30,
        }
    }
}

impl ServerArgs {
    /// Unrecognized levels fall back to `info`.
    pub fn log_level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }

    pub fn into_config(self) -> Result<ServerConfig, String> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("Invalid listen address {}:{}: {e}", self.host, self.port))?;

        if self.workers == 0 {
            return Err("At least one worker is required".to_string());
        }

        let worker_spec = match self.worker_command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => {
                let mut words = cmd.split_whitespace();
                let program = words.next().unwrap_or_default();
                WorkerSpec::new(program).args(words)
            }
            _ => WorkerSpec::current_exe(&self.model)?,
        };

        let log_level = self.log_level();
        let auth = self.jwt_secret.map(|secret| AuthConfig {
            secret,
            issuer: self.jwt_issuer,
            audience: self.jwt_audience,
            user_id_claim: self.jwt_user_id_claim,
        });

        Ok(ServerConfig {
            addr,
            workers: self.workers,
            worker_spec,
            session: SessionConfig {
                ask_timeout: Duration::from_millis(self.ask_timeout_ms),
                flush_threshold: self.flush_threshold.max(1),
            },
            respawn_interval: (self.respawn_interval_ms > 0)
                .then(|| Duration::from_millis(self.respawn_interval_ms)),
            db_path: self.db_path,
            log_dir: self.log_dir,
            log_level,
            auth,
        })
    }
}
