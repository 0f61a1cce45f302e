//! Shared types for the textneck server and its inference workers.

pub mod command;
pub mod ipc;

pub use command::{ClientCommand, CommandError, Thresholds};
pub use ipc::{ControlMessage, FrameError, FrameRequest, WorkerReply};
