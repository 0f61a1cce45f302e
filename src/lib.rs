//! Posture landmark streaming server.
//!
//! Clients stream camera frames over a WebSocket; frames are dispatched to a
//! pool of inference worker processes and per-frame posture measurements are
//! streamed back.

pub mod web;
