// Web server modules for the posture streaming server

pub mod auth;
pub mod config;
pub mod database;
pub mod frame_slot;
pub mod logger;
pub mod posture;
pub mod response_helpers;
pub mod routes;
pub mod websocket;
pub mod websocket_utils;
pub mod worker;
