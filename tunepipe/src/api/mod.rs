//! HTTP API server module.
//!
//! Exposes audio streaming, download, redirect, track listing and status
//! event endpoints.

pub mod error;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
