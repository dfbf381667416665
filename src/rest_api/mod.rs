//! REST API module for operational endpoints
//!
//! Provides health, dispatch status and Prometheus metrics over HTTP.

mod dto;
mod handlers;
mod server;

pub use dto::{EntityStatusResponse, HealthResponse, StatusResponse};
pub use server::{run_server, ApiState};
