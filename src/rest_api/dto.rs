//! Response bodies of the REST API

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub leader: bool,
}

/// One entity that currently has failed dispatches
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatusResponse {
    pub namespace: Option<String>,
    pub name: String,
    pub attempt: u32,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub leader: bool,
    pub tracked: usize,
    pub retrying: Vec<EntityStatusResponse>,
}
