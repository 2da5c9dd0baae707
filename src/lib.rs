//! Serving layer for the NVDA forecast models: artifact discovery, an
//! immutable model registry, inference dispatch and an axum HTTP API.

pub mod config;
pub mod error;
pub mod ml;
pub mod telemetry;
pub mod web;
