#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Obtura control plane core: tenant authorization, GitHub App integration
//! and build dispatch.

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod github;
pub mod models;
pub mod routes;
pub mod state;
pub mod store;
