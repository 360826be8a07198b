//! SessionPlane control-plane library crate.
//!
//! # Purpose
//! Exposes the HTTP API surface, authentication providers, configuration and
//! tenant-scoping helpers for use by the binary and integration tests.
pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod observability;
pub mod tenancy;
