//! Hivelimit - Distributed Rate Limiting Service
//!
//! This crate decides whether a request identified by a namespace and an
//! identifier may proceed under a limit per fixed time window. Per-identifier
//! overrides replace the caller's limit, and counting runs through either a
//! fast eventually consistent strategy or a consistent one. Nodes can form a
//! peer-to-peer mesh to share counters without centralized storage.

pub mod app;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod mesh;
pub mod overrides;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
