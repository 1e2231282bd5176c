//! Corral: control plane for agentapi worker sessions.
//!
//! Each session binds one client to one long-lived worker process exposing
//! the agentapi HTTP interface. Corral allocates the worker (local process
//! or Kubernetes Deployment), reverse-proxies per-session HTTP/SSE traffic
//! to it, and tears it down on demand.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// HTTP API: router, handlers, reverse proxy, shares.
pub mod api;
/// Caller identity and session ownership checks.
pub mod auth;
/// Execution backends (local process, Kubernetes) behind one trait.
pub mod backends;
/// Application configuration loading.
pub mod config;
/// Core session domain types and the in-memory registry.
pub mod core;
/// Worker environment composition (role/team/tag/request layers).
pub mod env;
/// Background surveillance: session monitor and process reaper.
pub mod monitor;
/// Notification sink for session lifecycle events.
pub mod notify;
