/// Request handlers for the session routes.
pub mod handlers;
/// Per-session streaming reverse proxy.
pub mod proxy;
/// Router assembly and shared handler state.
pub mod server;
/// Share tokens: repository trait, storage, and handlers.
pub mod share;
/// DTOs for the HTTP boundary.
pub mod types;

pub use server::{build_router, AppState};
