//! Gateway server implementation

pub mod auth;
mod dispatch;
mod router;
mod server;

pub use dispatch::{Dispatched, McpHandler, Scope, render_prompt};
pub use router::{AppState, SERVICE_HEADER, SESSION_HEADER, create_router};
pub use server::Gateway;
