//! HTTP API surface.

pub mod handlers;
pub mod router;

pub use handlers::ErrorResponse;
pub use router::{create_router, start_server, ServerConfig};
