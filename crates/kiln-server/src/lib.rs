//! HTTP facade for kiln.
//!
//! Exposes the dispatcher operations as a small JSON API so clients on other
//! hosts can process and retrieve against a shared artifact store. OIDs travel
//! as 40-character hex strings and artifact values as plain JSON.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use error::{ServerError, ServerResult};
pub use handler::AppState;
pub use router::build_router;
pub use server::KilnServer;
