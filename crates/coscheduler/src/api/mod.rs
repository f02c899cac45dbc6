//! HTTP control surface.

mod errors;
mod handlers;
mod server;
mod types;

pub use errors::ControlError;
pub use server::build_routes;
pub use server::ControlServer;
pub use types::*;
