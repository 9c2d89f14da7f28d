//! JSON command/control endpoint.

pub mod handlers;
pub mod protocol;
pub mod server;

pub use handlers::{ControlState, register_handlers};
pub use server::{CommandServer, Endpoint, Listener, Publisher};
