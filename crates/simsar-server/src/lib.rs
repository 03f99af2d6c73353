pub mod config;
pub mod intake;
mod server;

pub use config::*;
pub use intake::*;
pub use server::{build_api_router, serve, DynIntakeProvider, ServerError};
