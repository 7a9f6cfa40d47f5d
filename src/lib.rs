pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod models;
pub mod server;
pub mod session;
pub mod store;

pub use errors::{AttractorError, Result};
