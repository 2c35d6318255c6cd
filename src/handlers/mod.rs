pub mod config;
pub mod signaling;

pub use config::*;
pub use signaling::*;
