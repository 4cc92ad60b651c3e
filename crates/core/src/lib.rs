pub mod config;
pub mod logging;

pub use config::models::*;
pub use logging::init_logging;
