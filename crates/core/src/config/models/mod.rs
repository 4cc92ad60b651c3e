pub mod app_config;
pub mod database;
pub mod logging;
pub mod scheduling;
pub mod staging;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use logging::LoggingConfig;
pub use scheduling::{OptimizerConfig, SchedulerConfig, WorkerDetectorConfig};
pub use staging::StagingConfig;
