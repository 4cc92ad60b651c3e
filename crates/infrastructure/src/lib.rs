pub mod data_mover;
pub mod database;
pub mod event_bus;
pub mod worker_transport;

pub use data_mover::*;
pub use database::*;
pub use event_bus::*;
pub use worker_transport::*;
