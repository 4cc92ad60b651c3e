//! 调度核心依赖的外部协作者端口

pub mod data_mover;
pub mod messaging;
pub mod worker_transport;

pub use data_mover::*;
pub use messaging::*;
pub use worker_transport::*;
