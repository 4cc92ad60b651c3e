mod repository;
mod rows;
mod schema;
mod transaction;

pub use repository::SqliteRepository;
pub use schema::run_migrations;
pub use transaction::SqliteRepositoryTransaction;
