// Eventjobs Infrastructure - SQLite Adapter
// Implements: ResourceStore

mod connection;
mod error;
mod migration;
mod resource_store;

pub use connection::create_pool;
pub use migration::run_migrations;
pub use resource_store::SqliteResourceStore;
