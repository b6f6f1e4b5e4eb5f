// SQLite storage layer with sqlx

pub mod models;
pub mod repositories;
pub mod seed;

pub use models::*;
pub use repositories::Database;
