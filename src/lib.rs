pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod openapi;
pub mod repo;
pub mod routes;
pub mod storage; // media collaborator backends
pub mod rate_limit; // in-memory rate limiting

#[cfg(not(any(feature = "inmem-store", feature = "postgres-store")))]
compile_error!("enable at least one of the `inmem-store` or `postgres-store` features");

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
