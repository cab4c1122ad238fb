//! queryferry executes user-submitted SQL against remote databases,
//! serializes the result sets to spool files, and ships them to
//! user-designated hosts over SFTP. The heart of the crate is a
//! durable, database-backed, multi-tenant dispatcher that admits work
//! under a global cap and per-user caps, keeps the persisted lifecycle
//! state machine consistent across crashes, and reclaims orphaned jobs
//! at startup.

pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod export;
pub mod models;
pub mod runner;
pub mod transfer;
