//! Orchestration of one-shot sync jobs between a local path and a remote.

pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod store;

pub use config::Config;
pub use store::{JobStore, StoreError, SurrealJobStore};
